// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::replay::{RawLine, parse_line};
use crate::{cancel::CancellationToken, config::elements::LiveStatusConfig};
use camino::{Utf8Path, Utf8PathBuf};
use owo_colors::{OwoColorize, Style};
use std::{
    collections::HashSet,
    io::{self, SeekFrom, Write},
    sync::{Arc, Mutex},
    time::Duration,
};
use testvisor_metadata::{Status, TestCaseId, trace::TraceEventKind};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// How often the tailer checks the trace file for new records.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A test that finished, as shown in live status output.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveStatusLine {
    /// The test.
    pub id: TestCaseId,
    /// The status it finished with.
    pub status: Status,
    /// The process that ran the test, if reported.
    pub pid: Option<u32>,
    /// The directory the test ran in, if reported.
    pub cwd: Option<Utf8PathBuf>,
}

/// Receives live status lines from a [`TraceTailer`].
pub trait LiveStatusSink: Send + Sync {
    /// Called once for every new `(test, status)` pair.
    fn emit(&self, line: &LiveStatusLine);
}

/// A [`LiveStatusSink`] that writes formatted lines to a writer, standard error by default.
pub struct StderrStatusSink {
    writer: Mutex<Box<dyn Write + Send>>,
    styles: Styles,
    show_pid: bool,
    show_cwd: bool,
}

impl StderrStatusSink {
    /// Creates a sink writing to standard error.
    pub fn new(config: &LiveStatusConfig) -> Self {
        Self::with_writer(config, Box::new(io::stderr()))
    }

    /// Creates a sink writing to the given writer.
    pub fn with_writer(config: &LiveStatusConfig, writer: Box<dyn Write + Send>) -> Self {
        let mut styles = Styles::default();
        if config.colorize {
            styles.colorize();
        }
        Self {
            writer: Mutex::new(writer),
            styles,
            show_pid: config.show_pid,
            show_cwd: config.show_cwd,
        }
    }

    fn write_line(&self, writer: &mut dyn Write, line: &LiveStatusLine) -> io::Result<()> {
        let style = self.styles.for_status(line.status);
        // Pad before styling so escape codes don't count towards the width.
        let status = format!("{:>12}", line.status.as_str().to_ascii_uppercase());
        write!(writer, "  {}  {}", status.style(style), line.id)?;
        if self.show_pid
            && let Some(pid) = line.pid
        {
            write!(writer, " [pid {pid}]")?;
        }
        if self.show_cwd
            && let Some(cwd) = &line.cwd
        {
            write!(writer, " [{cwd}]")?;
        }
        writeln!(writer)
    }
}

impl LiveStatusSink for StderrStatusSink {
    fn emit(&self, line: &LiveStatusLine) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(error) = self
            .write_line(&mut **writer, line)
            .and_then(|()| writer.flush())
        {
            debug!(%error, "error writing live status line");
        }
    }
}

impl std::fmt::Debug for StderrStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StderrStatusSink")
            .field("styles", &self.styles)
            .field("show_pid", &self.show_pid)
            .field("show_cwd", &self.show_cwd)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Styles {
    pass: Style,
    fail: Style,
    skip: Style,
    other: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.other = Style::new().dimmed();
    }

    fn for_status(&self, status: Status) -> Style {
        match status {
            Status::Good => self.pass,
            Status::Fail | Status::Crashed | Status::Timeout | Status::Internal => self.fail,
            Status::Skipped | Status::Flaky => self.skip,
            _ => self.other,
        }
    }
}

/// Follows a trace file while it is being written, emitting a live status line for every test
/// as it finishes.
///
/// The tailer never blocks the writer: it only reads newly appended bytes on each poll and
/// tolerates the file not existing yet. A given `(test, status)` pair is emitted at most once.
#[derive(Debug)]
pub struct TraceTailer {
    stop: CancellationToken,
    handle: JoinHandle<usize>,
}

impl TraceTailer {
    /// Starts tailing `path`. Must be called from within a Tokio runtime.
    ///
    /// The tailer runs until [`stop`](Self::stop) is called or `cancel` is cancelled.
    pub fn spawn(
        path: impl Into<Utf8PathBuf>,
        sink: Arc<dyn LiveStatusSink>,
        cancel: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let mut state = TailState::new(path.into(), sink);
        let stop2 = stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {
                        state.poll().await;
                    }
                    _ = stop2.cancelled() => break,
                    _ = cancel.cancelled() => break,
                }
            }
            // Pick up anything written between the last poll and the stop request.
            state.poll().await;
            state.emitted
        });
        Self { stop, handle }
    }

    /// Stops the tailer after one final read, and returns the number of lines emitted.
    pub async fn stop(self) -> usize {
        self.stop.cancel();
        match self.handle.await {
            Ok(emitted) => emitted,
            Err(error) => {
                warn!(%error, "trace tailer task failed");
                0
            }
        }
    }
}

struct TailState {
    path: Utf8PathBuf,
    sink: Arc<dyn LiveStatusSink>,
    offset: u64,
    buffer: Vec<u8>,
    seen: HashSet<(TestCaseId, Status)>,
    emitted: usize,
}

impl TailState {
    fn new(path: Utf8PathBuf, sink: Arc<dyn LiveStatusSink>) -> Self {
        Self {
            path,
            sink,
            offset: 0,
            buffer: Vec::new(),
            seen: HashSet::new(),
            emitted: 0,
        }
    }

    async fn poll(&mut self) {
        match read_from(&self.path, self.offset).await {
            Ok(new_bytes) => {
                self.offset += new_bytes.len() as u64;
                self.buffer.extend_from_slice(&new_bytes);
            }
            Err(error) => {
                debug!(path = %self.path, %error, "error reading trace file, will retry");
                return;
            }
        }
        self.process_complete_lines();
    }

    fn process_complete_lines(&mut self) {
        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();

        for bytes in complete.split(|&b| b == b'\n') {
            let line = RawLine {
                bytes,
                terminated: true,
            };
            let event = match parse_line(line) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(error) => {
                    debug!(path = %self.path, %error, "ignoring malformed trace record");
                    continue;
                }
            };
            // Placeholders aren't shown: they mark tests that haven't finished.
            if let TraceEventKind::SubtestFinished(value) = event.kind
                && value.case.status.is_launched()
            {
                let key = (value.case.id.clone(), value.case.status);
                if self.seen.insert(key) {
                    self.sink.emit(&LiveStatusLine {
                        id: value.case.id,
                        status: value.case.status,
                        pid: value.pid,
                        cwd: value.cwd,
                    });
                    self.emitted += 1;
                }
            }
        }
    }
}

/// Reads everything in `path` past `offset`. A missing file reads as empty.
async fn read_from(path: &Utf8Path, offset: u64) -> io::Result<Vec<u8>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceWriter;
    use camino_tempfile::Utf8TempDir;
    use std::io::Write as _;
    use testvisor_metadata::{TestCase, trace::SubtestFinishedValue};

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<LiveStatusLine>>,
    }

    impl LiveStatusSink for RecordingSink {
        fn emit(&self, line: &LiveStatusLine) {
            self.lines.lock().unwrap().push(line.clone());
        }
    }

    fn finished(name: &str, status: Status) -> TraceEventKind {
        let mut value =
            SubtestFinishedValue::new(TestCase::new(TestCaseId::new("suite", name), status));
        value.pid = Some(1234);
        TraceEventKind::SubtestFinished(Box::new(value))
    }

    #[tokio::test]
    async fn tails_new_records_once() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        let sink = Arc::new(RecordingSink::default());

        // The file doesn't exist yet when tailing starts.
        let tailer = TraceTailer::spawn(&path, sink.clone(), CancellationToken::new());
        tokio::time::sleep(TAIL_POLL_INTERVAL * 2).await;

        let writer = TraceWriter::open(&path).unwrap();
        writer.write(finished("a", Status::Good)).unwrap();
        writer.write(finished("a", Status::Good)).unwrap();
        writer.write(finished("b", Status::Fail)).unwrap();

        // A record written in two halves is only processed once complete.
        let line = serde_json::to_string(&testvisor_metadata::trace::TraceEvent::now(finished(
            "c",
            Status::Skipped,
        )))
        .unwrap();
        let (first, second) = line.split_at(line.len() / 2);
        {
            let mut file = std::fs::File::options().append(true).open(&path).unwrap();
            file.write_all(first.as_bytes()).unwrap();
        }
        tokio::time::sleep(TAIL_POLL_INTERVAL * 3).await;
        {
            let mut file = std::fs::File::options().append(true).open(&path).unwrap();
            file.write_all(second.as_bytes()).unwrap();
            file.write_all(b"\n").unwrap();
        }

        let emitted = tailer.stop().await;
        assert_eq!(emitted, 3);

        let lines = sink.lines.lock().unwrap();
        let names: Vec<_> = lines.iter().map(|line| line.id.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(lines[0].pid, Some(1234));
        assert_eq!(lines[2].status, Status::Skipped);
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        let cancel = CancellationToken::new();
        let sink = Arc::new(RecordingSink::default());

        let writer = TraceWriter::open(&path).unwrap();
        writer.write(finished("a", Status::Good)).unwrap();

        let tailer = TraceTailer::spawn(&path, sink.clone(), cancel.clone());
        cancel.cancel();
        let emitted = tokio::time::timeout(Duration::from_secs(5), tailer.stop())
            .await
            .expect("tailer stopped promptly");
        assert_eq!(emitted, 1, "final drain picks up existing records");
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stderr_sink_format() {
        let buf = SharedBuf::default();
        let config = LiveStatusConfig {
            enabled: true,
            colorize: false,
            show_pid: true,
            show_cwd: true,
        };
        let sink = StderrStatusSink::with_writer(&config, Box::new(buf.clone()));
        sink.emit(&LiveStatusLine {
            id: TestCaseId::new("suite", "test_a"),
            status: Status::NotLaunched,
            pid: Some(42),
            cwd: Some("/work".into()),
        });
        sink.emit(&LiveStatusLine {
            id: TestCaseId::new("suite", "test_b"),
            status: Status::Good,
            pid: None,
            cwd: None,
        });

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            output,
            "  NOT_LAUNCHED  suite::test_a [pid 42] [/work]\n          GOOD  suite::test_b\n"
        );
    }
}
