// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{MalformedLineError, TraceReadError};
use camino::Utf8Path;
use testvisor_metadata::{
    ChunkId, Suite,
    trace::{ChunkEventValue, ChunkRef, SuiteEventValue, TraceEvent, TraceEventKind},
};
use tracing::{debug, warn};

/// How a replay treats malformed lines.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ReplayMode {
    /// Fail on the first malformed line.
    Strict,

    /// Skip malformed lines with a warning.
    #[default]
    Relaxed,
}

/// Counts of what a replay did.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplaySummary {
    /// The number of events applied.
    pub applied: usize,

    /// The number of malformed lines skipped. Always zero in strict mode.
    pub skipped: usize,
}

/// Rebuilds a [`Suite`] from a trace file.
///
/// Events are applied in file order, and each field present in an event replaces the current
/// value. Replaying the same bytes onto the same base always produces the same suite.
#[derive(Clone, Debug)]
pub struct TraceReplayer {
    mode: ReplayMode,
    default_chunk: ChunkId,
}

impl TraceReplayer {
    /// Creates a new replayer.
    pub fn new(mode: ReplayMode) -> Self {
        Self {
            mode,
            default_chunk: ChunkId::single(),
        }
    }

    /// Sets the chunk that events without a chunk identity apply to.
    pub fn default_chunk(mut self, chunk: ChunkId) -> Self {
        self.default_chunk = chunk;
        self
    }

    /// Replays the file at `path` onto `base`.
    ///
    /// A missing file is an empty stream.
    pub fn replay_path(
        &self,
        path: &Utf8Path,
        base: Suite,
    ) -> Result<(Suite, ReplaySummary), TraceReadError> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(%path, "trace file doesn't exist, treating as empty");
                Vec::new()
            }
            Err(error) => {
                return Err(TraceReadError::Io {
                    path: path.to_owned(),
                    error,
                });
            }
        };
        self.replay_bytes(path, &contents, base)
    }

    /// Replays trace contents onto `base`. `path` is only used for error messages.
    pub fn replay_bytes(
        &self,
        path: &Utf8Path,
        contents: &[u8],
        mut base: Suite,
    ) -> Result<(Suite, ReplaySummary), TraceReadError> {
        let mut summary = ReplaySummary::default();

        for (index, line) in split_lines(contents).enumerate() {
            let line_number = index + 1;
            let event = match parse_line(line) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(source) => match self.mode {
                    ReplayMode::Strict => {
                        return Err(TraceReadError::Malformed {
                            path: path.to_owned(),
                            line: line_number,
                            source,
                        });
                    }
                    ReplayMode::Relaxed => {
                        warn!(
                            %path,
                            line = line_number,
                            error = %source,
                            "skipping malformed trace record",
                        );
                        summary.skipped += 1;
                        continue;
                    }
                },
            };
            self.apply(&mut base, event);
            summary.applied += 1;
        }

        Ok((base, summary))
    }

    /// Applies a single event to `suite`.
    pub fn apply(&self, suite: &mut Suite, event: TraceEvent) {
        match event.kind {
            TraceEventKind::SuiteEvent(value) => apply_suite_event(suite, value),
            TraceEventKind::ChunkEvent(value) => {
                let chunk_id = self.resolve_chunk(&value.chunk);
                apply_chunk_event(suite, &chunk_id, value);
            }
            TraceEventKind::SubtestFinished(value) => {
                let chunk_id = self.resolve_chunk(&value.chunk);
                suite.chunk_mut(&chunk_id).upsert_test(value.case);
            }
        }
    }

    fn resolve_chunk(&self, chunk: &ChunkRef) -> ChunkId {
        chunk
            .chunk_id()
            .unwrap_or_else(|| self.default_chunk.clone())
    }
}

impl Default for TraceReplayer {
    fn default() -> Self {
        Self::new(ReplayMode::default())
    }
}

fn apply_suite_event(suite: &mut Suite, value: SuiteEventValue) {
    let SuiteEventValue {
        errors,
        logs,
        metrics,
        flaky,
    } = value;
    if let Some(errors) = errors {
        suite.errors = errors;
    }
    if let Some(logs) = logs {
        suite.logs = logs;
    }
    if let Some(metrics) = metrics {
        suite.metrics = metrics;
    }
    if let Some(flaky) = flaky {
        suite.flaky = flaky;
    }
}

fn apply_chunk_event(suite: &mut Suite, chunk_id: &ChunkId, value: ChunkEventValue) {
    let ChunkEventValue {
        chunk: _,
        errors,
        logs,
        metrics,
    } = value;
    let chunk = suite.chunk_mut(chunk_id);
    if let Some(errors) = errors {
        chunk.errors = errors;
    }
    if let Some(logs) = logs {
        chunk.logs = logs;
    }
    if let Some(metrics) = metrics {
        chunk.metrics = metrics;
    }
}

/// A line of trace input, and whether it was terminated by a newline.
pub(super) struct RawLine<'a> {
    pub(super) bytes: &'a [u8],
    pub(super) terminated: bool,
}

/// Splits `contents` into lines, including a final unterminated line if there is one.
pub(super) fn split_lines(contents: &[u8]) -> impl Iterator<Item = RawLine<'_>> {
    let mut rest = contents;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let bytes = &rest[..pos];
                rest = &rest[pos + 1..];
                Some(RawLine {
                    bytes,
                    terminated: true,
                })
            }
            None => {
                let bytes = rest;
                rest = &[];
                Some(RawLine {
                    bytes,
                    terminated: false,
                })
            }
        }
    })
}

/// Parses one line. Returns `Ok(None)` for blank lines.
pub(super) fn parse_line(line: RawLine<'_>) -> Result<Option<TraceEvent>, MalformedLineError> {
    if line.bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    if !line.terminated {
        return Err(MalformedLineError::Unterminated);
    }
    serde_json::from_slice(line.bytes)
        .map(Some)
        .map_err(MalformedLineError::Parse)
}
