// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    cancel::CancellationToken,
    monitor::MONITOR_POLL_INTERVAL,
    trace::{LiveStatusSink, TraceTailer},
};
use bytesize::ByteSize;
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// What the output watcher saw while the test ran.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(super) struct OutputWatcherReport {
    /// The number of live status lines emitted.
    pub(super) live_lines: usize,
    /// Logs that grew past the warning size.
    pub(super) oversized: Vec<Utf8PathBuf>,
}

/// Watches a running test's outputs: tails the trace file for live status, and warns when
/// stdout or stderr grow too large.
#[derive(Debug)]
pub(super) struct OutputWatcher {
    tailer: Option<TraceTailer>,
    size_watcher: Option<SizeWatcher>,
}

impl OutputWatcher {
    pub(super) fn spawn(
        trace_path: &Utf8Path,
        sink: Option<Arc<dyn LiveStatusSink>>,
        logs: Vec<Utf8PathBuf>,
        warn_size: Option<ByteSize>,
        cancel: &CancellationToken,
    ) -> Self {
        let tailer = sink.map(|sink| TraceTailer::spawn(trace_path, sink, cancel.clone()));
        let size_watcher = warn_size.map(|limit| SizeWatcher::spawn(logs, limit, cancel.clone()));
        Self {
            tailer,
            size_watcher,
        }
    }

    pub(super) async fn stop(self) -> OutputWatcherReport {
        let live_lines = match self.tailer {
            Some(tailer) => tailer.stop().await,
            None => 0,
        };
        let oversized = match self.size_watcher {
            Some(watcher) => watcher.stop().await,
            None => Vec::new(),
        };
        OutputWatcherReport {
            live_lines,
            oversized,
        }
    }
}

#[derive(Debug)]
struct SizeWatcher {
    stop: CancellationToken,
    handle: JoinHandle<Vec<Utf8PathBuf>>,
}

impl SizeWatcher {
    fn spawn(logs: Vec<Utf8PathBuf>, limit: ByteSize, cancel: CancellationToken) -> Self {
        let stop = CancellationToken::new();
        let stop2 = stop.clone();
        let handle = tokio::spawn(async move {
            let mut oversized = Vec::new();
            loop {
                check_sizes(&logs, limit, &mut oversized).await;
                tokio::select! {
                    _ = tokio::time::sleep(MONITOR_POLL_INTERVAL) => {}
                    _ = stop2.cancelled() => break,
                    _ = cancel.cancelled() => break,
                }
            }
            check_sizes(&logs, limit, &mut oversized).await;
            oversized
        });
        Self { stop, handle }
    }

    async fn stop(self) -> Vec<Utf8PathBuf> {
        self.stop.cancel();
        match self.handle.await {
            Ok(oversized) => oversized,
            Err(error) => {
                warn!(%error, "log size watcher task failed");
                Vec::new()
            }
        }
    }
}

async fn check_sizes(logs: &[Utf8PathBuf], limit: ByteSize, oversized: &mut Vec<Utf8PathBuf>) {
    for log in logs {
        if oversized.contains(log) {
            continue;
        }
        // The log may not exist yet.
        let Ok(metadata) = tokio::fs::metadata(log).await else {
            continue;
        };
        if metadata.len() > limit.as_u64() {
            warn!(
                path = %log,
                size = %ByteSize::b(metadata.len()),
                %limit,
                "test output is larger than the warning size",
            );
            oversized.push(log.clone());
        }
    }
}
