// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{MONITOR_POLL_INTERVAL, ProcessTree};
use crate::cancel::CancellationToken;
use bytesize::ByteSize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a [`MemoryMonitor`] observed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryReport {
    /// The highest total RSS seen across the process tree.
    pub peak_rss: ByteSize,

    /// The process tree at the time the peak was seen.
    pub peak_snapshot: ProcessTree,

    /// Whether the peak exceeded the configured limit.
    pub limit_exceeded: bool,
}

/// Samples the resident memory of a process tree.
#[derive(Debug)]
pub struct MemoryMonitor {
    stop: CancellationToken,
    handle: JoinHandle<MemoryReport>,
}

impl MemoryMonitor {
    /// Starts monitoring the tree rooted at `root_pid`. Must be called from within a Tokio
    /// runtime.
    pub fn spawn(
        root_pid: u32,
        limit: Option<ByteSize>,
        trim_cmdlines: bool,
        cancel: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let stop2 = stop.clone();
        let handle = tokio::spawn(async move {
            let mut report = MemoryReport::default();
            let mut warned = false;
            loop {
                let snapshot = match tokio::task::spawn_blocking(move || {
                    ProcessTree::snapshot(root_pid, trim_cmdlines)
                })
                .await
                {
                    Ok(snapshot) => snapshot,
                    Err(error) => {
                        debug!(%error, "memory sampling task failed");
                        ProcessTree::default()
                    }
                };

                let rss = ByteSize::b(snapshot.total_rss());
                if rss > report.peak_rss {
                    report.peak_rss = rss;
                    report.peak_snapshot = snapshot;
                }
                if let Some(limit) = limit {
                    if rss > limit {
                        report.limit_exceeded = true;
                        if !warned {
                            warn!(%rss, %limit, "test process tree exceeded its RAM limit");
                            warned = true;
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(MONITOR_POLL_INTERVAL) => {}
                    _ = stop2.cancelled() => break,
                    _ = cancel.cancelled() => break,
                }
            }
            report
        });
        Self { stop, handle }
    }

    /// Stops the monitor and returns what it observed.
    pub async fn stop(self) -> MemoryReport {
        self.stop.cancel();
        match self.handle.await {
            Ok(report) => report,
            Err(error) => {
                warn!(%error, "memory monitor task failed");
                MemoryReport::default()
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observes_own_process() {
        let monitor = MemoryMonitor::spawn(
            std::process::id(),
            Some(ByteSize::b(1)),
            true,
            CancellationToken::new(),
        );
        tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
        let report = monitor.stop().await;
        assert!(report.peak_rss > ByteSize::b(0));
        assert!(!report.peak_snapshot.is_empty());
        assert!(report.limit_exceeded);
    }

    #[tokio::test]
    async fn exited_process_reports_nothing() {
        let monitor = MemoryMonitor::spawn(u32::MAX - 1, None, true, CancellationToken::new());
        let report = monitor.stop().await;
        assert_eq!(report, MemoryReport::default());
    }
}
