// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::MONITOR_POLL_INTERVAL;
use crate::cancel::CancellationToken;
use camino::Utf8PathBuf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a [`TmpfsMonitor`] observed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TmpfsReport {
    /// The highest number of bytes in use.
    pub peak_used_bytes: u64,

    /// The highest number of inodes in use.
    pub peak_used_inodes: u64,
}

/// Samples the usage of a private scratch filesystem.
#[derive(Debug)]
pub struct TmpfsMonitor {
    stop: CancellationToken,
    handle: JoinHandle<TmpfsReport>,
}

impl TmpfsMonitor {
    /// Starts sampling the filesystem mounted at `path`. Must be called from within a Tokio
    /// runtime.
    ///
    /// For a tmpfs in the child's private mount namespace, `path` should be seen through the
    /// child's root, i.e. `/proc/<pid>/root/<ram drive>`.
    pub fn spawn(path: Utf8PathBuf, cancel: CancellationToken) -> Self {
        let stop = CancellationToken::new();
        let stop2 = stop.clone();
        let handle = tokio::spawn(async move {
            let mut report = TmpfsReport::default();
            loop {
                let sample_path = path.clone();
                match tokio::task::spawn_blocking(move || imp::sample(&sample_path)).await {
                    Ok(Some((bytes, inodes))) => {
                        report.peak_used_bytes = report.peak_used_bytes.max(bytes);
                        report.peak_used_inodes = report.peak_used_inodes.max(inodes);
                    }
                    Ok(None) => {}
                    Err(error) => debug!(%error, "tmpfs sampling task failed"),
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
    pub async fn stop(self) -> TmpfsReport {
        self.stop.cancel();
        match self.handle.await {
            Ok(report) => report,
            Err(error) => {
                warn!(%error, "tmpfs monitor task failed");
                TmpfsReport::default()
            }
        }
    }
}

#[cfg(unix)]
mod imp {
    use camino::Utf8Path;
    use nix::sys::statvfs::statvfs;

    /// Returns the used bytes and inodes of the filesystem at `path`.
    pub(super) fn sample(path: &Utf8Path) -> Option<(u64, u64)> {
        let stat = statvfs(path.as_std_path()).ok()?;
        let used_blocks = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64);
        let used_bytes = used_blocks.saturating_mul(stat.fragment_size() as u64);
        let used_inodes = (stat.files() as u64).saturating_sub(stat.files_free() as u64);
        Some((used_bytes, used_inodes))
    }
}

#[cfg(not(unix))]
mod imp {
    use camino::Utf8Path;

    pub(super) fn sample(_path: &Utf8Path) -> Option<(u64, u64)> {
        None
    }
}
