// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{DisplayErrorChain, ReserveSpaceError};
use bytesize::ByteSize;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::File,
    io::{self, Write},
};
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 1024 * 1024;

/// A sentinel file that holds disk space while a test runs.
///
/// If the disk is too full to hold the sentinel, the attempt fails before the test starts rather
/// than partway through. The file is removed when the guard is dropped.
#[derive(Debug)]
pub(super) struct ReserveGuard {
    path: Utf8PathBuf,
}

impl ReserveGuard {
    pub(super) fn create(path: &Utf8Path, size: ByteSize) -> Result<Self, ReserveSpaceError> {
        let guard = Self {
            path: path.to_owned(),
        };
        // If writing fails partway, dropping the guard cleans up.
        guard.fill(size).map_err(|error| ReserveSpaceError {
            path: path.to_owned(),
            size,
            error,
        })?;
        debug!(%path, %size, "reserved disk space");
        Ok(guard)
    }

    fn fill(&self, size: ByteSize) -> io::Result<()> {
        let mut file = File::create(&self.path)?;
        let zeros = vec![0u8; CHUNK_SIZE];
        let mut remaining = size.as_u64();
        while remaining > 0 {
            let len = remaining.min(CHUNK_SIZE as u64) as usize;
            file.write_all(&zeros[..len])?;
            remaining -= len as u64;
        }
        // Force allocation now, not when the page cache is flushed.
        file.sync_all()
    }
}

impl Drop for ReserveGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(
                    path = %self.path,
                    "failed to remove reserved space sentinel: {}",
                    DisplayErrorChain(error),
                );
            }
        }
    }
}
