// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::TraceWriteError;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::File,
    io::Write,
    sync::{Arc, Mutex},
};
use testvisor_metadata::trace::{TraceEvent, TraceEventKind};

/// An append-only writer for a trace file.
///
/// Cloning a `TraceWriter` is cheap, and all clones share one file handle behind a lock. Each
/// record is written with a single `write_all` while the lock is held, so lines from concurrent
/// writers never interleave.
///
/// The file is opened in append mode and never truncated: records left behind by a previous,
/// crashed attempt are preserved.
#[derive(Clone, Debug)]
pub struct TraceWriter {
    path: Utf8PathBuf,
    file: Arc<Mutex<File>>,
}

impl TraceWriter {
    /// Opens `path` for appending, creating it if it doesn't exist.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, TraceWriteError> {
        let path = path.into();
        let file = File::options()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|error| TraceWriteError::Open {
                path: path.clone(),
                error,
            })?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// The path of the trace file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Appends an event stamped with the current time.
    pub fn write(&self, kind: TraceEventKind) -> Result<(), TraceWriteError> {
        self.write_event(&TraceEvent::now(kind))
    }

    /// Appends an event.
    ///
    /// Once this returns successfully, the full line is visible to readers of the file.
    pub fn write_event(&self, event: &TraceEvent) -> Result<(), TraceWriteError> {
        let mut line = serde_json::to_vec(event).map_err(TraceWriteError::Serialize)?;
        line.push(b'\n');

        // A poisoned lock only means another writer panicked between records: every record is
        // written with a single call, so the file is still line-consistent.
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|error| TraceWriteError::Write {
                path: self.path.clone(),
                error,
            })
    }

    /// Flushes the trace file to disk.
    pub fn sync(&self) -> Result<(), TraceWriteError> {
        let file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.sync_all().map_err(|error| TraceWriteError::Write {
            path: self.path.clone(),
            error,
        })
    }
}
