// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::MetaResultWriteError;
use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::Utf8Path;
use std::io::{self, Write};
use testvisor_metadata::MetaResult;

/// Atomically writes the meta result to `path`.
///
/// Observers either see no file or the complete record.
pub(super) fn write_meta_result(
    path: &Utf8Path,
    meta: &MetaResult,
) -> Result<(), MetaResultWriteError> {
    let json = serde_json::to_vec_pretty(meta).map_err(MetaResultWriteError::Serialize)?;
    let file = AtomicFile::new(path, OverwriteBehavior::AllowOverwrite);
    file.write(|f| {
        f.write_all(&json)?;
        f.write_all(b"\n")
    })
    .map_err(|error| MetaResultWriteError::Write {
        path: path.to_owned(),
        error: match error {
            atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => error,
        },
    })
}

/// Removes a stale meta result left over from a previous run.
pub(super) fn remove_meta_result(path: &Utf8Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}
