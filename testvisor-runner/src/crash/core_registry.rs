// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::CrashDiagnosticsError;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// The maximum number of registered cores processed per attempt, in addition to the test
/// command's own core.
pub const MAX_EXTRA_CORES: usize = 3;

/// A command in the core registration log.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreRegistryCommand {
    /// The process may dump a core.
    Add,
    /// An earlier registration for this process is moot.
    Drop,
}

/// One line of the core registration log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CoreRegistryEntry {
    /// What this entry does.
    pub cmd: CoreRegistryCommand,
    /// The process the entry is about.
    pub pid: u32,
    /// The binary the process runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<Utf8PathBuf>,
    /// The directory the process runs in, where its core is likely to land.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<Utf8PathBuf>,
}

/// A still-relevant registration resolved from the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreRegistration {
    /// The registered process.
    pub pid: u32,
    /// The binary the process runs.
    pub binary_path: Option<Utf8PathBuf>,
    /// The directory the process runs in.
    pub cwd: Option<Utf8PathBuf>,
}

/// The core registration log: an append-only file of [`CoreRegistryEntry`] JSON lines written by
/// processes that may dump a core.
#[derive(Clone, Debug)]
pub struct CoreRegistry {
    path: Utf8PathBuf,
}

impl CoreRegistry {
    /// Creates a handle to the log at `path`.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the log.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Resolves the most recent still-relevant registrations, up to `limit` of them.
    ///
    /// The log is read in reverse: a `drop` masks every earlier `add` for the same pid, and only
    /// the latest `add` for a pid counts. Malformed lines are skipped with a warning. A missing
    /// log has no registrations.
    pub fn resolve(&self, limit: usize) -> Result<Vec<CoreRegistration>, CrashDiagnosticsError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => {
                return Err(CrashDiagnosticsError::RegistryRead {
                    path: self.path.clone(),
                    error,
                });
            }
        };
        Ok(resolve_entries(&self.path, &contents, limit))
    }
}

fn resolve_entries(path: &Utf8Path, contents: &str, limit: usize) -> Vec<CoreRegistration> {
    let mut resolved = Vec::new();
    let mut settled: HashSet<u32> = HashSet::new();

    for (index, line) in contents.lines().enumerate().collect::<Vec<_>>().into_iter().rev() {
        if resolved.len() >= limit {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let entry: CoreRegistryEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%path, line = index + 1, %error, "skipping malformed core registration");
                continue;
            }
        };
        // The first entry seen for a pid (in reverse) decides its fate.
        if !settled.insert(entry.pid) {
            continue;
        }
        if entry.cmd == CoreRegistryCommand::Add {
            resolved.push(CoreRegistration {
                pid: entry.pid,
                binary_path: entry.binary_path,
                cwd: entry.cwd,
            });
        }
    }

    resolved
}
