// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{CrashDiagnosticsError, DisplayErrorChain};
use camino::{Utf8Path, Utf8PathBuf};
use std::{process::Stdio, time::Duration};
use tracing::{debug, info, warn};

/// The number of frames quoted in crash error messages.
pub const QUOTED_FRAMES: usize = 10;

const CORE_PATTERN_PATH: &str = "/proc/sys/kernel/core_pattern";

/// What crash diagnostics found for one process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CrashReport {
    /// The core file, if one was found.
    pub core: Option<Utf8PathBuf>,
    /// The file the backtrace was saved to, if one was produced.
    pub backtrace: Option<Utf8PathBuf>,
    /// The first frames of the backtrace of the crashing thread.
    pub frames: Vec<String>,
}

impl CrashReport {
    /// Describes the crash for an error message.
    pub fn describe(&self) -> String {
        let mut message = match &self.core {
            Some(core) => format!("core dumped to {core}"),
            None => "no core file found".to_owned(),
        };
        if !self.frames.is_empty() {
            message.push_str("\nbacktrace:\n");
            message.push_str(&self.frames.join("\n"));
        }
        message
    }
}

/// Locates core files and extracts backtraces from them.
#[derive(Clone, Debug)]
pub struct CrashDiagnostics {
    debugger: Option<Utf8PathBuf>,
    timeout: Duration,
    search_dirs: Vec<Utf8PathBuf>,
}

impl CrashDiagnostics {
    /// Creates a new instance.
    ///
    /// Without a debugger, cores are located but not symbolized.
    pub fn new(debugger: Option<Utf8PathBuf>, timeout: Duration) -> Self {
        let search_dirs = core_pattern_dir().into_iter().collect();
        Self {
            debugger,
            timeout,
            search_dirs,
        }
    }

    /// Collects diagnostics for a crashed process.
    ///
    /// `cwd` is searched for the core first, followed by the directory from the kernel's core
    /// pattern. The backtrace is saved to `backtrace_path`. Failures are logged and reflected in
    /// the report rather than returned.
    pub async fn collect(
        &self,
        pid: u32,
        binary: Option<&Utf8Path>,
        cwd: &Utf8Path,
        backtrace_path: &Utf8Path,
    ) -> CrashReport {
        let mut report = CrashReport::default();

        let mut dirs = vec![cwd.to_owned()];
        dirs.extend(self.search_dirs.iter().cloned());
        let Some(core) = find_core_file(pid, &dirs) else {
            info!(pid, %cwd, "no core file found for crashed process");
            return report;
        };
        info!(pid, %core, "found core file");
        report.core = Some(core.clone());

        let (Some(debugger), Some(binary)) = (&self.debugger, binary) else {
            debug!(pid, "no debugger or binary, skipping backtrace");
            return report;
        };

        match self.backtrace(debugger, binary, &core, backtrace_path).await {
            Ok(backtrace) => {
                report.frames = first_frames(&backtrace, QUOTED_FRAMES)
                    .into_iter()
                    .map(str::to_owned)
                    .collect();
                report.backtrace = Some(backtrace_path.to_owned());
            }
            Err(error) => {
                warn!(pid, "error extracting backtrace: {}", DisplayErrorChain(&error));
            }
        }
        report
    }

    /// Runs the debugger over a core file, saves its output to `out` and returns it.
    pub async fn backtrace(
        &self,
        debugger: &Utf8Path,
        binary: &Utf8Path,
        core: &Utf8Path,
        out: &Utf8Path,
    ) -> Result<String, CrashDiagnosticsError> {
        let mut cmd = tokio::process::Command::new(debugger);
        cmd.args(["-batch", "-ex", "thread apply all bt"])
            .arg(binary)
            .arg(core)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|error| CrashDiagnosticsError::DebuggerSpawn {
                debugger: debugger.to_owned(),
                error,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                return Err(CrashDiagnosticsError::DebuggerSpawn {
                    debugger: debugger.to_owned(),
                    error,
                });
            }
            Err(_) => {
                return Err(CrashDiagnosticsError::DebuggerTimeout {
                    debugger: debugger.to_owned(),
                    timeout: self.timeout,
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push_str("\n--- debugger stderr ---\n");
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        std::fs::write(out, &text).map_err(|error| CrashDiagnosticsError::WriteBacktrace {
            path: out.to_owned(),
            error,
        })?;
        Ok(text)
    }
}

/// Returns the directory cores are written to according to the kernel's core pattern, if it's
/// an absolute path.
fn core_pattern_dir() -> Option<Utf8PathBuf> {
    let pattern = std::fs::read_to_string(CORE_PATTERN_PATH).ok()?;
    parse_core_pattern_dir(&pattern)
}

fn parse_core_pattern_dir(pattern: &str) -> Option<Utf8PathBuf> {
    let pattern = pattern.trim();
    // A pattern starting with `|` pipes cores to a program.
    if !pattern.starts_with('/') {
        return None;
    }
    Utf8Path::new(pattern).parent().map(Utf8Path::to_owned)
}

/// Searches `dirs`, in order, for a core file belonging to `pid`.
///
/// Within a directory, `core.<pid>` is preferred, then any file with `<pid>` as a dot-separated
/// component of its name. A bare `core` is only accepted in the first directory, which is the
/// process's working directory.
pub fn find_core_file(pid: u32, dirs: &[Utf8PathBuf]) -> Option<Utf8PathBuf> {
    let pid_str = pid.to_string();
    let exact = format!("core.{pid}");

    for (index, dir) in dirs.iter().enumerate() {
        let Ok(entries) = dir.read_dir_utf8() else {
            continue;
        };
        let mut best: Option<(u8, Utf8PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let rank = if name == exact {
                0
            } else if name.split('.').any(|component| component == pid_str) {
                1
            } else if name == "core" && index == 0 {
                2
            } else {
                continue;
            };
            if !entry.file_type().is_ok_and(|ty| ty.is_file()) {
                continue;
            }
            if best.as_ref().is_none_or(|(best_rank, _)| rank < *best_rank) {
                best = Some((rank, entry.path().to_owned()));
            }
        }
        if let Some((_, path)) = best {
            return Some(path);
        }
    }
    None
}

/// Returns the first `count` frames of the first thread in a debugger backtrace.
pub fn first_frames(backtrace: &str, count: usize) -> Vec<&str> {
    backtrace
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with('#'))
        .take_while(|line| line.starts_with('#'))
        .take(count)
        .collect()
}
