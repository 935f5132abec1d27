// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testvisor.

use crate::supervisor::RecipePhase;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

pub use testvisor_metadata::errors::{PayloadError, StatusParseError, TraceEventParseError};

/// An error that occurred while parsing the supervisor config.
#[derive(Debug, Error)]
#[error("failed to parse supervisor config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// The supervisor configuration is internally inconsistent.
///
/// Configuration is validated once, before any attempt is started.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigValidationError {
    /// The test command is empty.
    #[error("the test command is empty")]
    EmptyCommand,

    /// The test timeout is zero.
    #[error("the test timeout must be greater than zero")]
    ZeroTestTimeout,

    /// The node timeout doesn't leave room for the safety margin.
    #[error(
        "node timeout ({}) must exceed the safety margin ({}) plus the startup delay ({})",
        humantime::format_duration(*node_timeout),
        humantime::format_duration(*margin),
        humantime::format_duration(*startup_delay)
    )]
    NodeTimeoutTooShort {
        /// The node timeout.
        node_timeout: Duration,
        /// The safety margin.
        margin: Duration,
        /// The startup delay already consumed.
        startup_delay: Duration,
    },

    /// The kill grace period is longer than the shutdown grace period.
    #[error(
        "kill grace period ({}) must not exceed the shutdown grace period ({})",
        humantime::format_duration(*kill),
        humantime::format_duration(*shutdown)
    )]
    KillGraceTooLong {
        /// The kill grace period.
        kill: Duration,
        /// The shutdown grace period.
        shutdown: Duration,
    },

    /// Two recipes share a name.
    #[error("recipe `{0}` is defined more than once")]
    DuplicateRecipe(String),

    /// A recipe name can't be used as a file name.
    #[error("recipe name `{0}` is invalid: must be non-empty and must not contain `/`")]
    InvalidRecipeName(String),

    /// The retry markers couldn't be compiled into a matcher.
    #[error("error compiling retry markers: {0}")]
    RetryMarkers(String),

    /// The chunk identity is out of range.
    #[error("chunk index {index} is out of range for {total} chunks")]
    InvalidChunk {
        /// The chunk index.
        index: u32,
        /// The total number of chunks.
        total: u32,
    },
}

/// An error that occurred while writing a trace event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TraceWriteError {
    /// The trace file couldn't be opened.
    #[error("error opening trace file `{path}`")]
    Open {
        /// The trace file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The event couldn't be serialized.
    #[error("error serializing trace event")]
    Serialize(#[source] serde_json::Error),

    /// The event couldn't be written.
    #[error("error writing to trace file `{path}`")]
    Write {
        /// The trace file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while reading a trace file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TraceReadError {
    /// The trace file couldn't be read.
    #[error("error reading trace file `{path}`")]
    Io {
        /// The trace file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A line in the trace file was malformed.
    #[error("malformed record at `{path}` line {line}")]
    Malformed {
        /// The trace file.
        path: Utf8PathBuf,
        /// The 1-based line number.
        line: usize,
        /// Why the line is malformed.
        #[source]
        source: MalformedLineError,
    },
}

/// Why a trace line couldn't be interpreted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MalformedLineError {
    /// The line isn't a valid trace record.
    #[error("invalid trace record")]
    Parse(#[source] serde_json::Error),

    /// The line isn't terminated by a newline, so it was cut off by a crash.
    #[error("line is not terminated (truncated write)")]
    Unterminated,
}

/// An error that occurred while running a recipe.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum RecipeError {
    /// The recipe's `start` command failed.
    #[error("recipe `{recipe}` failed to start: {status}\n{stderr_tail}")]
    StartupFailed {
        /// The name of the recipe.
        recipe: String,
        /// A description of how the recipe exited.
        status: String,
        /// A bounded snippet of the recipe's stderr.
        stderr_tail: String,
    },

    /// The recipe's `stop` command failed.
    #[error("recipe `{recipe}` failed to tear down: {status}\n{stderr_tail}")]
    TeardownFailed {
        /// The name of the recipe.
        recipe: String,
        /// A description of how the recipe exited.
        status: String,
        /// A bounded snippet of the recipe's stderr.
        stderr_tail: String,
    },

    /// The recipe couldn't be spawned.
    #[error("error spawning recipe `{recipe}` ({phase})")]
    Spawn {
        /// The name of the recipe.
        recipe: String,
        /// The phase that was being run.
        phase: RecipePhase,
        /// The underlying error.
        #[source]
        error: Arc<std::io::Error>,
    },

    /// The environment hand-off file couldn't be read.
    #[error("error reading recipe environment file `{path}`")]
    EnvFileRead {
        /// The environment file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: Arc<std::io::Error>,
    },

    /// A line in the environment hand-off file was malformed.
    #[error("malformed recipe environment file `{path}` at line {line}")]
    EnvFileParse {
        /// The environment file.
        path: Utf8PathBuf,
        /// The 1-based line number.
        line: usize,
        /// The underlying error.
        #[source]
        error: Arc<serde_json::Error>,
    },
}

impl RecipeError {
    /// Returns the name of the recipe this error is about, if any.
    pub fn recipe(&self) -> Option<&str> {
        match self {
            RecipeError::StartupFailed { recipe, .. }
            | RecipeError::TeardownFailed { recipe, .. }
            | RecipeError::Spawn { recipe, .. } => Some(recipe),
            RecipeError::EnvFileRead { .. } | RecipeError::EnvFileParse { .. } => None,
        }
    }

    /// Returns true if this is a teardown failure.
    pub fn is_teardown(&self) -> bool {
        match self {
            RecipeError::TeardownFailed { .. } => true,
            RecipeError::Spawn { phase, .. } => *phase == RecipePhase::Stop,
            _ => false,
        }
    }
}

/// An error that occurred while setting up the isolated filesystem view.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IsolationError {
    /// A view left behind by an earlier run couldn't be removed.
    #[error("error removing stale directory `{path}`")]
    RemoveStale {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A directory couldn't be created.
    #[error("error creating directory `{path}`")]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A data root couldn't be linked into the isolated view.
    #[error("error linking `{source_path}` to `{target}`")]
    Symlink {
        /// The source of the link.
        source_path: Utf8PathBuf,
        /// The link location.
        target: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A data root couldn't be copied into the isolated view.
    #[error("error copying `{source_path}` to `{target}`")]
    Copy {
        /// The copy source.
        source_path: Utf8PathBuf,
        /// The copy destination.
        target: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: cp_r::Error,
    },

    /// A data root target isn't a relative path.
    #[error("data root target `{0}` must be a relative path without `..` components")]
    InvalidTarget(Utf8PathBuf),
}

/// An error that occurred while reserving disk space.
#[derive(Debug, Error)]
#[error("error reserving {size} at `{path}`")]
#[non_exhaustive]
pub struct ReserveSpaceError {
    /// The sentinel file.
    pub path: Utf8PathBuf,
    /// The requested size.
    pub size: bytesize::ByteSize,
    /// The underlying error.
    #[source]
    pub error: std::io::Error,
}

/// An error that occurred while archiving an attempt's output directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// An error occurred while reading a file on disk.
    #[error("error writing {} `{path}` to archive", kind_str(*.is_dir))]
    InputFileRead {
        /// The file that could not be read.
        path: Utf8PathBuf,
        /// Whether this is a directory. `None` means the status was unknown.
        is_dir: Option<bool>,
        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// An error occurred while reading entries from a directory on disk.
    #[error("error reading directory entry from `{path}`")]
    DirEntryRead {
        /// The directory from which entries couldn't be read.
        path: Utf8PathBuf,
        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// A path in the output directory isn't valid UTF-8.
    #[error("path `{0}` in output directory isn't valid UTF-8")]
    NonUtf8Path(String),

    /// An error occurred while writing data to the output file.
    #[error("error writing to archive `{path}`")]
    OutputArchiveIo {
        /// The archive file.
        path: Utf8PathBuf,
        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },
}

fn kind_str(is_dir: Option<bool>) -> &'static str {
    match is_dir {
        Some(true) => "directory",
        Some(false) => "file",
        None => "path",
    }
}

/// An error that occurred while writing the meta-result file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetaResultWriteError {
    /// The meta result couldn't be serialized.
    #[error("error serializing meta result")]
    Serialize(#[source] serde_json::Error),

    /// The meta result couldn't be written.
    #[error("error writing meta result to `{path}`")]
    Write {
        /// The meta result file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while collecting crash diagnostics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CrashDiagnosticsError {
    /// The core registration log couldn't be read.
    #[error("error reading core registry `{path}`")]
    RegistryRead {
        /// The registry file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The debugger couldn't be spawned.
    #[error("error spawning debugger `{debugger}`")]
    DebuggerSpawn {
        /// The debugger.
        debugger: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The debugger didn't finish in time.
    #[error("debugger `{debugger}` timed out after {}", humantime::format_duration(*timeout))]
    DebuggerTimeout {
        /// The debugger.
        debugger: Utf8PathBuf,
        /// How long the debugger was given.
        timeout: Duration,
    },

    /// The backtrace couldn't be saved.
    #[error("error writing backtrace to `{path}`")]
    WriteBacktrace {
        /// The backtrace file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while starting the test command.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChildStartError {
    /// An output file for the child couldn't be created.
    #[error("error creating output file `{path}`")]
    OutputFile {
        /// The output file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: Arc<std::io::Error>,
    },

    /// The child couldn't be spawned.
    #[error("error spawning test command `{command}`")]
    Spawn {
        /// The command line, shell-quoted.
        command: String,
        /// The underlying error.
        #[source]
        error: Arc<std::io::Error>,
    },
}

/// An orchestration failure: something went wrong in the supervisor itself rather than in the
/// test.
///
/// Errors of this type are reported as `INTERNAL` and result in
/// [`TestvisorExitCode::INFRASTRUCTURE_ERROR`](testvisor_metadata::TestvisorExitCode::INFRASTRUCTURE_ERROR).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The attempt's work directory couldn't be prepared.
    #[error("error preparing work directory `{path}`")]
    WorkDir {
        /// The work directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A previous attempt's work directory couldn't be preserved.
    #[error("error preserving work directory `{from}` as `{to}`")]
    PreserveWorkDir {
        /// The work directory.
        from: Utf8PathBuf,
        /// The preserved location.
        to: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The isolated filesystem view couldn't be created.
    #[error("error setting up isolated environment")]
    Isolation(#[from] IsolationError),

    /// Disk space couldn't be reserved.
    #[error(transparent)]
    ReserveSpace(#[from] ReserveSpaceError),

    /// The test command couldn't be started.
    #[error(transparent)]
    ChildStart(#[from] ChildStartError),

    /// Waiting for the test command failed.
    #[error("error waiting for test command")]
    Wait(#[source] std::io::Error),

    /// The test command didn't exit after SIGKILL, so its exit status is unknown.
    #[error("test command (pid {pid}) did not exit within {waited:?} of being killed")]
    Unreaped {
        /// The test command's pid.
        pid: u32,
        /// How long the supervisor waited for the exit status.
        waited: std::time::Duration,
    },

    /// A trace event couldn't be written.
    #[error(transparent)]
    TraceWrite(#[from] TraceWriteError),

    /// The trace file couldn't be replayed.
    #[error(transparent)]
    TraceRead(#[from] TraceReadError),

    /// The output directory couldn't be archived.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The meta-result file couldn't be written.
    #[error(transparent)]
    MetaResult(#[from] MetaResultWriteError),

    /// The test's stderr couldn't be read for the retry decision.
    #[error("error reading stderr file `{path}`")]
    StderrRead {
        /// The stderr file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// Displays an error along with its chain of sources, on one line each.
pub(crate) struct DisplayErrorChain<E>(pub(crate) E);

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, "\n  caused by: {error}")?;
            source = error.source();
        }
        Ok(())
    }
}
