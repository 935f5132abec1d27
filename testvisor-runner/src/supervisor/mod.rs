// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a test command under supervision.
//!
//! A [`Supervisor`] runs one or more attempts of a test command. Each attempt goes through the
//! same sequence of states:
//!
//! 1. The work directory is prepared, and a `NOT_LAUNCHED` placeholder is recorded in the trace
//!    file for every expected test.
//! 2. An isolated filesystem view is created, with data roots linked or copied in and an
//!    optional ram drive.
//! 3. Recipes are started in declaration order. If one fails, the test command is not run.
//! 4. The test command is run in its own process group, with the memory and tmpfs monitors
//!    watching it. If it exceeds its timeout, it's sent each configured smooth shutdown signal,
//!    then `SIGTERM`, then `SIGKILL`.
//! 5. Started recipes are stopped in reverse order. This happens whatever the outcome of the
//!    earlier states.
//! 6. The output directory is archived, the trace is replayed into a
//!    [`Suite`](testvisor_metadata::Suite), and the meta result is written.
//!
//! After each attempt, the [`RetryPolicy`] decides whether to run another one. The results of
//! all attempts are merged with [`SuiteMerger`](crate::merge::SuiteMerger).

mod archive;
mod attempt;
mod isolation;
mod meta;
mod output_watcher;
mod recipe;
mod reserve;
mod retry;
mod terminate;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod os;
    } else if #[cfg(windows)] {
        #[path = "windows.rs"]
        mod os;
    } else {
        compile_error!("unsupported target platform");
    }
}

pub use archive::{ArchiveOptions, ArchiveSummary, archive_output_dir};
pub use attempt::{AttemptExit, AttemptOutcome};
pub use recipe::RecipePhase;
pub use retry::{AttemptSummary, FinishReason, RetryDecision, RetryPolicy};
pub use terminate::{EscalationSignal, TerminationStep};

use crate::{
    cancel::CancellationToken,
    config::{SupervisorConfig, ValidatedTimeouts},
    crash::CrashDiagnostics,
    errors::{ConfigValidationError, DisplayErrorChain, SupervisorError},
    helpers::rebase_path,
    merge::SuiteMerger,
    trace::{LiveStatusSink, StderrStatusSink},
};
use attempt::AttemptRunner;
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use std::{sync::Arc, time::Instant};
use swrite::{SWrite, swrite};
use testvisor_metadata::{ErrorOrigin, Status, Suite, TestvisorExitCode};
use tracing::{error, info, warn};

/// The environment variable holding the path to the trace file.
pub const TRACE_FILE_ENV: &str = "TESTVISOR_TRACE_FILE";

/// The environment variable holding the path to the output directory, which is archived after
/// the attempt.
pub const OUTPUT_DIR_ENV: &str = "TESTVISOR_OUTPUT_DIR";

/// The environment variable holding the path to the core registration log.
pub const CORE_REGISTRY_ENV: &str = "TESTVISOR_CORE_REGISTRY";

/// The environment variable holding the 1-based attempt number.
pub const ATTEMPT_ENV: &str = "TESTVISOR_ATTEMPT";

/// The environment variable holding the path to the ram drive, if one was requested.
pub const RAM_DRIVE_ENV: &str = "TESTVISOR_RAM_DRIVE";

/// Runs attempts of a test command until the retry policy says to stop.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    timeouts: ValidatedTimeouts,
    policy: RetryPolicy,
    cancel: CancellationToken,
    sink: Option<DebugIgnore<Arc<dyn LiveStatusSink>>>,
    crash: CrashDiagnostics,
}

/// The result of [`Supervisor::run`].
#[derive(Debug)]
pub struct SupervisorOutcome {
    /// Every attempt that was run, in order.
    pub attempts: Vec<AttemptOutcome>,
    /// The merged result of all attempts.
    pub suite: Suite,
    /// The exit code to report.
    pub exit_code: i32,
    /// The decision that ended the run.
    pub decision: RetryDecision,
}

impl Supervisor {
    /// Validates `config` and creates a new supervisor.
    ///
    /// If live status lines are enabled, they're written to standard error. Use
    /// [`Self::with_status_sink`] to send them elsewhere.
    pub fn new(
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigValidationError> {
        let timeouts = config.validate()?;
        if timeouts.clamped {
            warn!(
                declared = %humantime::format_duration(config.test_timeout),
                effective = %humantime::format_duration(timeouts.test_timeout),
                "test timeout lowered to fit the node timeout",
            );
        }
        let policy = RetryPolicy::new(&config)?;
        let sink = config.live_status.enabled.then(|| {
            let sink: Arc<dyn LiveStatusSink> =
                Arc::new(StderrStatusSink::new(&config.live_status));
            DebugIgnore(sink)
        });
        let crash = CrashDiagnostics::new(config.debugger_path.clone(), config.debugger_timeout);

        Ok(Self {
            config,
            timeouts,
            policy,
            cancel,
            sink,
            crash,
        })
    }

    /// Sends live status lines to `sink` instead of standard error, even if they're disabled in
    /// the config.
    pub fn with_status_sink(mut self, sink: Arc<dyn LiveStatusSink>) -> Self {
        self.sink = Some(DebugIgnore(sink));
        self
    }

    /// Returns the effective timeouts.
    pub fn timeouts(&self) -> &ValidatedTimeouts {
        &self.timeouts
    }

    /// Runs attempts until the retry policy says to stop, and merges their results.
    ///
    /// Retried attempts keep their files: the work directory is renamed to
    /// `<work-dir>.attempt-<N>` before the next attempt starts, and log paths in the attempt's
    /// suite are updated to match.
    pub async fn run(self) -> SupervisorOutcome {
        let start = Instant::now();
        let runner = AttemptRunner {
            config: &self.config,
            sink: self.sink.as_deref(),
            cancel: &self.cancel,
            crash: &self.crash,
        };

        let mut attempts: Vec<AttemptOutcome> = Vec::new();
        let mut attempt = 1;
        let decision = loop {
            let Some(timeout) = self.timeouts.attempt_timeout(start.elapsed()) else {
                warn!(attempt, "time budget used up, not starting another attempt");
                break RetryDecision::Finish(FinishReason::DeadlineExhausted);
            };
            info!(
                attempt,
                timeout = %humantime::format_duration(timeout),
                "starting attempt",
            );

            let mut outcome = runner.run(attempt, timeout).await;
            let summary = AttemptSummary {
                attempt,
                recipe_failed: !outcome.recipe_errors.is_empty(),
                exit_code: outcome.exit.exit_code(),
                stderr: std::mem::take(&mut outcome.stderr),
                deadline_exhausted: self.timeouts.attempt_timeout(start.elapsed()).is_none(),
                cancelled: self.cancel.is_cancelled(),
            };
            let mut decision = self.policy.decide(&summary);
            if !outcome.internal_errors.is_empty()
                && matches!(decision, RetryDecision::Retry { .. })
            {
                decision = RetryDecision::Finish(FinishReason::InternalError);
            }
            info!(attempt, exit = %outcome.exit, "attempt {decision}");

            if !matches!(decision, RetryDecision::Retry { .. }) {
                attempts.push(outcome);
                break decision;
            }
            let preserved = preserved_work_dir(&self.config.work_dir, attempt);
            if let Err(error) = preserve_work_dir(&mut outcome, &preserved) {
                error!("{}", DisplayErrorChain(&error));
                outcome.suite.add_error(
                    Status::Internal,
                    DisplayErrorChain(&error).to_string(),
                    ErrorOrigin::Infrastructure,
                );
                outcome.internal_errors.push(error);
                attempts.push(outcome);
                break RetryDecision::Finish(FinishReason::InternalError);
            }
            attempts.push(outcome);
            attempt += 1;
        };

        let suites = attempts.iter().map(|outcome| outcome.suite.clone()).collect();
        let mut suite = SuiteMerger::new(attempts.len().max(1)).merge(suites);
        if let RetryDecision::AbortInfrastructure { marker } = &decision {
            suite.add_error(
                Status::Internal,
                format!("infrastructure failure: test stderr contains `{marker}`"),
                ErrorOrigin::Infrastructure,
            );
        }

        let exit_code = final_exit_code(&attempts, &decision);
        let status = suite.rollup_status();
        info!(
            attempts = attempts.len(),
            %status,
            exit_code,
            "supervisor finished: {decision}",
        );

        SupervisorOutcome {
            attempts,
            suite,
            exit_code,
            decision,
        }
    }
}

/// The exit code for a run that ended with `decision`.
///
/// Earlier attempts only contribute internal errors: a failure that was retried away is kept in
/// the merged suite with its provenance, but the last attempt decides whether the tests failed.
fn final_exit_code(attempts: &[AttemptOutcome], decision: &RetryDecision) -> i32 {
    let Some(last) = attempts.last() else {
        return TestvisorExitCode::INFRASTRUCTURE_ERROR;
    };
    let internal = attempts
        .iter()
        .any(|outcome| !outcome.internal_errors.is_empty());
    let status = last.suite.rollup_status();
    if internal
        || status == Status::Internal
        || matches!(decision, RetryDecision::AbortInfrastructure { .. })
    {
        TestvisorExitCode::INFRASTRUCTURE_ERROR
    } else if status.is_failure() {
        TestvisorExitCode::TESTS_FAILED
    } else {
        TestvisorExitCode::OK
    }
}

/// Where the work directory of a retried attempt is moved to.
pub fn preserved_work_dir(work_dir: &Utf8Path, attempt: u32) -> Utf8PathBuf {
    let mut preserved = work_dir.as_str().trim_end_matches('/').to_owned();
    swrite!(preserved, ".attempt-{attempt}");
    preserved.into()
}

fn preserve_work_dir(outcome: &mut AttemptOutcome, to: &Utf8Path) -> Result<(), SupervisorError> {
    let from = outcome.work_dir.clone();
    if to.exists() {
        std::fs::remove_dir_all(to).map_err(|error| SupervisorError::PreserveWorkDir {
            from: from.clone(),
            to: to.to_owned(),
            error,
        })?;
    }
    std::fs::rename(&from, to).map_err(|error| SupervisorError::PreserveWorkDir {
        from: from.clone(),
        to: to.to_owned(),
        error,
    })?;
    info!(%from, %to, "preserved work directory of retried attempt");

    let rebase = |path: &mut Utf8PathBuf| {
        if let Some(rebased) = rebase_path(path, &from, to) {
            *path = rebased;
        }
    };
    outcome.suite.logs.values_mut().for_each(rebase);
    for chunk in &mut outcome.suite.chunks {
        chunk.logs.values_mut().for_each(rebase);
        for case in &mut chunk.tests {
            case.logs.values_mut().for_each(rebase);
        }
    }
    outcome.work_dir = to.to_owned();
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use crate::config::SupervisorConfig;
    use camino::Utf8Path;

    /// A config running `/bin/true` in `dir`, with `extra` appended to the TOML.
    pub(crate) fn config_with(dir: &Utf8Path, extra: &str) -> SupervisorConfig {
        let contents = format!(
            "command = [\"/bin/true\"]\n\
             cwd = \"{dir}\"\n\
             work-dir = \"{dir}/work\"\n\
             test-timeout = \"60s\"\n\
             {extra}"
        );
        let (mut config, ignored) =
            SupervisorConfig::from_toml_str(&contents).expect("test config is valid");
        assert!(ignored.is_empty(), "no ignored keys: {ignored:?}");
        config.live_status.enabled = false;
        config
    }
}
