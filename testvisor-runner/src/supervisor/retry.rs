// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{SupervisorConfig, elements::TestTags},
    errors::ConfigValidationError,
};
use aho_corasick::AhoCorasick;
use std::fmt;
use testvisor_metadata::TestSize;

/// What the retry policy needs to know about a finished attempt.
#[derive(Clone, Debug, Default)]
pub struct AttemptSummary {
    /// The 1-based attempt number.
    pub attempt: u32,
    /// Whether any recipe failed to start or stop.
    pub recipe_failed: bool,
    /// The exit code of the test command. Negative values are fatal signals.
    pub exit_code: i32,
    /// The captured stderr of the test command.
    pub stderr: Vec<u8>,
    /// Whether the overall time budget is used up.
    pub deadline_exhausted: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

/// The outcome of [`RetryPolicy::decide`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Run another attempt.
    Retry {
        /// The restart indicator found in stderr.
        indicator: String,
    },
    /// Stop here and report the results so far.
    Finish(FinishReason),
    /// Stop the whole run with an infrastructure error.
    AbortInfrastructure {
        /// The infrastructure marker found in stderr.
        marker: String,
    },
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDecision::Retry { indicator } => {
                write!(f, "retrying: found restart indicator `{indicator}`")
            }
            RetryDecision::Finish(reason) => write!(f, "finished: {reason}"),
            RetryDecision::AbortInfrastructure { marker } => {
                write!(f, "aborting: found infrastructure marker `{marker}`")
            }
        }
    }
}

/// Why no further attempt is made.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinishReason {
    /// A recipe failed. Recipe failures are never retried.
    RecipeFailed,
    /// The test wrote nothing to stderr.
    EmptyStderr,
    /// The test is tagged `no-restart`.
    NoRestartTag,
    /// The maximum number of restarts was reached.
    AttemptsExhausted,
    /// The test exited successfully.
    Succeeded,
    /// Stderr has no restart indicator.
    NoRestartIndicator,
    /// The overall time budget is used up.
    DeadlineExhausted,
    /// The run was cancelled.
    Cancelled,
    /// The supervisor itself failed during the attempt.
    InternalError,
}

impl FinishReason {
    /// A short description of this reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            FinishReason::RecipeFailed => "a recipe failed",
            FinishReason::EmptyStderr => "stderr is empty",
            FinishReason::NoRestartTag => "the test is tagged no-restart",
            FinishReason::AttemptsExhausted => "all restarts are used up",
            FinishReason::Succeeded => "the test succeeded",
            FinishReason::NoRestartIndicator => "no restart indicator in stderr",
            FinishReason::DeadlineExhausted => "the time budget is used up",
            FinishReason::Cancelled => "the run was cancelled",
            FinishReason::InternalError => "the supervisor hit an internal error",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a finished attempt should be retried.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_restarts: u32,
    no_restart: bool,
    large: bool,
    indicators: Matcher,
    markers: Matcher,
}

impl RetryPolicy {
    /// Builds the policy described by `config`.
    pub fn new(config: &SupervisorConfig) -> Result<Self, ConfigValidationError> {
        Self::with_parts(
            config.retry.max_restarts,
            config.test_tags(),
            config.size,
            &config.retry.restart_indicators,
            &config.retry.infrastructure_markers,
        )
    }

    fn with_parts(
        max_restarts: u32,
        tags: TestTags,
        size: TestSize,
        indicators: &[String],
        markers: &[String],
    ) -> Result<Self, ConfigValidationError> {
        Ok(Self {
            max_restarts,
            no_restart: tags.no_restart,
            large: size == TestSize::Large,
            indicators: Matcher::new(indicators)?,
            markers: Matcher::new(markers)?,
        })
    }

    /// Returns the decision for `summary`.
    ///
    /// Cancellation and the time budget are checked first. After that, a retry happens only if
    /// no recipe failed, stderr is non-empty, the test isn't tagged `no-restart`, restarts are
    /// left, the test failed, and stderr contains a restart indicator. For large tests, an
    /// infrastructure marker in stderr aborts the run instead.
    pub fn decide(&self, summary: &AttemptSummary) -> RetryDecision {
        if summary.cancelled {
            return RetryDecision::Finish(FinishReason::Cancelled);
        }
        if summary.deadline_exhausted {
            return RetryDecision::Finish(FinishReason::DeadlineExhausted);
        }
        if summary.recipe_failed {
            return RetryDecision::Finish(FinishReason::RecipeFailed);
        }
        if summary.stderr.is_empty() {
            return RetryDecision::Finish(FinishReason::EmptyStderr);
        }
        if self.no_restart {
            return RetryDecision::Finish(FinishReason::NoRestartTag);
        }
        if summary.attempt > self.max_restarts {
            return RetryDecision::Finish(FinishReason::AttemptsExhausted);
        }
        if summary.exit_code == 0 {
            return RetryDecision::Finish(FinishReason::Succeeded);
        }
        if self.large
            && let Some(marker) = self.markers.find(&summary.stderr)
        {
            return RetryDecision::AbortInfrastructure { marker };
        }
        match self.indicators.find(&summary.stderr) {
            Some(indicator) => RetryDecision::Retry { indicator },
            None => RetryDecision::Finish(FinishReason::NoRestartIndicator),
        }
    }
}

#[derive(Clone, Debug)]
struct Matcher {
    patterns: Vec<String>,
    automaton: AhoCorasick,
}

impl Matcher {
    fn new(patterns: &[String]) -> Result<Self, ConfigValidationError> {
        let automaton = AhoCorasick::new(patterns)
            .map_err(|error| ConfigValidationError::RetryMarkers(error.to_string()))?;
        Ok(Self {
            patterns: patterns.to_vec(),
            automaton,
        })
    }

    fn find(&self, haystack: &[u8]) -> Option<String> {
        self.automaton
            .find(haystack)
            .map(|found| self.patterns[found.pattern().as_usize()].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::elements::{DEFAULT_INFRASTRUCTURE_MARKERS, DEFAULT_RESTART_INDICATORS};
    use test_case::test_case;

    fn policy(no_restart: bool, size: TestSize) -> RetryPolicy {
        let indicators: Vec<_> = DEFAULT_RESTART_INDICATORS
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let markers: Vec<_> = DEFAULT_INFRASTRUCTURE_MARKERS
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let tags = TestTags {
            no_restart,
            ..TestTags::default()
        };
        RetryPolicy::with_parts(2, tags, size, &indicators, &markers).unwrap()
    }

    fn failed_attempt(attempt: u32, stderr: &str) -> AttemptSummary {
        AttemptSummary {
            attempt,
            exit_code: 1,
            stderr: stderr.as_bytes().to_vec(),
            ..AttemptSummary::default()
        }
    }

    #[test]
    fn retries_on_indicator() {
        let decision = policy(false, TestSize::Small)
            .decide(&failed_attempt(1, "bind: Address already in use\n"));
        assert_eq!(
            decision,
            RetryDecision::Retry {
                indicator: "Address already in use".to_owned()
            }
        );
    }

    #[test_case(
        AttemptSummary { cancelled: true, recipe_failed: true, ..failed_attempt(1, "Too many open files") },
        FinishReason::Cancelled
        ; "cancellation first"
    )]
    #[test_case(
        AttemptSummary { deadline_exhausted: true, ..failed_attempt(1, "Too many open files") },
        FinishReason::DeadlineExhausted
        ; "deadline"
    )]
    #[test_case(
        AttemptSummary { recipe_failed: true, ..failed_attempt(1, "Too many open files") },
        FinishReason::RecipeFailed
        ; "recipe failed"
    )]
    #[test_case(failed_attempt(1, ""), FinishReason::EmptyStderr ; "empty stderr")]
    #[test_case(failed_attempt(3, "Too many open files"), FinishReason::AttemptsExhausted ; "attempts exhausted")]
    #[test_case(
        AttemptSummary { exit_code: 0, ..failed_attempt(1, "Too many open files") },
        FinishReason::Succeeded
        ; "succeeded"
    )]
    #[test_case(failed_attempt(1, "assertion failed"), FinishReason::NoRestartIndicator ; "no indicator")]
    fn finishes(summary: AttemptSummary, expected: FinishReason) {
        assert_eq!(
            policy(false, TestSize::Small).decide(&summary),
            RetryDecision::Finish(expected)
        );
    }

    #[test]
    fn last_allowed_attempt_still_retries() {
        let attempt = failed_attempt(2, "Too many open files");
        let decision = policy(false, TestSize::Small).decide(&attempt);
        assert!(matches!(decision, RetryDecision::Retry { .. }), "{decision:?}");
    }

    #[test]
    fn no_restart_tag() {
        assert_eq!(
            policy(true, TestSize::Small).decide(&failed_attempt(1, "Too many open files")),
            RetryDecision::Finish(FinishReason::NoRestartTag)
        );
    }

    #[test]
    fn infrastructure_markers_only_for_large_tests() {
        let summary = failed_attempt(1, "write: No space left on device\nToo many open files\n");
        assert_eq!(
            policy(false, TestSize::Large).decide(&summary),
            RetryDecision::AbortInfrastructure {
                marker: "No space left on device".to_owned()
            }
        );
        assert!(matches!(
            policy(false, TestSize::Medium).decide(&summary),
            RetryDecision::Retry { .. }
        ));
    }
}
