// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::elements::{
    DataRoot, LiveStatusConfig, RecipeConfig, RetryConfig, ShutdownSignal, TestTags,
    deserialize_retry_config,
};
use crate::errors::{ConfigParseError, ConfigParseErrorKind, ConfigValidationError};
use bytesize::ByteSize;
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    time::Duration,
};
use testvisor_metadata::{ChunkId, TestCaseId, TestSize};
use tracing::warn;

/// The part of the node timeout that is reserved for the supervisor's own bookkeeping
/// (finalization, archiving, crash diagnostics).
pub const NODE_TIMEOUT_SAFETY_MARGIN: Duration = Duration::from_secs(30);

/// The default time a test is given to exit after each smooth shutdown signal.
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The default time a test is given to exit after SIGTERM, before it's killed.
pub const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// The default time the debugger is given to produce a backtrace.
pub const DEFAULT_DEBUGGER_TIMEOUT: Duration = Duration::from_secs(60);

/// The default size of stderr snippets in error messages.
pub const DEFAULT_STDERR_SNIPPET_LIMIT: ByteSize = ByteSize::kib(8);

/// The name used for configs that don't come from a file.
const INLINE_CONFIG_NAME: &str = "<inline>";

/// The immutable configuration for a [`Supervisor`](crate::supervisor::Supervisor).
///
/// Constructed once (typically through [`Self::from_path`]) and passed by value into the
/// supervisor, which shares it with every component.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupervisorConfig {
    /// The test command line. Must not be empty.
    pub command: Vec<String>,

    /// The directory to run the test command in.
    pub cwd: Utf8PathBuf,

    /// The per-attempt work directory. Logs, the trace file and the meta result live here.
    pub work_dir: Utf8PathBuf,

    /// Extra environment variables for the test command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// How long a single attempt may run.
    #[serde(with = "humantime_serde")]
    pub test_timeout: Duration,

    /// The timeout of the whole node running the supervisor, if any.
    #[serde(default, with = "humantime_serde")]
    pub node_timeout: Option<Duration>,

    /// How much of the node timeout was already consumed before the supervisor started.
    #[serde(default, with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Signals the test handles to shut down smoothly, sent in order on timeout.
    #[serde(default)]
    pub smooth_shutdown_signals: Vec<ShutdownSignal>,

    /// How long to wait after each smooth shutdown signal.
    #[serde(default = "default_shutdown_grace_period", with = "humantime_serde")]
    pub shutdown_grace_period: Duration,

    /// How long to wait after SIGTERM before sending SIGKILL.
    #[serde(default = "default_kill_grace_period", with = "humantime_serde")]
    pub kill_grace_period: Duration,

    /// Recipes, started in order and stopped in reverse order.
    #[serde(default)]
    pub recipes: Vec<RecipeConfig>,

    /// The build root, passed to recipes.
    #[serde(default)]
    pub build_root: Option<Utf8PathBuf>,

    /// The source root, passed to recipes.
    #[serde(default)]
    pub source_root: Option<Utf8PathBuf>,

    /// The debugger used to symbolize core files.
    #[serde(default)]
    pub debugger_path: Option<Utf8PathBuf>,

    /// How long the debugger may take per core file.
    #[serde(default = "default_debugger_timeout", with = "humantime_serde")]
    pub debugger_timeout: Duration,

    /// The RAM limit for the test's process tree.
    #[serde(default)]
    pub ram_limit: Option<ByteSize>,

    /// The size of the private tmpfs. If set, a ram drive is created for the test.
    #[serde(default)]
    pub tmpfs_size: Option<ByteSize>,

    /// Disk space to reserve with a sentinel file while the test runs.
    #[serde(default)]
    pub reserve_space: Option<ByteSize>,

    /// If true, exceeding resource limits is a test failure rather than an annotation.
    #[serde(default)]
    pub strict_limits: bool,

    /// Declared tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Declared size.
    #[serde(default)]
    pub size: TestSize,

    /// The kind of test, e.g. `pytest`.
    #[serde(default)]
    pub test_type: String,

    /// The project path of the test target.
    #[serde(default)]
    pub project_path: String,

    /// A descriptor of the platform.
    #[serde(default)]
    pub platform: String,

    /// Test data exposed in the isolated filesystem view.
    #[serde(default)]
    pub data_roots: Vec<DataRoot>,

    /// The tests expected to run, used to create placeholders.
    #[serde(default)]
    pub expected_tests: Vec<TestCaseId>,

    /// The chunk this execution covers.
    #[serde(default)]
    pub chunk: ChunkId,

    /// The retry policy.
    #[serde(default, deserialize_with = "deserialize_retry_config")]
    pub retry: RetryConfig,

    /// Whether to archive the output directory at the end of each attempt.
    #[serde(default = "default_true")]
    pub archive_output: bool,

    /// If set, regular files larger than this are truncated in the archive.
    #[serde(default)]
    pub archive_truncate_files: Option<ByteSize>,

    /// If true, entries that aren't regular files or directories are left out of the archive.
    #[serde(default)]
    pub archive_drop_non_regular: bool,

    /// Live status display settings.
    #[serde(default)]
    pub live_status: LiveStatusConfig,

    /// The size of head+tail stderr snippets in error messages.
    #[serde(default = "default_stderr_snippet_limit")]
    pub stderr_snippet_limit: ByteSize,

    /// Warn once if stdout or stderr grows larger than this.
    #[serde(default)]
    pub output_warn_size: Option<ByteSize>,
}

fn default_shutdown_grace_period() -> Duration {
    DEFAULT_SHUTDOWN_GRACE_PERIOD
}

fn default_kill_grace_period() -> Duration {
    DEFAULT_KILL_GRACE_PERIOD
}

fn default_debugger_timeout() -> Duration {
    DEFAULT_DEBUGGER_TIMEOUT
}

fn default_stderr_snippet_limit() -> ByteSize {
    DEFAULT_STDERR_SNIPPET_LIMIT
}

fn default_true() -> bool {
    true
}

/// Timeouts computed by [`SupervisorConfig::validate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTimeouts {
    /// The timeout for a single attempt.
    pub test_timeout: Duration,

    /// The total budget for all attempts, measured from when the supervisor starts. `None` if
    /// there's no node timeout.
    pub total_budget: Option<Duration>,

    /// True if the declared test timeout was lowered to fit the node timeout.
    pub clamped: bool,
}

impl ValidatedTimeouts {
    /// Returns the timeout for an attempt starting `elapsed` after the supervisor started.
    ///
    /// Returns `None` if the budget is exhausted.
    pub fn attempt_timeout(&self, elapsed: Duration) -> Option<Duration> {
        match self.total_budget {
            Some(budget) => {
                let remaining = budget.checked_sub(elapsed).filter(|d| !d.is_zero())?;
                Some(remaining.min(self.test_timeout))
            }
            None => Some(self.test_timeout),
        }
    }
}

impl SupervisorConfig {
    /// Parses a config from a TOML string.
    ///
    /// Returns the config along with the set of keys that were present but not understood.
    pub fn from_toml_str(
        contents: &str,
    ) -> Result<(SupervisorConfig, BTreeSet<String>), ConfigParseError> {
        let builder = Config::builder().add_source(File::from_str(contents, FileFormat::Toml));
        Self::build_and_deserialize_config(builder)
            .map_err(|kind| ConfigParseError::new(INLINE_CONFIG_NAME, kind))
    }

    /// Reads and parses a config from a TOML file.
    ///
    /// Returns the config along with the set of keys that were present but not understood.
    pub fn from_path(
        path: &Utf8Path,
    ) -> Result<(SupervisorConfig, BTreeSet<String>), ConfigParseError> {
        let builder = Config::builder()
            .add_source(File::new(path.as_str(), FileFormat::Toml).required(true));
        let (config, ignored) = Self::build_and_deserialize_config(builder)
            .map_err(|kind| ConfigParseError::new(path, kind))?;
        for key in &ignored {
            warn!(config_file = %path, "ignoring unknown configuration key `{key}`");
        }
        Ok((config, ignored))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<(SupervisorConfig, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: SupervisorConfig =
            serde_path_to_error::deserialize(ignored_de).map_err(|error| {
                // Both serde_path_to_error and the config crate report the key. We drop the key
                // from the config error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }

    /// Returns the known tags declared by this config.
    pub fn test_tags(&self) -> TestTags {
        TestTags::from_tags(&self.tags)
    }

    /// Checks this config for consistency and computes the effective timeouts.
    pub fn validate(&self) -> Result<ValidatedTimeouts, ConfigValidationError> {
        if self.command.is_empty() {
            return Err(ConfigValidationError::EmptyCommand);
        }
        if self.test_timeout.is_zero() {
            return Err(ConfigValidationError::ZeroTestTimeout);
        }
        if self.kill_grace_period > self.shutdown_grace_period {
            return Err(ConfigValidationError::KillGraceTooLong {
                kill: self.kill_grace_period,
                shutdown: self.shutdown_grace_period,
            });
        }
        if self.chunk.total == 0 || self.chunk.index >= self.chunk.total {
            return Err(ConfigValidationError::InvalidChunk {
                index: self.chunk.index,
                total: self.chunk.total,
            });
        }

        let mut names = HashSet::new();
        for recipe in &self.recipes {
            if recipe.name.is_empty() || recipe.name.contains('/') {
                return Err(ConfigValidationError::InvalidRecipeName(
                    recipe.name.clone(),
                ));
            }
            if !names.insert(recipe.name.as_str()) {
                return Err(ConfigValidationError::DuplicateRecipe(recipe.name.clone()));
            }
        }

        let Some(node_timeout) = self.node_timeout else {
            return Ok(ValidatedTimeouts {
                test_timeout: self.test_timeout,
                total_budget: None,
                clamped: false,
            });
        };

        let reserved = NODE_TIMEOUT_SAFETY_MARGIN + self.startup_delay;
        let budget = node_timeout
            .checked_sub(reserved)
            .filter(|budget| !budget.is_zero())
            .ok_or(ConfigValidationError::NodeTimeoutTooShort {
                node_timeout,
                margin: NODE_TIMEOUT_SAFETY_MARGIN,
                startup_delay: self.startup_delay,
            })?;

        let clamped = budget < self.test_timeout;

        Ok(ValidatedTimeouts {
            test_timeout: self.test_timeout.min(budget),
            total_budget: Some(budget),
            clamped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const MINIMAL: &str = indoc! {r#"
        command = ["/bin/true"]
        cwd = "/tmp"
        work-dir = "/tmp/work"
        test-timeout = "60s"
    "#};

    fn parse(extra: &str) -> SupervisorConfig {
        let contents = format!("{MINIMAL}{extra}");
        let (config, ignored) =
            SupervisorConfig::from_toml_str(&contents).expect("config is valid");
        assert!(ignored.is_empty(), "no ignored keys: {ignored:?}");
        config
    }

    #[test]
    fn defaults() {
        let config = parse("");
        assert_eq!(config.shutdown_grace_period, DEFAULT_SHUTDOWN_GRACE_PERIOD);
        assert_eq!(config.kill_grace_period, DEFAULT_KILL_GRACE_PERIOD);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.retry.max_restarts, 3);
        assert_eq!(config.chunk, ChunkId::single());
        assert!(config.archive_output);
        assert_eq!(config.stderr_snippet_limit, ByteSize::kib(8));
        assert_eq!(
            config.validate().unwrap(),
            ValidatedTimeouts {
                test_timeout: Duration::from_secs(60),
                total_budget: None,
                clamped: false,
            }
        );
    }

    #[test]
    fn full_config() {
        let config = parse(indoc! {r#"
            node-timeout = "10m"
            startup-delay = "1m"
            smooth-shutdown-signals = ["SIGUSR2", "int"]
            shutdown-grace-period = "5s"
            kill-grace-period = "1s"
            ram-limit = "2 GiB"
            tmpfs-size = "512 MiB"
            tags = ["no-restart", "map-root-user"]
            size = "large"
            retry = 5

            [env]
            my_var = "value"

            [[recipes]]
            name = "db"
            program = "/usr/bin/db-recipe"
            args = ["--fast"]
            timeout = "30s"

            [[data-roots]]
            source = "/data/in"
            target = "in"
            mode = "copy"

            [[expected-tests]]
            path = "test.py"
            name = "test_a"

            [chunk]
            index = 1
            total = 4
        "#});

        assert_eq!(
            config.smooth_shutdown_signals,
            vec![ShutdownSignal::User2, ShutdownSignal::Interrupt]
        );
        assert_eq!(config.ram_limit, Some(ByteSize::gib(2)));
        assert_eq!(config.tmpfs_size, Some(ByteSize::mib(512)));
        assert_eq!(config.size, TestSize::Large);
        assert_eq!(config.retry.max_restarts, 5);
        assert_eq!(config.env["my_var"], "value");
        assert_eq!(config.recipes[0].name, "db");
        assert_eq!(config.recipes[0].timeout, Duration::from_secs(30));
        assert_eq!(config.data_roots[0].target, "in");
        assert_eq!(config.expected_tests, vec![TestCaseId::new("test.py", "test_a")]);
        assert_eq!(config.chunk, ChunkId::new(1, 4, None));
        assert!(config.test_tags().no_restart);
        assert!(config.test_tags().map_root_user);

        let timeouts = config.validate().unwrap();
        assert_eq!(timeouts.test_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.total_budget, Some(Duration::from_secs(510)));
        assert!(!timeouts.clamped);
    }

    #[test]
    fn retry_table() {
        let config = parse(indoc! {r#"
            [retry]
            max-restarts = 1
            restart-indicators = ["flaky network"]
        "#});
        assert_eq!(config.retry.max_restarts, 1);
        assert_eq!(config.retry.restart_indicators, vec!["flaky network".to_owned()]);
        assert_eq!(
            config.retry.infrastructure_markers,
            RetryConfig::default().infrastructure_markers
        );
    }

    #[test_case("retry = -1", "retry" ; "negative retry count")]
    #[test_case("retry = { restart-indicators = [\"\"] }", "retry" ; "empty indicator")]
    #[test_case("smooth-shutdown-signals = [\"SIGKILL\"]", "smooth-shutdown-signals" ; "unknown signal")]
    #[test_case("[[recipes]]\nname = \"x\"\nprogram = \"/x\"\nbogus = 1", "recipes" ; "unknown recipe key")]
    fn invalid(extra: &str, key: &str) {
        let contents = format!("{MINIMAL}{extra}");
        let error = SupervisorConfig::from_toml_str(&contents).expect_err("config is invalid");
        match error.kind() {
            ConfigParseErrorKind::DeserializeError(error) => {
                assert!(
                    error.path().to_string().starts_with(key),
                    "path {} starts with {key}",
                    error.path()
                );
            }
            other => panic!("expected a deserialize error, found {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_reported() {
        let contents = format!("{MINIMAL}bogus-key = 1\n");
        let (_, ignored) = SupervisorConfig::from_toml_str(&contents).unwrap();
        assert_eq!(ignored, BTreeSet::from(["bogus-key".to_owned()]));
    }

    #[test]
    fn node_timeout_clamps_test_timeout() {
        let mut config = parse("");
        config.test_timeout = Duration::from_secs(600);
        config.node_timeout = Some(Duration::from_secs(300));
        config.startup_delay = Duration::from_secs(70);
        let timeouts = config.validate().unwrap();
        assert_eq!(timeouts.test_timeout, Duration::from_secs(200));
        assert!(timeouts.clamped);

        assert_eq!(
            timeouts.attempt_timeout(Duration::from_secs(150)),
            Some(Duration::from_secs(50))
        );
        assert_eq!(timeouts.attempt_timeout(Duration::from_secs(200)), None);
    }

    #[test]
    fn validation_errors() {
        let mut config = parse("");
        config.node_timeout = Some(Duration::from_secs(40));
        config.startup_delay = Duration::from_secs(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::NodeTimeoutTooShort { .. })
        ));

        let mut config = parse("");
        config.command.clear();
        assert_eq!(config.validate(), Err(ConfigValidationError::EmptyCommand));

        let mut config = parse("");
        config.kill_grace_period = Duration::from_secs(20);
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::KillGraceTooLong { .. })
        ));

        let mut config = parse("");
        let recipe = RecipeConfig {
            name: "db".to_owned(),
            program: "/bin/true".into(),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
        };
        config.recipes = vec![recipe.clone(), recipe];
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DuplicateRecipe("db".to_owned()))
        );

        let mut config = parse("");
        config.chunk = ChunkId::new(4, 4, None);
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidChunk { index: 4, total: 4 })
        ));
    }
}
