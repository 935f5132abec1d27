// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{os, terminate::EscalationSignal};
use crate::{
    cancel::CancellationToken,
    config::{SupervisorConfig, elements::RecipeConfig},
    errors::RecipeError,
    helpers::{display_exit_status, read_or_empty, read_snippet},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{collections::BTreeMap, fmt, fs::File, io, process::Stdio, sync::Arc};
use tracing::{debug, info, instrument, warn};

/// A lifecycle hook of a recipe.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RecipePhase {
    /// Run before the test.
    Start,
    /// Run after the test, even if it failed.
    Stop,
}

impl RecipePhase {
    /// The name of this phase, which is also the argument passed to the recipe.
    pub const fn as_str(self) -> &'static str {
        match self {
            RecipePhase::Start => "start",
            RecipePhase::Stop => "stop",
        }
    }
}

impl fmt::Display for RecipePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the recipes of one attempt.
#[derive(Debug)]
pub(super) struct RecipeRunner<'cfg> {
    config: &'cfg SupervisorConfig,
    logs_dir: Utf8PathBuf,
    env_file: Utf8PathBuf,
}

impl<'cfg> RecipeRunner<'cfg> {
    pub(super) fn new(config: &'cfg SupervisorConfig, work_dir: &Utf8Path) -> Self {
        Self {
            config,
            logs_dir: work_dir.join("recipes"),
            env_file: work_dir.join("recipe-env.jsonl"),
        }
    }

    /// The file recipes write environment variables for the test to.
    pub(super) fn env_file(&self) -> &Utf8Path {
        &self.env_file
    }

    /// Removes the env file left behind by an earlier run in the same work directory.
    pub(super) fn clear_env(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.env_file) {
            Ok(()) => {
                debug!(path = %self.env_file, "removed stale recipe env file");
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Starts recipes in declared order, stopping at the first failure.
    ///
    /// Returns the number of recipes that started successfully, which is the number that must be
    /// passed to [`Self::stop_all`].
    pub(super) async fn start_all(
        &self,
        cancel: &CancellationToken,
    ) -> (usize, Option<RecipeError>) {
        for (started, recipe) in self.config.recipes.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(recipe = %recipe.name, "cancelled before starting recipe");
                return (started, None);
            }
            if let Err(error) = self.run_phase(recipe, RecipePhase::Start).await {
                warn!(recipe = %recipe.name, "recipe failed to start");
                return (started, Some(error));
            }
        }
        (self.config.recipes.len(), None)
    }

    /// Stops the first `started` recipes in reverse order. Every recipe is stopped even if an
    /// earlier one fails to.
    pub(super) async fn stop_all(&self, started: usize) -> Vec<RecipeError> {
        let mut errors = Vec::new();
        for recipe in self.config.recipes[..started].iter().rev() {
            if let Err(error) = self.run_phase(recipe, RecipePhase::Stop).await {
                warn!(recipe = %recipe.name, "recipe failed to tear down");
                errors.push(error);
            }
        }
        errors
    }

    /// Reads the variables recipes handed off to the test. Later lines override earlier ones.
    pub(super) fn read_env(&self) -> Result<BTreeMap<String, String>, RecipeError> {
        let contents = read_or_empty(&self.env_file).map_err(|error| RecipeError::EnvFileRead {
            path: self.env_file.clone(),
            error: Arc::new(error),
        })?;

        let mut env = BTreeMap::new();
        for (index, line) in String::from_utf8_lossy(&contents).lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let vars: BTreeMap<String, String> =
                serde_json::from_str(line).map_err(|error| RecipeError::EnvFileParse {
                    path: self.env_file.clone(),
                    line: index + 1,
                    error: Arc::new(error),
                })?;
            env.extend(vars);
        }
        Ok(env)
    }

    #[instrument(level = "debug", skip_all, fields(recipe = %recipe.name, %phase))]
    async fn run_phase(
        &self,
        recipe: &RecipeConfig,
        phase: RecipePhase,
    ) -> Result<(), RecipeError> {
        let spawn_error = |error| RecipeError::Spawn {
            recipe: recipe.name.clone(),
            phase,
            error: Arc::new(error),
        };

        std::fs::create_dir_all(&self.logs_dir).map_err(spawn_error)?;
        let stdout_path = self.logs_dir.join(format!("{}.{phase}.out", recipe.name));
        let stderr_path = self.logs_dir.join(format!("{}.{phase}.err", recipe.name));
        let stdout = File::create(&stdout_path).map_err(spawn_error)?;
        let stderr = File::create(&stderr_path).map_err(spawn_error)?;

        let mut cmd = std::process::Command::new(&recipe.program);
        cmd.args(&recipe.args).arg(phase.as_str());
        if let Some(build_root) = &self.config.build_root {
            cmd.arg("--build-root").arg(build_root);
        }
        if let Some(source_root) = &self.config.source_root {
            cmd.arg("--source-root").arg(source_root);
        }
        if let Some(debugger) = &self.config.debugger_path {
            cmd.arg("--gdb-path").arg(debugger);
        }
        cmd.arg("--env-file")
            .arg(&self.env_file)
            .current_dir(&self.config.cwd)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        os::set_process_group(&mut cmd);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        info!(recipe = %recipe.name, %phase, program = %recipe.program, "running recipe");
        let mut child = cmd.spawn().map_err(spawn_error)?;

        let status = match tokio::time::timeout(recipe.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(recipe = %recipe.name, %phase, "recipe finished");
                return Ok(());
            }
            Ok(Ok(status)) => display_exit_status(status),
            Ok(Err(error)) => return Err(spawn_error(error)),
            Err(_) => {
                if let Some(pid) = child.id() {
                    os::send_signal(&mut child, pid, EscalationSignal::Kill);
                }
                _ = child.wait().await;
                format!(
                    "timed out after {}",
                    humantime::format_duration(recipe.timeout)
                )
            }
        };

        let stderr_tail = read_snippet(
            &stderr_path,
            self.config.stderr_snippet_limit.as_u64() as usize,
        )
        .unwrap_or_default();
        let recipe = recipe.name.clone();
        Err(match phase {
            RecipePhase::Start => RecipeError::StartupFailed {
                recipe,
                status,
                stderr_tail,
            },
            RecipePhase::Stop => RecipeError::TeardownFailed {
                recipe,
                status,
                stderr_tail,
            },
        })
    }
}
