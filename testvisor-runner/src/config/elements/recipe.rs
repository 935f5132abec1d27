// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::Deserialize;
use std::time::Duration;

/// The default time a recipe phase is allowed to take.
pub const DEFAULT_RECIPE_TIMEOUT: Duration = Duration::from_secs(300);

/// An external helper process run around the test command.
///
/// A recipe is invoked twice: once with `start` before the test command runs, and once with
/// `stop` after it finishes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RecipeConfig {
    /// The name of the recipe, used in file names and error messages.
    pub name: String,

    /// The program to run.
    pub program: Utf8PathBuf,

    /// Extra arguments, passed before the phase and the standard flags.
    #[serde(default)]
    pub args: Vec<String>,

    /// How long each phase may take before it's killed.
    #[serde(default = "default_recipe_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_recipe_timeout() -> Duration {
    DEFAULT_RECIPE_TIMEOUT
}
