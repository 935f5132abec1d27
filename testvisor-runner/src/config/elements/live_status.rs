// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::Deserialize;

/// Settings for the live status lines printed while a test runs.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LiveStatusConfig {
    /// Whether to print live status lines at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Whether to colorize status lines.
    #[serde(default)]
    pub colorize: bool,

    /// Whether to show the pid of the process that ran each test.
    #[serde(default)]
    pub show_pid: bool,

    /// Whether to show the directory each test ran in.
    #[serde(default)]
    pub show_cwd: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for LiveStatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            colorize: false,
            show_pid: false,
            show_cwd: false,
        }
    }
}
