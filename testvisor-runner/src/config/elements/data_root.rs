// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::Deserialize;

/// A directory of test data made available inside the isolated filesystem view.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DataRoot {
    /// The directory to expose.
    pub source: Utf8PathBuf,

    /// Where to expose it, relative to the isolated root.
    pub target: Utf8PathBuf,

    /// How to expose it.
    #[serde(default)]
    pub mode: DataRootMode,
}

/// How a [`DataRoot`] is exposed inside the isolated root.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DataRootMode {
    /// Create a symlink to the source directory.
    #[default]
    Symlink,

    /// Copy the source directory recursively, so the test may modify it freely.
    Copy,
}
