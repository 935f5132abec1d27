// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

/// Tag that disables retries.
pub const TAG_NO_RESTART: &str = "no-restart";
/// Tag that maps the current user to root inside the private namespace.
pub const TAG_MAP_ROOT_USER: &str = "map-root-user";
/// Tag that disables trimming of command lines in process tree snapshots.
pub const TAG_NO_PSTREE_TRIM: &str = "no-pstree-trim";

/// The tags that alter supervisor behavior, parsed out of the declared tag set.
///
/// Unknown tags are ignored here: they're still carried through to results.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TestTags {
    /// Never retry this test.
    pub no_restart: bool,
    /// Map the current user to root in the private user namespace.
    pub map_root_user: bool,
    /// Don't trim command lines in process tree snapshots.
    pub no_pstree_trim: bool,
}

impl TestTags {
    /// Parses known tags out of a tag set.
    pub fn from_tags(tags: &BTreeSet<String>) -> Self {
        Self {
            no_restart: tags.contains(TAG_NO_RESTART),
            map_root_user: tags.contains(TAG_MAP_ROOT_USER),
            no_pstree_trim: tags.contains(TAG_NO_PSTREE_TRIM),
        }
    }
}
