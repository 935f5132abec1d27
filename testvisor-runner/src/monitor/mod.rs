// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource monitors that run alongside the test command.
//!
//! Each monitor is a Tokio task that samples at [`MONITOR_POLL_INTERVAL`] until it's stopped or
//! the run is cancelled, and reports its peak observation when stopped.

mod memory;
mod proc_tree;
mod tmpfs;

pub use memory::*;
pub use proc_tree::*;
pub use tmpfs::*;

use std::time::Duration;

/// How often monitors sample.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
