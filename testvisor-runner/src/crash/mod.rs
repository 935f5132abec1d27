// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crash diagnostics: locating core files and symbolizing them.
//!
//! When the test command dies from a fatal signal, the supervisor looks for its core file and
//! runs a debugger over it to extract a backtrace. Helper processes spawned by the test can also
//! ask for their cores to be processed by registering them in a [`CoreRegistry`] log.

mod backtrace;
mod core_registry;

pub use backtrace::*;
pub use core_registry::*;
