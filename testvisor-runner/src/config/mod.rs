// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervisor configuration.
//!
//! The configuration is read from TOML once, validated once, and then shared immutably by every
//! component of the supervisor.

pub mod elements;
mod imp;

pub use imp::*;
