// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The test-execution core of testvisor.
//!
//! This crate supervises attempts of a test command ([`supervisor`]), records their results
//! through an append-only event log ([`trace`]) and reconciles repeated attempts or parallel
//! chunks into one authoritative result ([`merge`]).
//!
//! The basic flow is:
//!
//! 1. Load a [`SupervisorConfig`](config::SupervisorConfig), for example with
//!    [`SupervisorConfig::from_path`](config::SupervisorConfig::from_path).
//! 2. Build a [`Supervisor`](supervisor::Supervisor) with a
//!    [`CancellationToken`](cancel::CancellationToken), optionally bridged to OS signals through
//!    [`signal::install_shutdown_handler`].
//! 3. Call [`Supervisor::run`](supervisor::Supervisor::run), which returns the merged result of
//!    every attempt along with the exit code to report.

pub mod cancel;
pub mod config;
pub mod crash;
pub mod errors;
mod helpers;
pub mod merge;
pub mod monitor;
pub mod signal;
pub mod supervisor;
mod time;
pub mod trace;
