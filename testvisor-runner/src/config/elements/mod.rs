// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for the supervisor.

mod data_root;
mod live_status;
mod recipe;
mod retry_config;
mod shutdown_signal;
mod tags;

pub use data_root::*;
pub use live_status::*;
pub use recipe::*;
pub use retry_config::*;
pub use shutdown_signal::*;
pub use tags::*;
