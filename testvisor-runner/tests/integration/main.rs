// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
mod merge;
#[cfg(unix)]
mod supervisor;
