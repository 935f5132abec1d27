// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconciling repeated attempts into one result.
//!
//! The same logical suite can produce several result sets: one per retry of a flaky command, or
//! one per parallel chunk of a large test binary. This module folds them into a single
//! authoritative [`Suite`](testvisor_metadata::Suite).
//!
//! There are two levels of merging:
//!
//! * Test cases are folded pairwise with [`merge_status`] (through [`merge_cases`]). A test that
//!   behaved inconsistently across attempts becomes `FLAKY`.
//! * Containers (chunks and suites) are merged "worst of N": the most severe container supplies
//!   metrics, while logs and errors from every attempt are kept with their provenance.

mod container;
mod status;
mod suite;

pub use container::worst_of;
pub use status::*;
pub use suite::*;
