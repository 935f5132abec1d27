// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The result model and wire formats shared by testvisor components.
//!
//! This crate defines the outcome taxonomy ([`Status`]), the result containers ([`Suite`],
//! [`Chunk`], [`TestCase`]), the records of the trace event protocol ([`trace`]) and the
//! meta-result record written at the end of every attempt ([`MetaResult`]).
//!
//! Types in this crate are plain data: the policies that act on them live in
//! `testvisor-runner`.

pub mod errors;
mod exit_codes;
mod meta;
mod payload;
mod status;
mod suite;
mod test_case;
pub mod trace;

pub use exit_codes::TestvisorExitCode;
pub use meta::{META_TIME_FORMAT, MetaResult};
pub use payload::{
    DifferenceKind, EXTERNAL_KEY, ExternalRef, PayloadDifference, ResultPayload, Scalar,
};
pub use status::{ContainerRank, Status};
pub use suite::{Chunk, ChunkId, ErrorOrigin, ReportedError, Suite, TestSize};
pub use test_case::{TestCase, TestCaseId};
