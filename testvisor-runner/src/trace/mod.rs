// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The trace event protocol.
//!
//! A trace file is an append-only log of [`TraceEvent`](testvisor_metadata::trace::TraceEvent)
//! records, one JSON object per line. There's a single logical writer per file (possibly shared
//! across threads through [`TraceWriter`]) and any number of readers:
//!
//! * [`TraceReplayer`] reads a whole file and rebuilds a [`Suite`](testvisor_metadata::Suite)
//!   from it, tolerating a truncated tail.
//! * [`TraceTailer`] follows a file while it's being written and prints a status line for every
//!   test as it finishes.
//!
//! Visibility contract: once [`TraceWriter::write_event`] returns, the complete line is visible
//! to every reader of the file. Readers only ever see a partial line at the end of a file whose
//! writer crashed.

mod replay;
mod tail;
mod writer;

pub use replay::*;
pub use tail::*;
pub use writer::*;
