// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::Status;
use thiserror::Error;

/// An error returned while parsing a [`Status`] from a string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized status: {input}\n(known values: {})",
    Status::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
)]
pub struct StatusParseError {
    input: String,
}

impl StatusParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }

    /// The input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// An error returned while converting JSON into a
/// [`ResultPayload`](crate::ResultPayload).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum PayloadError {
    /// A number couldn't be represented as either an `i64` or an `f64`.
    #[error("number `{0}` is out of range")]
    NumberOutOfRange(String),

    /// An `$external` reference was malformed.
    #[error("invalid external reference: {0}")]
    InvalidExternal(String),
}

/// An error returned while interpreting a trace record.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TraceEventParseError {
    /// The record's `name` isn't a known event name.
    #[error("unknown trace event name `{0}`")]
    UnknownName(String),

    /// The record's `value` doesn't match its `name`.
    #[error("invalid value for trace event `{name}`")]
    InvalidValue {
        /// The event name.
        name: String,

        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}
