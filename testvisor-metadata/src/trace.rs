// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire types for the trace event protocol.
//!
//! A trace file is newline-delimited JSON. Each line is one record of the form
//! `{"timestamp": <float>, "name": <string>, "value": <object>}`, where `name` is one of
//! `suite-event`, `chunk-event` or `subtest-finished`.

use crate::{ChunkId, ReportedError, TestCase, errors::TraceEventParseError};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

/// The name of a suite event.
pub const SUITE_EVENT: &str = "suite-event";
/// The name of a chunk event.
pub const CHUNK_EVENT: &str = "chunk-event";
/// The name of a subtest-finished event.
pub const SUBTEST_FINISHED: &str = "subtest-finished";

/// One record in a trace file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTraceEvent", into = "RawTraceEvent")]
pub struct TraceEvent {
    /// When the event was recorded, as a Unix timestamp.
    pub timestamp: f64,
    /// The event itself.
    pub kind: TraceEventKind,
}

impl TraceEvent {
    /// Creates a new event stamped with the current time.
    pub fn now(kind: TraceEventKind) -> Self {
        Self {
            timestamp: unix_timestamp(SystemTime::now()),
            kind,
        }
    }
}

/// Converts a `SystemTime` to a floating-point Unix timestamp.
pub fn unix_timestamp(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(error) => -error.duration().as_secs_f64(),
    }
}

/// The kinds of trace events.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceEventKind {
    /// An update to suite-level fields.
    SuiteEvent(SuiteEventValue),
    /// An update to chunk-level fields.
    ChunkEvent(ChunkEventValue),
    /// A test case finished.
    SubtestFinished(Box<SubtestFinishedValue>),
}

impl TraceEventKind {
    /// Returns the wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            TraceEventKind::SuiteEvent(_) => SUITE_EVENT,
            TraceEventKind::ChunkEvent(_) => CHUNK_EVENT,
            TraceEventKind::SubtestFinished(_) => SUBTEST_FINISHED,
        }
    }
}

/// A projection of a suite's mutable fields. Each field that is present replaces the suite's
/// current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteEventValue {
    /// Suite-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ReportedError>>,
    /// Suite-level logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<BTreeMap<String, Utf8PathBuf>>,
    /// Suite-level metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    /// The suite's flaky flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flaky: Option<bool>,
}

/// A projection of a chunk's mutable fields. Each field that is present replaces the chunk's
/// current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkEventValue {
    /// The chunk this event applies to. Absent means the default chunk.
    #[serde(flatten)]
    pub chunk: ChunkRef,
    /// Chunk-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ReportedError>>,
    /// Chunk-level logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<BTreeMap<String, Utf8PathBuf>>,
    /// Chunk-level metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
}

/// A finished test case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubtestFinishedValue {
    /// The chunk this test ran in. Absent means the default chunk.
    #[serde(flatten)]
    pub chunk: ChunkRef,
    /// The test case.
    #[serde(flatten)]
    pub case: TestCase,
    /// The process that ran the test, for live display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// The directory the test ran in, for live display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<Utf8PathBuf>,
}

impl SubtestFinishedValue {
    /// Creates a new value for the given test case, in the default chunk.
    pub fn new(case: TestCase) -> Self {
        Self {
            chunk: ChunkRef::default(),
            case,
            pid: None,
            cwd: None,
        }
    }
}

/// An optional reference to a chunk, as it appears in event values.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// The chunk index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    /// The total number of chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nchunks: Option<u32>,
    /// The chunk's file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ChunkRef {
    /// A reference to a specific chunk.
    pub fn to_chunk(id: &ChunkId) -> Self {
        Self {
            chunk_index: Some(id.index),
            nchunks: Some(id.total),
            filename: id.filename.clone(),
        }
    }

    /// Resolves this reference, returning `None` if it doesn't name a chunk.
    pub fn chunk_id(&self) -> Option<ChunkId> {
        if self.chunk_index.is_none() && self.nchunks.is_none() && self.filename.is_none() {
            return None;
        }
        Some(ChunkId::new(
            self.chunk_index.unwrap_or(0),
            self.nchunks.unwrap_or(1),
            self.filename.clone(),
        ))
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct RawTraceEvent {
    timestamp: f64,
    name: String,
    value: serde_json::Value,
}

impl From<TraceEvent> for RawTraceEvent {
    fn from(event: TraceEvent) -> Self {
        let name = event.kind.name().to_owned();
        let value = match event.kind {
            TraceEventKind::SuiteEvent(value) => serde_json::to_value(value),
            TraceEventKind::ChunkEvent(value) => serde_json::to_value(value),
            TraceEventKind::SubtestFinished(value) => serde_json::to_value(value),
        }
        // All value types have string keys and serializable fields.
        .expect("trace event values always serialize");
        Self {
            timestamp: event.timestamp,
            name,
            value,
        }
    }
}

impl TryFrom<RawTraceEvent> for TraceEvent {
    type Error = TraceEventParseError;

    fn try_from(raw: RawTraceEvent) -> Result<Self, Self::Error> {
        let RawTraceEvent {
            timestamp,
            name,
            value,
        } = raw;
        let invalid = |source| TraceEventParseError::InvalidValue {
            name: name.clone(),
            source,
        };
        let kind = match name.as_str() {
            SUITE_EVENT => {
                TraceEventKind::SuiteEvent(serde_json::from_value(value).map_err(invalid)?)
            }
            CHUNK_EVENT => {
                TraceEventKind::ChunkEvent(serde_json::from_value(value).map_err(invalid)?)
            }
            SUBTEST_FINISHED => TraceEventKind::SubtestFinished(Box::new(
                serde_json::from_value(value).map_err(invalid)?,
            )),
            _ => return Err(TraceEventParseError::UnknownName(name.clone())),
        };
        Ok(Self { timestamp, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Status, TestCaseId};
    use pretty_assertions::assert_eq;

    #[test]
    fn subtest_finished_wire_form() {
        let line = r#"{"timestamp": 1700000000.5, "name": "subtest-finished", "value": {"path": "t.py", "name": "test_a", "status": "good", "elapsed": 0.25, "chunk_index": 1, "nchunks": 4, "pid": 42}}"#;
        let event: TraceEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.timestamp, 1700000000.5);
        let TraceEventKind::SubtestFinished(value) = &event.kind else {
            panic!("expected subtest-finished, found {}", event.kind.name());
        };
        assert_eq!(value.case.id, TestCaseId::new("t.py", "test_a"));
        assert_eq!(value.case.status, Status::Good);
        assert_eq!(value.chunk.chunk_id(), Some(ChunkId::new(1, 4, None)));
        assert_eq!(value.pid, Some(42));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], SUBTEST_FINISHED);
        assert_eq!(json["value"]["status"], "good");
        let back: TraceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn suite_event_fields_are_optional() {
        let event: TraceEvent =
            serde_json::from_str(r#"{"timestamp": 1.0, "name": "suite-event", "value": {"flaky": true}}"#)
                .unwrap();
        assert_eq!(
            event.kind,
            TraceEventKind::SuiteEvent(SuiteEventValue {
                flaky: Some(true),
                ..Default::default()
            })
        );
    }

    #[test]
    fn unknown_name_is_rejected() {
        let result: Result<TraceEvent, _> =
            serde_json::from_str(r#"{"timestamp": 1.0, "name": "bogus", "value": {}}"#);
        let error = result.unwrap_err();
        assert!(error.to_string().contains("bogus"), "error: {error}");
    }

    #[test]
    fn chunk_ref_defaults() {
        assert_eq!(ChunkRef::default().chunk_id(), None);
        let by_file = ChunkRef {
            filename: Some("a.py".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            by_file.chunk_id(),
            Some(ChunkId::new(0, 1, Some("a.py".to_owned())))
        );
        let id = ChunkId::new(2, 3, None);
        assert_eq!(ChunkRef::to_chunk(&id).chunk_id(), Some(id));
    }
}
