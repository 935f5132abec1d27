// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{ResultPayload, Status};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};

/// The identity of a test case within a suite: a path (usually the test file or module) and a
/// name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TestCaseId {
    /// The path component, e.g. `tests/test_foo.py` or `FooSuite`.
    pub path: SmolStr,
    /// The name of the test within the path.
    pub name: SmolStr,
}

impl TestCaseId {
    /// Creates a new `TestCaseId`.
    pub fn new(path: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.path, self.name)
    }
}

/// One test or subtest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// The identity of this test case.
    #[serde(flatten)]
    pub id: TestCaseId,

    /// The current status.
    pub status: Status,

    /// A human-readable comment or diagnostic.
    #[serde(default)]
    pub comment: String,

    /// How long the test took.
    #[serde(default, with = "duration_secs")]
    pub elapsed: Duration,

    /// When the test started, as a Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<f64>,

    /// Named log artifacts.
    #[serde(default)]
    pub logs: BTreeMap<String, Utf8PathBuf>,

    /// Named numeric metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    /// The structured result, for canonical-data comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,

    /// Tags attached to this test.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl TestCase {
    /// Creates a placeholder for a test that hasn't been launched yet.
    ///
    /// Placeholders make sure that a test that never reports anything (e.g. because the process
    /// crashed before reaching it) still shows up in the results.
    pub fn placeholder(id: TestCaseId) -> Self {
        Self::new(id, Status::NotLaunched)
    }

    /// Creates a new test case with the given status and no other data.
    pub fn new(id: TestCaseId, status: Status) -> Self {
        Self {
            id,
            status,
            comment: String::new(),
            elapsed: Duration::ZERO,
            started: None,
            logs: BTreeMap::new(),
            metrics: BTreeMap::new(),
            result: None,
            tags: BTreeSet::new(),
        }
    }
}

/// Serializes a `Duration` as floating-point seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn id_display_and_order() {
        let a = TestCaseId::new("a.py", "z");
        let b = TestCaseId::new("b.py", "a");
        assert_eq!(a.to_string(), "a.py::z");
        assert!(a < b);
    }

    #[test]
    fn case_json() {
        let mut case = TestCase::new(TestCaseId::new("suite", "test"), Status::Good);
        case.elapsed = Duration::from_millis(1500);
        case.logs.insert("stdout".to_owned(), "out.log".into());

        let json = serde_json::to_value(&case).unwrap();
        assert_eq!(json["path"], "suite");
        assert_eq!(json["name"], "test");
        assert_eq!(json["status"], "good");
        assert_eq!(json["elapsed"], 1.5);

        let back: TestCase = serde_json::from_value(json).unwrap();
        assert_eq!(back, case);
    }

    #[test]
    fn minimal_case_json() {
        let case: TestCase = serde_json::from_str(
            r#"{"path": "p", "name": "n", "status": "not_launched"}"#,
        )
        .unwrap();
        assert_eq!(case, TestCase::placeholder(TestCaseId::new("p", "n")));
    }

    #[test]
    fn negative_elapsed_is_rejected() {
        let result: Result<TestCase, _> = serde_json::from_str(
            r#"{"path": "p", "name": "n", "status": "good", "elapsed": -1.0}"#,
        );
        assert!(result.is_err());
    }
}
