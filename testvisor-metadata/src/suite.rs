// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Result containers: suites and chunks.

use crate::{ContainerRank, Status, TestCase, TestCaseId};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

/// The identity of a chunk: one partition of a suite's test cases.
///
/// Chunk identities are compared field by field (`index`, then `total`, then `filename`), which
/// defines the order used to pick the first of several chunks. They must be preserved exactly
/// across retries and merges.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    /// The zero-based index of this chunk.
    pub index: u32,
    /// The total number of chunks.
    pub total: u32,
    /// The file this chunk covers, for suites split by file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ChunkId {
    /// The identity of the only chunk of an unsplit suite.
    pub fn single() -> Self {
        Self {
            index: 0,
            total: 1,
            filename: None,
        }
    }

    /// Creates a new chunk identity.
    pub fn new(index: u32, total: u32, filename: Option<String>) -> Self {
        Self {
            index,
            total,
            filename,
        }
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.index, self.total)?;
        if let Some(filename) = &self.filename {
            write!(f, " {filename}")?;
        }
        Ok(())
    }
}

/// Where a reported error came from.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ErrorOrigin {
    /// The test itself: a non-zero exit, a timeout or a crash.
    Test,
    /// A recipe failed to start.
    RecipeStartup {
        /// The name of the recipe.
        recipe: SmolStr,
    },
    /// A recipe failed to stop.
    RecipeTeardown {
        /// The name of the recipe.
        recipe: SmolStr,
    },
    /// The supervisor itself failed. Not attributable to the test author.
    Infrastructure,
}

/// An error attached to a suite or a chunk.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReportedError {
    /// The status this error implies for its container.
    pub status: Status,
    /// A human-readable message.
    pub message: String,
    /// Where the error came from.
    #[serde(default = "default_origin")]
    pub origin: ErrorOrigin,
}

fn default_origin() -> ErrorOrigin {
    ErrorOrigin::Test
}

impl ReportedError {
    /// Creates a new error.
    pub fn new(status: Status, message: impl Into<String>, origin: ErrorOrigin) -> Self {
        Self {
            status,
            message: message.into(),
            origin,
        }
    }
}

/// The declared size of a test, which influences timeouts and retry behavior.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestSize {
    /// A small test.
    #[default]
    Small,
    /// A medium test.
    Medium,
    /// A large test.
    Large,
}

impl TestSize {
    /// Returns the wire name of this size.
    pub const fn as_str(self) -> &'static str {
        match self {
            TestSize::Small => "small",
            TestSize::Medium => "medium",
            TestSize::Large => "large",
        }
    }
}

impl fmt::Display for TestSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partition of a suite's test cases.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// The identity of this chunk.
    pub id: ChunkId,
    /// Chunk-level errors.
    #[serde(default)]
    pub errors: Vec<ReportedError>,
    /// Chunk-level log artifacts.
    #[serde(default)]
    pub logs: BTreeMap<String, Utf8PathBuf>,
    /// Chunk-level metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// The tests that ran within this chunk, in the order they were first seen.
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl Chunk {
    /// Creates an empty chunk.
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            errors: Vec::new(),
            logs: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tests: Vec::new(),
        }
    }

    /// Returns the test with this id, if present.
    pub fn test(&self, id: &TestCaseId) -> Option<&TestCase> {
        self.tests.iter().find(|case| &case.id == id)
    }

    /// Returns the test with this id, inserting a placeholder if it isn't present.
    pub fn test_mut(&mut self, id: &TestCaseId) -> &mut TestCase {
        let index = match self.tests.iter().position(|case| &case.id == id) {
            Some(index) => index,
            None => {
                self.tests.push(TestCase::placeholder(id.clone()));
                self.tests.len() - 1
            }
        };
        &mut self.tests[index]
    }

    /// Inserts a test, overwriting any existing test with the same id in place.
    pub fn upsert_test(&mut self, case: TestCase) {
        let id = case.id.clone();
        *self.test_mut(&id) = case;
    }

    /// Adds a chunk-level error.
    pub fn add_error(&mut self, status: Status, message: impl Into<String>, origin: ErrorOrigin) {
        self.errors.push(ReportedError::new(status, message, origin));
    }

    /// Folds together test entries that share an id, keeping the position of the first one.
    ///
    /// `fold` is called with the entry seen so far and the later duplicate, in that order.
    pub fn reconcile_duplicates(&mut self, mut fold: impl FnMut(TestCase, TestCase) -> TestCase) {
        let mut positions: HashMap<TestCaseId, usize> = HashMap::new();
        let mut out: Vec<TestCase> = Vec::with_capacity(self.tests.len());
        for case in std::mem::take(&mut self.tests) {
            match positions.get(&case.id) {
                Some(&index) => {
                    let existing = std::mem::replace(
                        &mut out[index],
                        TestCase::placeholder(case.id.clone()),
                    );
                    out[index] = fold(existing, case);
                }
                None => {
                    positions.insert(case.id.clone(), out.len());
                    out.push(case);
                }
            }
        }
        self.tests = out;
    }

    /// The worst rank among this chunk's errors and tests.
    pub fn rollup_rank(&self) -> ContainerRank {
        self.errors
            .iter()
            .map(|error| error.status)
            .chain(self.tests.iter().map(|case| case.status))
            .map(Status::container_rank)
            .max()
            .unwrap_or(ContainerRank::Good)
    }

    /// The representative status of this chunk.
    pub fn rollup_status(&self) -> Status {
        self.rollup_rank().status()
    }
}

/// The top-level result container for one test target.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    /// The project path of the test target.
    pub project_path: String,
    /// The declared size.
    #[serde(default)]
    pub size: TestSize,
    /// Declared tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// A descriptor of the platform the suite ran on.
    #[serde(default)]
    pub platform: String,
    /// The chunks of this suite, in creation order.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    /// Suite-level errors.
    #[serde(default)]
    pub errors: Vec<ReportedError>,
    /// Suite-level log artifacts.
    #[serde(default)]
    pub logs: BTreeMap<String, Utf8PathBuf>,
    /// Suite-level metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Whether any outcome in this suite was inconsistent across attempts.
    #[serde(default)]
    pub flaky: bool,
}

impl Suite {
    /// Creates an empty suite.
    pub fn new(project_path: impl Into<String>, size: TestSize) -> Self {
        Self {
            project_path: project_path.into(),
            size,
            ..Default::default()
        }
    }

    /// Returns the chunk with this id, if present.
    pub fn chunk(&self, id: &ChunkId) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| &chunk.id == id)
    }

    /// Returns the chunk with this id, creating it at the end if it isn't present.
    pub fn chunk_mut(&mut self, id: &ChunkId) -> &mut Chunk {
        let index = match self.chunks.iter().position(|chunk| &chunk.id == id) {
            Some(index) => index,
            None => {
                self.chunks.push(Chunk::new(id.clone()));
                self.chunks.len() - 1
            }
        };
        &mut self.chunks[index]
    }

    /// Adds a suite-level error.
    pub fn add_error(&mut self, status: Status, message: impl Into<String>, origin: ErrorOrigin) {
        self.errors.push(ReportedError::new(status, message, origin));
    }

    /// Iterates over every test in every chunk, along with its chunk id.
    pub fn iter_tests(&self) -> impl Iterator<Item = (&ChunkId, &TestCase)> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.tests.iter().map(move |case| (&chunk.id, case)))
    }

    /// Folds together duplicate test entries within each chunk.
    pub fn reconcile_duplicates(&mut self, mut fold: impl FnMut(TestCase, TestCase) -> TestCase) {
        for chunk in &mut self.chunks {
            chunk.reconcile_duplicates(&mut fold);
        }
    }

    /// The worst rank among suite errors and all chunks.
    pub fn rollup_rank(&self) -> ContainerRank {
        self.errors
            .iter()
            .map(|error| error.status.container_rank())
            .chain(self.chunks.iter().map(Chunk::rollup_rank))
            .max()
            .unwrap_or(ContainerRank::Good)
    }

    /// The representative status of this suite.
    pub fn rollup_status(&self) -> Status {
        self.rollup_rank().status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(name: &str) -> TestCaseId {
        TestCaseId::new("suite", name)
    }

    #[test]
    fn chunk_mut_keeps_creation_order() {
        let mut suite = Suite::new("project/tests", TestSize::Medium);
        suite.chunk_mut(&ChunkId::new(2, 3, None));
        suite.chunk_mut(&ChunkId::new(0, 3, None));
        suite.chunk_mut(&ChunkId::new(2, 3, None));
        let indexes: Vec<_> = suite.chunks.iter().map(|c| c.id.index).collect();
        assert_eq!(indexes, vec![2, 0]);
    }

    #[test]
    fn upsert_overwrites_in_place() {
        let mut chunk = Chunk::new(ChunkId::single());
        chunk.test_mut(&id("a"));
        chunk.test_mut(&id("b"));
        chunk.upsert_test(TestCase::new(id("a"), Status::Fail));
        assert_eq!(chunk.tests.len(), 2);
        assert_eq!(chunk.tests[0].status, Status::Fail);
        assert_eq!(chunk.tests[1].status, Status::NotLaunched);
    }

    #[test]
    fn reconcile_duplicates_folds_in_order() {
        let mut chunk = Chunk::new(ChunkId::single());
        chunk.tests = vec![
            TestCase::new(id("a"), Status::Good),
            TestCase::new(id("b"), Status::Good),
            TestCase::new(id("a"), Status::Fail),
        ];
        let mut calls = Vec::new();
        chunk.reconcile_duplicates(|first, second| {
            calls.push((first.status, second.status));
            second
        });
        assert_eq!(calls, vec![(Status::Good, Status::Fail)]);
        assert_eq!(chunk.tests.len(), 2);
        assert_eq!(chunk.tests[0].id, id("a"));
        assert_eq!(chunk.tests[0].status, Status::Fail);
    }

    #[test]
    fn rollup() {
        let mut suite = Suite::new("p", TestSize::Small);
        assert_eq!(suite.rollup_status(), Status::Good);

        let chunk = suite.chunk_mut(&ChunkId::single());
        chunk.upsert_test(TestCase::new(id("a"), Status::Good));
        chunk.upsert_test(TestCase::new(id("b"), Status::Skipped));
        assert_eq!(suite.rollup_status(), Status::Good);

        suite
            .chunk_mut(&ChunkId::single())
            .upsert_test(TestCase::new(id("c"), Status::Crashed));
        assert_eq!(suite.rollup_status(), Status::Fail);

        suite.add_error(Status::Internal, "boom", ErrorOrigin::Infrastructure);
        assert_eq!(suite.rollup_status(), Status::Internal);
    }

    #[test]
    fn chunk_id_order_and_json() {
        let a = ChunkId::new(0, 2, Some("b.py".to_owned()));
        let b = ChunkId::new(1, 2, Some("a.py".to_owned()));
        assert!(a < b);
        assert_eq!(a.to_string(), "[0/2] b.py");

        let json = serde_json::to_string(&ChunkId::single()).unwrap();
        assert_eq!(json, r#"{"index":0,"total":1}"#);
    }

    #[test]
    fn error_origin_json() {
        let error = ReportedError::new(
            Status::Fail,
            "start failed",
            ErrorOrigin::RecipeStartup {
                recipe: "db".into(),
            },
        );
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["origin"]["kind"], "recipe-startup");
        assert_eq!(json["origin"]["recipe"], "db");
    }
}
