// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    container::{Contribution, merge_contributions},
    status::merge_cases,
};
use indexmap::{IndexMap, IndexSet, map::Entry};
use itertools::Itertools;
use std::collections::BTreeSet;
use testvisor_metadata::{Chunk, ChunkId, Status, Suite, TestCase, TestCaseId};
use tracing::debug;

/// Merges several result sets for the same logical suite into one.
///
/// `retry_count` is the number of attempts the caller asked for. A test that's missing from some
/// of them is reported as `FLAKY`. When merging the parallel chunks of a single attempt, pass 1.
#[derive(Clone, Debug)]
pub struct SuiteMerger {
    retry_count: usize,
}

impl SuiteMerger {
    /// Creates a new merger.
    pub fn new(retry_count: usize) -> Self {
        Self { retry_count }
    }

    /// Merges `inputs`, which are expected to be in attempt order.
    ///
    /// Duplicate entries within each input are folded first. The merged suite has the union of
    /// all test cases, each assigned to exactly one chunk and given a reconciled status.
    pub fn merge(&self, mut inputs: Vec<Suite>) -> Suite {
        for input in &mut inputs {
            input.reconcile_duplicates(merge_cases);
        }

        let Some(first) = inputs.first() else {
            return Suite::default();
        };
        let mut merged = Suite {
            project_path: first.project_path.clone(),
            size: first.size,
            tags: inputs
                .iter()
                .flat_map(|input| input.tags.iter().cloned())
                .collect(),
            platform: first.platform.clone(),
            ..Default::default()
        };

        let mut chunk_ids: IndexSet<ChunkId> = IndexSet::new();
        let mut tracked: IndexMap<TestCaseId, TestTracking> = IndexMap::new();
        for (index, input) in inputs.iter().enumerate() {
            let run = index + 1;
            for chunk in &input.chunks {
                chunk_ids.insert(chunk.id.clone());
                for case in &chunk.tests {
                    match tracked.entry(case.id.clone()) {
                        Entry::Vacant(entry) => {
                            entry.insert(TestTracking::new(run, &chunk.id, case.clone()));
                        }
                        Entry::Occupied(mut entry) => {
                            entry.get_mut().record(run, &chunk.id, case.clone());
                        }
                    }
                }
            }
        }

        for chunk_id in &chunk_ids {
            let contributions: Vec<_> = inputs
                .iter()
                .enumerate()
                .filter_map(|(index, input)| {
                    input.chunk(chunk_id).map(|chunk| Contribution {
                        run: index + 1,
                        rank: chunk.rollup_rank(),
                        errors: &chunk.errors,
                        logs: &chunk.logs,
                        metrics: &chunk.metrics,
                    })
                })
                .collect();
            let container = merge_contributions(&contributions);
            merged.chunks.push(Chunk {
                id: chunk_id.clone(),
                errors: container.errors,
                logs: container.logs,
                metrics: container.metrics,
                tests: Vec::new(),
            });
        }

        for tracking in tracked.into_values() {
            let (chunk_id, case) = tracking.finish(self.retry_count);
            merged.chunk_mut(&chunk_id).tests.push(case);
        }

        let contributions: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| Contribution {
                run: index + 1,
                rank: input.rollup_rank(),
                errors: &input.errors,
                logs: &input.logs,
                metrics: &input.metrics,
            })
            .collect();
        let container = merge_contributions(&contributions);
        merged.errors = container.errors;
        merged.logs = container.logs;
        merged.metrics = container.metrics;

        merged.flaky = inputs.iter().any(|input| input.flaky)
            || merged
                .iter_tests()
                .any(|(_, case)| case.status == Status::Flaky);

        debug!(
            inputs = inputs.len(),
            chunks = merged.chunks.len(),
            flaky = merged.flaky,
            "merged suites",
        );
        merged
    }
}

/// Everything known about one test across all inputs.
#[derive(Debug)]
struct TestTracking {
    case: TestCase,
    launched: BTreeSet<ChunkId>,
    not_launched: BTreeSet<ChunkId>,
    runs: BTreeSet<usize>,
}

impl TestTracking {
    fn new(run: usize, chunk: &ChunkId, case: TestCase) -> Self {
        let mut tracking = Self {
            case: TestCase::placeholder(case.id.clone()),
            launched: BTreeSet::new(),
            not_launched: BTreeSet::new(),
            runs: BTreeSet::new(),
        };
        tracking.note_appearance(run, chunk, case.status);
        tracking.case = case;
        tracking
    }

    fn record(&mut self, run: usize, chunk: &ChunkId, case: TestCase) {
        self.note_appearance(run, chunk, case.status);
        let previous = std::mem::replace(&mut self.case, TestCase::placeholder(case.id.clone()));
        self.case = merge_cases(previous, case);
    }

    fn note_appearance(&mut self, run: usize, chunk: &ChunkId, status: Status) {
        if status.is_launched() {
            self.launched.insert(chunk.clone());
        } else {
            self.not_launched.insert(chunk.clone());
        }
        self.runs.insert(run);
    }

    /// Applies the cross-run checks and picks the chunk this test belongs to.
    fn finish(self, retry_count: usize) -> (ChunkId, TestCase) {
        let Self {
            mut case,
            launched,
            not_launched,
            runs,
        } = self;

        if case.status != Status::Internal {
            let reason = if launched.len() > 1 {
                Some(format!(
                    "launched in chunks {}",
                    launched.iter().join(", ")
                ))
            } else if runs.len() < retry_count {
                Some(format!(
                    "found in runs [{}] of {retry_count}",
                    runs.iter().join(", ")
                ))
            } else {
                None
            };
            if let Some(reason) = reason {
                case.status = Status::Flaky;
                case.comment = if case.comment.is_empty() {
                    reason
                } else {
                    format!("{reason}\n{}", case.comment)
                };
            }
        }

        let chunk = launched
            .into_iter()
            .next()
            .or_else(|| not_launched.into_iter().next())
            .unwrap_or_else(ChunkId::single);
        (chunk, case)
    }
}
