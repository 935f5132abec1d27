// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use pretty_assertions::assert_eq;
use test_strategy::proptest;
use testvisor_metadata::{ChunkId, Status};
use testvisor_runner::merge::SuiteMerger;

#[test]
fn parallel_chunks_merge_into_one_suite() {
    test_init();
    let first = suite_with(
        ChunkId::new(0, 2, None),
        &[("test_a", Status::Good), ("test_b", Status::Fail)],
    );
    let second = suite_with(ChunkId::new(1, 2, None), &[("test_c", Status::Good)]);

    let merged = SuiteMerger::new(1).merge(vec![first, second]);
    assert_eq!(merged.chunks.len(), 2);
    let statuses: Vec<_> = merged
        .iter_tests()
        .map(|(chunk, case)| (chunk.index, case.id.name.to_string(), case.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (0, "test_a".to_owned(), Status::Good),
            (0, "test_b".to_owned(), Status::Fail),
            (1, "test_c".to_owned(), Status::Good),
        ]
    );
    assert!(!merged.flaky);
    assert_eq!(merged.rollup_status(), Status::Fail);
}

#[test]
fn test_launched_in_two_chunks_is_flaky() {
    test_init();
    let first = suite_with(ChunkId::new(0, 2, None), &[("test_a", Status::Good)]);
    let second = suite_with(ChunkId::new(1, 2, None), &[("test_a", Status::Good)]);

    let merged = SuiteMerger::new(1).merge(vec![first, second]);
    let case = find_test(&merged, "test_a").expect("test_a is present");
    assert_eq!(case.status, Status::Flaky);
    assert!(
        case.comment.contains("launched in chunks"),
        "comment: {}",
        case.comment
    );
    assert!(merged.flaky);
}

#[proptest]
fn identical_runs_keep_their_status(status: Status) {
    let suite = suite_with(ChunkId::single(), &[("test_a", status)]);
    let merged = SuiteMerger::new(2).merge(vec![suite.clone(), suite]);
    assert_eq!(
        find_test(&merged, "test_a").map(|case| case.status),
        Some(status)
    );
}

#[proptest]
fn missing_from_a_run_is_flaky(status: Status) {
    let present = suite_with(ChunkId::single(), &[("test_a", status)]);
    let absent = suite_with(ChunkId::single(), &[]);
    let merged = SuiteMerger::new(2).merge(vec![present, absent]);

    let expected = if status == Status::Internal {
        Status::Internal
    } else {
        Status::Flaky
    };
    assert_eq!(
        find_test(&merged, "test_a").map(|case| case.status),
        Some(expected)
    );
}
