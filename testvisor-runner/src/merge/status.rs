// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cmp::Ordering;
use testvisor_metadata::{Status, TestCase};

/// Folds the statuses of two appearances of the same test.
///
/// The rules, in order:
///
/// 1. Identical statuses are kept.
/// 2. `NOT_LAUNCHED` yields to the other status: presence wins over absence.
/// 3. `TIMEOUT` together with `GOOD` is `TIMEOUT`.
/// 4. Otherwise the more severe status wins. `INTERNAL` is kept as is, and anything else becomes
///    `FLAKY`.
///
/// This function is commutative. It is not associative: folding three or more statuses depends
/// on the order in which they're folded, and callers fold in attempt order.
pub fn merge_status(a: Status, b: Status) -> Status {
    if a == b {
        return a;
    }
    match (a, b) {
        (Status::NotLaunched, other) | (other, Status::NotLaunched) => other,
        (Status::Timeout, Status::Good) | (Status::Good, Status::Timeout) => Status::Timeout,
        _ => {
            if a.max(b) == Status::Internal {
                Status::Internal
            } else {
                Status::Flaky
            }
        }
    }
}

/// Folds two appearances of the same test into one.
///
/// The merged case takes its fields from the appearance whose status decided the outcome (the
/// launched one, or the more severe one), its status from [`merge_status`], and the union of
/// both appearances' tags and logs.
pub fn merge_cases(a: TestCase, b: TestCase) -> TestCase {
    let status = merge_status(a.status, b.status);

    let (mut winner, loser) = match (a.status, b.status) {
        (_, Status::NotLaunched) => (a, b),
        (Status::NotLaunched, _) => (b, a),
        (sa, sb) if sb.cmp(&sa) == Ordering::Greater => (b, a),
        _ => (a, b),
    };

    if status == Status::Flaky && winner.status != Status::Flaky && loser.status != Status::Flaky {
        let provenance = format!(
            "inconsistent outcomes: {} and {}",
            winner.status, loser.status
        );
        winner.comment = if winner.comment.is_empty() {
            provenance
        } else {
            format!("{provenance}\n{}", winner.comment)
        };
    }
    winner.status = status;

    winner.tags.extend(loser.tags);
    for (key, path) in loser.logs {
        winner.logs.entry(key).or_insert(path);
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use test_case::test_case;
    use test_strategy::proptest;
    use testvisor_metadata::TestCaseId;

    #[test_case(Status::Good, Status::Good, Status::Good ; "identical")]
    #[test_case(Status::NotLaunched, Status::Fail, Status::Fail ; "presence wins over absence")]
    #[test_case(Status::Internal, Status::NotLaunched, Status::Internal ; "not launched yields to internal")]
    #[test_case(Status::Timeout, Status::Good, Status::Timeout ; "timeout with good")]
    #[test_case(Status::Timeout, Status::Fail, Status::Flaky ; "timeout with fail")]
    #[test_case(Status::Timeout, Status::Crashed, Status::Flaky ; "timeout with crashed")]
    #[test_case(Status::Good, Status::Fail, Status::Flaky ; "good with fail")]
    #[test_case(Status::Good, Status::Internal, Status::Internal ; "internal is never downgraded")]
    #[test_case(Status::Skipped, Status::Good, Status::Flaky ; "skipped with good")]
    #[test_case(Status::Flaky, Status::Good, Status::Flaky ; "flaky stays flaky")]
    fn truth_table(a: Status, b: Status, expected: Status) {
        assert_eq!(merge_status(a, b), expected);
    }

    #[proptest]
    fn merge_status_is_commutative(a: Status, b: Status) {
        assert_eq!(merge_status(a, b), merge_status(b, a));
    }

    #[proptest]
    fn merge_status_is_idempotent(a: Status) {
        assert_eq!(merge_status(a, a), a);
    }

    #[proptest]
    fn not_launched_is_identity(a: Status) {
        assert_eq!(merge_status(Status::NotLaunched, a), a);
    }

    #[test]
    fn merge_cases_keeps_winner_fields() {
        let id = TestCaseId::new("suite", "test");
        let mut good = TestCase::new(id.clone(), Status::Good);
        good.comment = "all fine".to_owned();
        good.logs = btreemap! { "stdout".to_owned() => "run1/stdout".into() };
        good.tags.insert("fast".to_owned());

        let mut fail = TestCase::new(id.clone(), Status::Fail);
        fail.comment = "assertion failed".to_owned();
        fail.logs = btreemap! {
            "stdout".to_owned() => "run2/stdout".into(),
            "core".to_owned() => "run2/core".into(),
        };

        let merged = merge_cases(good, fail);
        assert_eq!(merged.status, Status::Flaky);
        assert_eq!(
            merged.comment,
            "inconsistent outcomes: fail and good\nassertion failed"
        );
        assert_eq!(
            merged.logs,
            btreemap! {
                "stdout".to_owned() => "run2/stdout".into(),
                "core".to_owned() => "run2/core".into(),
            }
        );
        assert!(merged.tags.contains("fast"));
    }

    #[test]
    fn merge_cases_with_placeholder() {
        let id = TestCaseId::new("suite", "test");
        let mut ran = TestCase::new(id.clone(), Status::Good);
        ran.comment = "ran".to_owned();

        let merged = merge_cases(TestCase::placeholder(id.clone()), ran.clone());
        assert_eq!(merged, ran);
        let merged = merge_cases(ran.clone(), TestCase::placeholder(id));
        assert_eq!(merged, ran);
    }
}
