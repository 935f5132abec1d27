// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The outcome taxonomy for test cases, chunks and suites.

use crate::errors::StatusParseError;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, str::FromStr};

/// The outcome of a test case, chunk or suite.
///
/// Every status carries a signed severity code. The magnitude of the code orders statuses by how
/// severe they are: a larger magnitude is more severe. The sign separates outcomes of a test that
/// ran (positive) from outcomes that describe why a test didn't produce an ordinary result
/// (negative), with [`Internal`](Self::Internal) the most severe of all.
///
/// Statuses must only be compared through [`Ord`] (or [`Status::magnitude`]), which orders by
/// magnitude. All magnitudes are distinct, so the order is total.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The test passed.
    Good,
    /// The test failed as expected.
    Xfail,
    /// The test failed.
    Fail,
    /// The test was expected to fail, but passed.
    Xpass,
    /// The test was expected to report a result, but didn't.
    Missing,
    /// The test process died because of a fatal signal.
    Crashed,
    /// The test exceeded its deadline.
    Timeout,
    /// The test's outcome was inconsistent across attempts.
    Flaky,
    /// The test was skipped by its own test framework.
    Skipped,
    /// The test never started.
    NotLaunched,
    /// The test's output differs from its canonical data.
    CanonDiff,
    /// The test was filtered out.
    Deselected,
    /// An infrastructure failure unrelated to the test author.
    Internal,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Status; 13] = [
        Status::Good,
        Status::Xfail,
        Status::Fail,
        Status::Xpass,
        Status::Missing,
        Status::Crashed,
        Status::Timeout,
        Status::Flaky,
        Status::Skipped,
        Status::NotLaunched,
        Status::CanonDiff,
        Status::Deselected,
        Status::Internal,
    ];

    /// Returns the signed severity code for this status.
    ///
    /// The code is stable across releases and is what other tools in the ecosystem store. Use it
    /// for interop, not for comparisons.
    pub const fn code(self) -> i32 {
        match self {
            Status::Good => 1,
            Status::Xfail => 2,
            Status::Fail => 3,
            Status::Xpass => 4,
            Status::Missing => 5,
            Status::Crashed => 6,
            Status::Timeout => 7,
            Status::Flaky => -50,
            Status::Skipped => -100,
            Status::NotLaunched => -200,
            Status::CanonDiff => -300,
            Status::Deselected => -400,
            Status::Internal => -(i32::MAX),
        }
    }

    /// Returns the status for a severity code, if it is known.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// The severity magnitude of this status. Larger is more severe.
    pub const fn magnitude(self) -> u32 {
        self.code().unsigned_abs()
    }

    /// Returns true if this status is fatal and must never be downgraded.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Status::Internal)
    }

    /// Returns true if a test with this status was launched.
    pub const fn is_launched(self) -> bool {
        !matches!(self, Status::NotLaunched)
    }

    /// Returns true if this status should make a run fail.
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Status::Fail
                | Status::Timeout
                | Status::Crashed
                | Status::Xpass
                | Status::Missing
                | Status::CanonDiff
                | Status::Internal
        )
    }

    /// Maps this status onto the coarse ranking used to pick the worst of several chunks or
    /// suites.
    pub const fn container_rank(self) -> ContainerRank {
        match self {
            Status::Internal => ContainerRank::Internal,
            Status::Fail | Status::Crashed | Status::Xpass | Status::CanonDiff => {
                ContainerRank::Fail
            }
            Status::Timeout => ContainerRank::Timeout,
            Status::Flaky => ContainerRank::Flaky,
            Status::Missing | Status::NotLaunched => ContainerRank::Missing,
            Status::Good | Status::Xfail | Status::Skipped | Status::Deselected => {
                ContainerRank::Good
            }
        }
    }

    /// Returns the wire name of this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Good => "good",
            Status::Xfail => "xfail",
            Status::Fail => "fail",
            Status::Xpass => "xpass",
            Status::Missing => "missing",
            Status::Crashed => "crashed",
            Status::Timeout => "timeout",
            Status::Flaky => "flaky",
            Status::Skipped => "skipped",
            Status::NotLaunched => "not_launched",
            Status::CanonDiff => "canon_diff",
            Status::Deselected => "deselected",
            Status::Internal => "internal",
        }
    }
}

impl Ord for Status {
    fn cmp(&self, other: &Self) -> Ordering {
        self.magnitude().cmp(&other.magnitude())
    }
}

impl PartialOrd for Status {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StatusParseError::new(s))
    }
}

/// The ranking used to pick the worst of several containers (chunks or suites).
///
/// Ordered from least to most severe, so `max` picks the worst.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ContainerRank {
    /// Nothing went wrong.
    Good,
    /// Something expected didn't show up.
    Missing,
    /// Some outcome was inconsistent across attempts.
    Flaky,
    /// Something timed out.
    Timeout,
    /// Something failed.
    Fail,
    /// The infrastructure failed.
    Internal,
}

impl ContainerRank {
    /// The representative status for this rank.
    pub const fn status(self) -> Status {
        match self {
            ContainerRank::Good => Status::Good,
            ContainerRank::Missing => Status::Missing,
            ContainerRank::Flaky => Status::Flaky,
            ContainerRank::Timeout => Status::Timeout,
            ContainerRank::Fail => Status::Fail,
            ContainerRank::Internal => Status::Internal,
        }
    }
}

#[cfg(feature = "proptest1")]
mod proptest_impls {
    use super::*;
    use proptest::prelude::*;

    impl Arbitrary for Status {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            proptest::sample::select(Status::ALL.to_vec()).boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_case::test_case;

    #[test]
    fn magnitudes_are_distinct() {
        let magnitudes: HashSet<_> = Status::ALL.iter().map(|s| s.magnitude()).collect();
        assert_eq!(magnitudes.len(), Status::ALL.len());
    }

    #[test]
    fn internal_is_most_severe() {
        for status in Status::ALL {
            assert!(status <= Status::Internal, "{status} <= internal");
        }
        assert!(Status::Internal.is_fatal());
        assert!(Status::Internal.code() < 0);
    }

    #[test_case(Status::Good, Status::Fail, Ordering::Less ; "good is less than fail")]
    #[test_case(Status::Flaky, Status::Timeout, Ordering::Greater ; "flaky is more than timeout")]
    #[test_case(Status::NotLaunched, Status::Skipped, Ordering::Greater ; "not launched is more than skipped")]
    fn ordering(a: Status, b: Status, expected: Ordering) {
        assert_eq!(a.cmp(&b), expected);
    }

    #[test]
    fn wire_names_round_trip() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert!("bogus".parse::<Status>().is_err());
    }

    #[test_case(Status::Crashed, ContainerRank::Fail)]
    #[test_case(Status::NotLaunched, ContainerRank::Missing)]
    #[test_case(Status::Skipped, ContainerRank::Good)]
    #[test_case(Status::Internal, ContainerRank::Internal)]
    fn container_rank(status: Status, rank: ContainerRank) {
        assert_eq!(status.container_rank(), rank);
    }
}
