// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::BTreeMap;
use testvisor_metadata::{ContainerRank, ReportedError};

/// Returns the index of the worst item by container rank. Ties go to the earliest item.
///
/// Returns `None` if `items` is empty.
pub fn worst_of<T>(items: &[T], rank: impl Fn(&T) -> ContainerRank) -> Option<usize> {
    let mut worst: Option<(usize, ContainerRank)> = None;
    for (index, item) in items.iter().enumerate() {
        let item_rank = rank(item);
        match worst {
            Some((_, worst_rank)) if item_rank <= worst_rank => {}
            _ => worst = Some((index, item_rank)),
        }
    }
    worst.map(|(index, _)| index)
}

/// One attempt's view of a container (a chunk or a suite).
#[derive(Debug)]
pub(super) struct Contribution<'a> {
    /// The 1-based run this contribution came from.
    pub(super) run: usize,
    pub(super) rank: ContainerRank,
    pub(super) errors: &'a [ReportedError],
    pub(super) logs: &'a BTreeMap<String, Utf8PathBuf>,
    pub(super) metrics: &'a BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
pub(super) struct MergedContainer {
    pub(super) errors: Vec<ReportedError>,
    pub(super) logs: BTreeMap<String, Utf8PathBuf>,
    pub(super) metrics: BTreeMap<String, f64>,
}

/// Merges several attempts' views of the same container.
pub(super) fn merge_contributions(contributions: &[Contribution<'_>]) -> MergedContainer {
    let Some(worst) = worst_of(contributions, |c| c.rank) else {
        return MergedContainer::default();
    };

    if let [only] = contributions {
        return MergedContainer {
            errors: only.errors.to_vec(),
            logs: only.logs.clone(),
            metrics: only.metrics.clone(),
        };
    }

    let mut logs = BTreeMap::new();
    for contribution in contributions {
        for (key, path) in contribution.logs {
            logs.insert(format!("{key}.run{}", contribution.run), path.clone());
        }
    }

    // The worst container's errors come first, followed by the rest in input order.
    let ordered = std::iter::once(&contributions[worst]).chain(
        contributions
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != worst)
            .map(|(_, c)| c),
    );
    let mut grouped: IndexMap<&ReportedError, Vec<usize>> = IndexMap::new();
    for contribution in ordered {
        for error in contribution.errors {
            let runs = grouped.entry(error).or_default();
            if !runs.contains(&contribution.run) {
                runs.push(contribution.run);
            }
        }
    }
    let errors = grouped
        .into_iter()
        .map(|(error, mut runs)| {
            runs.sort_unstable();
            let message = match runs.as_slice() {
                [run] => format!("Run {run}: {}", error.message),
                _ => format!(
                    "Error from {} runs [{}]: {}",
                    runs.len(),
                    runs.iter().join(", "),
                    error.message
                ),
            };
            ReportedError {
                message,
                ..error.clone()
            }
        })
        .collect();

    MergedContainer {
        errors,
        logs,
        metrics: contributions[worst].metrics.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use testvisor_metadata::{ErrorOrigin, Status};

    #[test]
    fn worst_of_ties_go_first() {
        let ranks = [
            ContainerRank::Good,
            ContainerRank::Fail,
            ContainerRank::Timeout,
            ContainerRank::Fail,
        ];
        assert_eq!(worst_of(&ranks, |r| *r), Some(1));
        assert_eq!(worst_of(&[] as &[ContainerRank], |r| *r), None);
        assert_eq!(
            worst_of(&[ContainerRank::Good, ContainerRank::Good], |r| *r),
            Some(0)
        );
    }

    #[test]
    fn worst_of_ranking() {
        let ranks = [
            ContainerRank::Good,
            ContainerRank::Missing,
            ContainerRank::Flaky,
            ContainerRank::Timeout,
            ContainerRank::Fail,
            ContainerRank::Internal,
        ];
        assert_eq!(worst_of(&ranks, |r| *r), Some(5));
        assert_eq!(worst_of(&ranks[..5], |r| *r), Some(4));
        assert_eq!(worst_of(&ranks[..4], |r| *r), Some(3));
        assert_eq!(worst_of(&ranks[..3], |r| *r), Some(2));
        assert_eq!(worst_of(&ranks[..2], |r| *r), Some(1));
    }

    #[test]
    fn merge_keeps_provenance() {
        let timeout = ReportedError::new(Status::Timeout, "timed out", ErrorOrigin::Test);
        let fail = ReportedError::new(Status::Fail, "exit code 1", ErrorOrigin::Test);

        let logs1 = btreemap! { "stderr".to_owned() => Utf8PathBuf::from("a1/stderr.log") };
        let logs2 = btreemap! { "stderr".to_owned() => Utf8PathBuf::from("a2/stderr.log") };
        let logs3 = BTreeMap::new();
        let metrics1 = btreemap! { "peak_rss_bytes".to_owned() => 1.0 };
        let metrics2 = btreemap! { "peak_rss_bytes".to_owned() => 2.0 };
        let metrics3 = BTreeMap::new();

        let errors1 = [timeout.clone()];
        let errors2 = [fail.clone(), timeout.clone()];
        let contributions = [
            Contribution {
                run: 1,
                rank: ContainerRank::Timeout,
                errors: &errors1,
                logs: &logs1,
                metrics: &metrics1,
            },
            Contribution {
                run: 2,
                rank: ContainerRank::Fail,
                errors: &errors2,
                logs: &logs2,
                metrics: &metrics2,
            },
            Contribution {
                run: 3,
                rank: ContainerRank::Good,
                errors: &[],
                logs: &logs3,
                metrics: &metrics3,
            },
        ];

        let merged = merge_contributions(&contributions);
        assert_eq!(
            merged.logs,
            btreemap! {
                "stderr.run1".to_owned() => Utf8PathBuf::from("a1/stderr.log"),
                "stderr.run2".to_owned() => Utf8PathBuf::from("a2/stderr.log"),
            }
        );
        assert_eq!(merged.metrics, metrics2);
        let messages: Vec<_> = merged.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            ["Run 2: exit code 1", "Error from 2 runs [1, 2]: timed out"]
        );
        assert_eq!(merged.errors[0].status, Status::Fail);
    }

    #[test]
    fn single_contribution_is_unchanged() {
        let errors = [ReportedError::new(Status::Fail, "boom", ErrorOrigin::Test)];
        let logs = btreemap! { "stdout".to_owned() => Utf8PathBuf::from("stdout.log") };
        let metrics = BTreeMap::new();
        let merged = merge_contributions(&[Contribution {
            run: 1,
            rank: ContainerRank::Fail,
            errors: &errors,
            logs: &logs,
            metrics: &metrics,
        }]);
        assert_eq!(merged.errors, errors);
        assert_eq!(merged.logs, logs);
    }
}
