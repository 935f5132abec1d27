// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::TestSize;
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The timestamp format used by [`MetaResult`].
pub const META_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// The record written when an attempt finishes.
///
/// The presence of this file is what tells an external observer that the attempt completed; it is
/// removed before an attempt starts and written atomically at the very end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaResult {
    /// The exit code of the test command. Negative values are fatal signals.
    pub exit_code: i32,
    /// Wall-clock time of the attempt, in seconds.
    pub elapsed: f64,
    /// When the attempt started, formatted with [`META_TIME_FORMAT`].
    pub start_time: String,
    /// When the attempt ended, formatted with [`META_TIME_FORMAT`].
    pub end_time: String,
    /// The working directory of the test command.
    pub cwd: Utf8PathBuf,
    /// The effective test timeout, in seconds.
    pub test_timeout: f64,
    /// The declared test size.
    pub test_size: TestSize,
    /// The declared test tags.
    pub test_tags: Vec<String>,
    /// The kind of test, e.g. `pytest` or `unittest`.
    pub test_type: String,
}

impl MetaResult {
    /// Formats a timestamp the way meta results store it.
    pub fn format_time<Tz>(time: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        time.format(META_TIME_FORMAT).to_string()
    }

    /// Returns the effective test timeout as a `Duration`, if it is valid.
    pub fn test_timeout(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.test_timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};

    #[test]
    fn time_format() {
        let time = FixedOffset::east_opt(0)
            .unwrap()
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2024, 3, 5)
                    .unwrap()
                    .and_hms_micro_opt(7, 8, 9, 123_456)
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(MetaResult::format_time(&time), "2024-03-05 07:08:09.123456");
    }

    #[test]
    fn json_keys() {
        let meta = MetaResult {
            exit_code: -11,
            elapsed: 1.5,
            start_time: "2024-03-05 07:08:09.000000".to_owned(),
            end_time: "2024-03-05 07:08:10.500000".to_owned(),
            cwd: "/tmp/work".into(),
            test_timeout: 60.0,
            test_size: TestSize::Large,
            test_tags: vec!["no-restart".to_owned()],
            test_type: "pytest".to_owned(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["exit_code"], -11);
        assert_eq!(json["test_size"], "large");
        assert_eq!(meta.test_timeout(), Some(Duration::from_secs(60)));
    }
}
