// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::Deserialize;
use std::{cmp::Ordering, fmt};

/// The default maximum number of restarts after the first attempt.
pub const MAX_RESTARTS: u32 = 3;

/// Strings in a test's stderr that indicate a transient failure worth retrying.
pub const DEFAULT_RESTART_INDICATORS: &[&str] = &[
    "Address already in use",
    "Resource temporarily unavailable",
    "Too many open files",
    "Connection reset by peer",
    "Cannot allocate memory",
];

/// Strings in a large test's stderr that indicate a broken host. These abort the whole run with
/// an infrastructure exit code instead of retrying.
pub const DEFAULT_INFRASTRUCTURE_MARKERS: &[&str] = &[
    "No space left on device",
    "Read-only file system",
    "Input/output error",
];

/// Type for the `retry` config key.
///
/// May be specified as a number (the maximum number of restarts) or as a table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetryConfig {
    /// The maximum number of restarts after the first attempt.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Strings that make a failed attempt eligible for a retry.
    #[serde(default = "default_restart_indicators")]
    pub restart_indicators: Vec<String>,

    /// Strings that abort the run with an infrastructure error, for large tests.
    #[serde(default = "default_infrastructure_markers")]
    pub infrastructure_markers: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::with_max_restarts(MAX_RESTARTS)
    }
}

impl RetryConfig {
    /// Creates a new config with the default markers and the given restart bound.
    pub fn with_max_restarts(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            restart_indicators: default_restart_indicators(),
            infrastructure_markers: default_infrastructure_markers(),
        }
    }
}

fn default_max_restarts() -> u32 {
    MAX_RESTARTS
}

fn default_restart_indicators() -> Vec<String> {
    DEFAULT_RESTART_INDICATORS
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_infrastructure_markers() -> Vec<String> {
    DEFAULT_INFRASTRUCTURE_MARKERS
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

pub(in crate::config) fn deserialize_retry_config<'de, D>(
    deserializer: D,
) -> Result<RetryConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;

    impl<'de2> serde::de::Visitor<'de2> for V {
        type Value = RetryConfig;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "a table ({{ max-restarts = 3, restart-indicators = [\"...\"] }}) or a number (3)"
            )
        }

        // Note that TOML uses i64, not u64.
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            match v.cmp(&0) {
                Ordering::Greater | Ordering::Equal => {
                    let v = u32::try_from(v).map_err(|_| {
                        serde::de::Error::invalid_value(
                            serde::de::Unexpected::Signed(v),
                            &"a positive u32",
                        )
                    })?;
                    Ok(RetryConfig::with_max_restarts(v))
                }
                Ordering::Less => Err(serde::de::Error::invalid_value(
                    serde::de::Unexpected::Signed(v),
                    &self,
                )),
            }
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let v = u32::try_from(v).map_err(|_| {
                serde::de::Error::invalid_value(serde::de::Unexpected::Unsigned(v), &"a u32")
            })?;
            Ok(RetryConfig::with_max_restarts(v))
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de2>,
        {
            RetryConfig::deserialize(serde::de::value::MapAccessDeserializer::new(map))
        }
    }

    // Post-deserialize validation.
    let config = deserializer.deserialize_any(V)?;
    if config.restart_indicators.iter().any(|s| s.is_empty()) {
        return Err(serde::de::Error::custom(
            "`restart-indicators` must not contain empty strings",
        ));
    }
    if config.infrastructure_markers.iter().any(|s| s.is_empty()) {
        return Err(serde::de::Error::custom(
            "`infrastructure-markers` must not contain empty strings",
        ));
    }

    Ok(config)
}
