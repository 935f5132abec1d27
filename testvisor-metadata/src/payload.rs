// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured result payloads attached to test cases.
//!
//! A payload is what a test reports as its "result" for canonical-data comparison. It's modeled
//! as a closed union rather than arbitrary JSON so that equality and diffing are well defined.

use crate::errors::PayloadError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The JSON key that marks an object as an external reference.
pub const EXTERNAL_KEY: &str = "$external";

/// A structured result payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum ResultPayload {
    /// A single scalar value.
    Scalar(Scalar),
    /// An ordered sequence of payloads.
    Sequence(Vec<ResultPayload>),
    /// A mapping from string keys to payloads.
    Mapping(BTreeMap<String, ResultPayload>),
    /// A reference to data stored outside the payload, e.g. a file or a blob.
    External(ExternalRef),
}

/// A scalar payload value.
#[derive(Clone, Debug)]
pub enum Scalar {
    /// JSON `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// A string.
    Str(String),
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            // NaN compares equal to itself here so that equality is reflexive.
            (Scalar::Float(a), Scalar::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Scalar::Str(a), Scalar::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Scalar {
    fn kind(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::Str(_) => "string",
        }
    }
}

/// A reference to data that lives outside the payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Where the data lives.
    pub uri: String,

    /// A checksum of the data, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// The size of the data in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A single difference found by [`ResultPayload::diff`].
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadDifference {
    /// The path to the differing value, e.g. `$.results[2].name`.
    pub path: String,
    /// What differs at that path.
    pub kind: DifferenceKind,
}

impl fmt::Display for PayloadDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.kind)
    }
}

/// The kind of a [`PayloadDifference`].
#[derive(Clone, Debug, PartialEq)]
pub enum DifferenceKind {
    /// The two values are of different kinds (e.g. a sequence and a scalar).
    TypeMismatch {
        /// The kind on the left.
        left: &'static str,
        /// The kind on the right.
        right: &'static str,
    },
    /// Two scalars of the same kind have different values.
    ValueMismatch {
        /// The value on the left.
        left: Scalar,
        /// The value on the right.
        right: Scalar,
    },
    /// Two sequences have different lengths. Common prefixes are still diffed.
    LengthMismatch {
        /// The length on the left.
        left: usize,
        /// The length on the right.
        right: usize,
    },
    /// A key present on the left is missing on the right.
    MissingKey,
    /// A key present on the right is missing on the left.
    ExtraKey,
    /// Two external references point to different data.
    ExternalMismatch {
        /// The reference on the left.
        left: ExternalRef,
        /// The reference on the right.
        right: ExternalRef,
    },
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DifferenceKind::TypeMismatch { left, right } => {
                write!(f, "type mismatch ({left} vs {right})")
            }
            DifferenceKind::ValueMismatch { left, right } => {
                write!(f, "value mismatch ({left:?} vs {right:?})")
            }
            DifferenceKind::LengthMismatch { left, right } => {
                write!(f, "length mismatch ({left} vs {right})")
            }
            DifferenceKind::MissingKey => write!(f, "missing on the right"),
            DifferenceKind::ExtraKey => write!(f, "missing on the left"),
            DifferenceKind::ExternalMismatch { left, right } => {
                write!(f, "external mismatch ({} vs {})", left.uri, right.uri)
            }
        }
    }
}

impl ResultPayload {
    /// Returns a short name for the kind of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ResultPayload::Scalar(scalar) => scalar.kind(),
            ResultPayload::Sequence(_) => "sequence",
            ResultPayload::Mapping(_) => "mapping",
            ResultPayload::External(_) => "external",
        }
    }

    /// Computes every difference between `self` (left) and `other` (right).
    ///
    /// The result is empty if and only if the two payloads are equal.
    pub fn diff(&self, other: &ResultPayload) -> Vec<PayloadDifference> {
        let mut out = Vec::new();
        diff_impl("$", self, other, &mut out);
        out
    }
}

fn diff_impl(
    path: &str,
    left: &ResultPayload,
    right: &ResultPayload,
    out: &mut Vec<PayloadDifference>,
) {
    let mut push = |kind| {
        out.push(PayloadDifference {
            path: path.to_owned(),
            kind,
        })
    };

    match (left, right) {
        (ResultPayload::Scalar(a), ResultPayload::Scalar(b)) => {
            if a.kind() != b.kind() {
                push(DifferenceKind::TypeMismatch {
                    left: a.kind(),
                    right: b.kind(),
                });
            } else if a != b {
                push(DifferenceKind::ValueMismatch {
                    left: a.clone(),
                    right: b.clone(),
                });
            }
        }
        (ResultPayload::Sequence(a), ResultPayload::Sequence(b)) => {
            if a.len() != b.len() {
                push(DifferenceKind::LengthMismatch {
                    left: a.len(),
                    right: b.len(),
                });
            }
            for (index, (a, b)) in a.iter().zip(b).enumerate() {
                diff_impl(&format!("{path}[{index}]"), a, b, out);
            }
        }
        (ResultPayload::Mapping(a), ResultPayload::Mapping(b)) => {
            for (key, a_value) in a {
                let child_path = format!("{path}.{key}");
                match b.get(key) {
                    Some(b_value) => diff_impl(&child_path, a_value, b_value, out),
                    None => out.push(PayloadDifference {
                        path: child_path,
                        kind: DifferenceKind::MissingKey,
                    }),
                }
            }
            for key in b.keys().filter(|key| !a.contains_key(*key)) {
                out.push(PayloadDifference {
                    path: format!("{path}.{key}"),
                    kind: DifferenceKind::ExtraKey,
                });
            }
        }
        (ResultPayload::External(a), ResultPayload::External(b)) => {
            if a != b {
                push(DifferenceKind::ExternalMismatch {
                    left: a.clone(),
                    right: b.clone(),
                });
            }
        }
        (a, b) => push(DifferenceKind::TypeMismatch {
            left: a.kind(),
            right: b.kind(),
        }),
    }
}

impl From<ResultPayload> for serde_json::Value {
    fn from(payload: ResultPayload) -> Self {
        match payload {
            ResultPayload::Scalar(Scalar::Null) => serde_json::Value::Null,
            ResultPayload::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(b),
            ResultPayload::Scalar(Scalar::Int(i)) => serde_json::Value::from(i),
            // Non-finite floats have no JSON representation and become null.
            ResultPayload::Scalar(Scalar::Float(f)) => serde_json::Number::from_f64(f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            ResultPayload::Scalar(Scalar::Str(s)) => serde_json::Value::String(s),
            ResultPayload::Sequence(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            ResultPayload::Mapping(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
            ResultPayload::External(external) => {
                let mut object = serde_json::Map::new();
                object.insert(
                    EXTERNAL_KEY.to_owned(),
                    serde_json::to_value(external)
                        .expect("serializing an ExternalRef is infallible"),
                );
                serde_json::Value::Object(object)
            }
        }
    }
}

impl TryFrom<serde_json::Value> for ResultPayload {
    type Error = PayloadError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let payload = match value {
            serde_json::Value::Null => ResultPayload::Scalar(Scalar::Null),
            serde_json::Value::Bool(b) => ResultPayload::Scalar(Scalar::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ResultPayload::Scalar(Scalar::Int(i))
                } else if let Some(f) = n.as_f64() {
                    ResultPayload::Scalar(Scalar::Float(f))
                } else {
                    return Err(PayloadError::NumberOutOfRange(n.to_string()));
                }
            }
            serde_json::Value::String(s) => ResultPayload::Scalar(Scalar::Str(s)),
            serde_json::Value::Array(items) => ResultPayload::Sequence(
                items
                    .into_iter()
                    .map(ResultPayload::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(mut object) => {
                if object.len() == 1
                    && let Some(external) = object.remove(EXTERNAL_KEY)
                {
                    let external: ExternalRef = serde_json::from_value(external)
                        .map_err(|error| PayloadError::InvalidExternal(error.to_string()))?;
                    ResultPayload::External(external)
                } else {
                    ResultPayload::Mapping(
                        object
                            .into_iter()
                            .map(|(key, value)| Ok((key, ResultPayload::try_from(value)?)))
                            .collect::<Result<_, PayloadError>>()?,
                    )
                }
            }
        };
        Ok(payload)
    }
}
