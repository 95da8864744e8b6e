//! Deploy metadata tree and dotted-path resolution.
//!
//! Metadata arrives as arbitrary JSON. It is lifted once, at the transport
//! boundary, into [`MetaValue`] so resolution only deals with three shapes:
//! missing, scalar, or map.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::{Number, Value};

/// A leaf value in the metadata tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Number(Number),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A node of the read-only metadata tree attached to a deploy command.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(from = "Value")]
pub enum MetaValue {
    #[default]
    Missing,
    Scalar(Scalar),
    Map(BTreeMap<String, MetaValue>),
}

impl From<Value> for MetaValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Missing,
            Value::Bool(b) => Self::Scalar(Scalar::Bool(b)),
            Value::Number(n) => Self::Scalar(Scalar::Number(n)),
            Value::String(s) => Self::Scalar(Scalar::String(s)),
            // Arrays are addressed by index segment: `hosts.0`.
            Value::Array(items) => Self::Map(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), Self::from(v)))
                    .collect(),
            ),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl MetaValue {
    /// Walks `path` (segments split on `.`, empty segments ignored) and
    /// returns the scalar it lands on as text.
    ///
    /// Returns `None` when a key is absent, when a scalar is reached before
    /// the path is exhausted, or when the path ends on a map.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<String> {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            match node {
                Self::Map(children) => node = children.get(segment)?,
                Self::Scalar(_) | Self::Missing => return None,
            }
        }

        match node {
            Self::Scalar(scalar) => Some(scalar.to_string()),
            Self::Map(_) | Self::Missing => None,
        }
    }
}

/// Resolves `path` against an optional tree.
#[must_use]
pub fn resolve(tree: Option<&MetaValue>, path: &str) -> Option<String> {
    tree.and_then(|t| t.resolve(path))
}
