//! Value and response types produced by query targets.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// A row of data streamed back by a target.
pub type Row = Vec<Value>;

/// Lazily produced rows for one unit.
pub type ResultStream = BoxStream<'static, Result<Row>>;

/// Represents a single value returned by a target.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Converts the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// What a target hands back once a call has been accepted.
///
/// `details` is a short summary persisted on the unit's query record; the rows
/// themselves are only read later, by the merger.
pub struct TargetResponse {
    pub details: String,
    pub rows: ResultStream,
}

impl TargetResponse {
    /// Creates a response streaming the given rows.
    pub fn new(details: impl Into<String>, rows: ResultStream) -> Self {
        Self {
            details: details.into(),
            rows,
        }
    }

    /// Creates a response from rows already in memory.
    pub fn from_rows(details: impl Into<String>, rows: Vec<Row>) -> Self {
        Self::new(details, stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    /// Creates a response with no rows.
    pub fn empty(details: impl Into<String>) -> Self {
        Self::from_rows(details, Vec::new())
    }
}

impl fmt::Debug for TargetResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetResponse")
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}
