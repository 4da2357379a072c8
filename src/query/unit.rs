//! The expanded, self-contained query unit.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::registry::QueryType;

/// Opaque handle naming an external target (a configured connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Creates a target id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the target name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One expanded query unit.
///
/// Fields are private: a unit is immutable once the expander has built it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialQuery {
    index: usize,
    target_id: TargetId,
    query_type: QueryType,
    quantity: u64,
}

impl PartialQuery {
    pub(crate) fn new(
        index: usize,
        target_id: TargetId,
        query_type: QueryType,
        quantity: u64,
    ) -> Self {
        Self {
            index,
            target_id,
            query_type,
            quantity,
        }
    }

    /// Position of this unit in the submitted arrays.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    pub fn query_type(&self) -> &QueryType {
        &self.query_type
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }
}

impl fmt::Display for PartialQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}({}) @ {}",
            self.index, self.query_type, self.quantity, self.target_id
        )
    }
}
