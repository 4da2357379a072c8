//! Registry of known query types.
//!
//! Query types form an append-only enumeration: new members may be registered
//! at startup from configuration, but existing members are never removed, so
//! persisted records always keep a meaningful type name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Query types every deployment knows about.
pub const BUILTIN_QUERY_TYPES: &[&str] =
    &["balance_check", "transaction_history", "account_status"];

/// A validated query type identifier.
///
/// Only obtainable through [`QueryTypeRegistry::lookup`], so holding one means
/// the name was known at expansion time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryType(String);

impl QueryType {
    /// Returns the type name as stored in query records.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-only set of known query type names, in registration order.
#[derive(Debug, Clone)]
pub struct QueryTypeRegistry {
    types: Vec<QueryType>,
}

impl QueryTypeRegistry {
    /// Creates a registry holding only the built-in types.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for name in BUILTIN_QUERY_TYPES {
            registry.register(*name);
        }
        registry
    }

    /// Creates a registry with no members.
    pub fn empty() -> Self {
        Self { types: Vec::new() }
    }

    /// Registers a type name. Returns false if it was already known.
    pub fn register(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.types.push(QueryType(name));
        true
    }

    /// Returns true if the name is a registered type.
    pub fn contains(&self, name: &str) -> bool {
        self.types.iter().any(|t| t.0 == name)
    }

    /// Resolves a name to its validated query type.
    pub fn lookup(&self, name: &str) -> Option<QueryType> {
        self.types.iter().find(|t| t.0 == name).cloned()
    }

    /// Iterates registered types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &QueryType> {
        self.types.iter()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for QueryTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
