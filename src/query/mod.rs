//! Query units and their expansion from array payloads.
//!
//! The parallel-array submission shape stops at [`expand`]; everything
//! downstream works with strongly typed [`PartialQuery`] values.

pub mod payload;
pub mod registry;
pub mod unit;

pub use payload::{expand, ExpansionDefaults, PartialQueryPayload};
pub use registry::{QueryType, QueryTypeRegistry, BUILTIN_QUERY_TYPES};
pub use unit::{PartialQuery, TargetId};
