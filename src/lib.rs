//! batchq - batch query expansion and dispatch.
//!
//! A batch arrives as parallel arrays of target ids, query types and
//! quantities. It is expanded into independent query units, each unit is
//! dispatched to its own target under a shared worker budget and a per-unit
//! timeout, and the results are merged back into one stream in request order.
//! Every unit's status is kept in a durable query record.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod merge;
pub mod persistence;
pub mod query;
pub mod target;

pub use engine::{BatchEngine, BatchResponse};
pub use error::{BatchError, Result};
