//! Integration tests for batchq.

pub mod engine_test;
pub mod persistence_test;
pub mod postgres_test;
