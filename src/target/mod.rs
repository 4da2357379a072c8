//! External query targets.
//!
//! Provides the trait-based interface the dispatcher uses to reach targets,
//! allowing real database connections and test doubles to be used
//! interchangeably.

mod mock;
mod postgres;
mod resolver;
mod types;

pub use mock::{
    ConcurrencyGauge, FailingTarget, MockResolver, MockTarget, PanickingTarget, PendingTarget,
};
pub use postgres::PostgresTarget;
pub use resolver::ConfiguredResolver;
pub use types::{ResultStream, Row, TargetResponse, Value};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::query::{QueryType, TargetId};

/// A live handle to an external target.
///
/// Implementations must be thread-safe (Send + Sync) so one handle can serve
/// several units of a batch concurrently.
#[async_trait]
pub trait QueryTarget: Send + Sync {
    /// Performs the operation selected by `query_type`.
    ///
    /// `cancel` fires when the dispatcher gives up on the call. Targets that
    /// cannot abort in-flight work may ignore it.
    async fn invoke(
        &self,
        query_type: &QueryType,
        quantity: u64,
        cancel: CancellationToken,
    ) -> Result<TargetResponse>;
}

/// Maps target ids to live handles.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Resolves a target id, failing with `TargetNotFound` when unknown.
    async fn resolve(&self, target_id: &TargetId) -> Result<Arc<dyn QueryTarget>>;
}
