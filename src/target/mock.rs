//! Mock targets for testing.
//!
//! Provides in-memory targets with predictable behavior (canned rows, errors,
//! panics, stalls) for headless runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{QueryTarget, ResultStream, Row, TargetResolver, TargetResponse, Value};
use crate::error::{BatchError, Result};
use crate::query::{QueryType, TargetId};

/// Tracks how many calls are unresolved at once.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of simultaneously unresolved calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls currently unresolved.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Total calls that have started.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> GaugeGuard {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(Arc::clone(self))
    }
}

/// Decrements the gauge when the call resolves or is dropped.
struct GaugeGuard(Arc<ConcurrencyGauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A target that returns `quantity` generated rows, or a fixed row set.
#[derive(Debug, Clone, Default)]
pub struct MockTarget {
    name: String,
    rows: Option<Vec<Row>>,
    delay: Option<Duration>,
    broken_after: Option<usize>,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl MockTarget {
    /// Creates a mock target that labels its rows with `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns exactly these rows regardless of quantity.
    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes the row stream fail after yielding `n` rows.
    pub fn with_broken_stream(mut self, n: usize) -> Self {
        self.broken_after = Some(n);
        self
    }

    /// Records call concurrency in the given gauge.
    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Rows are produced as the consumer pulls them.
    fn generate_rows(&self, query_type: &QueryType, quantity: u64) -> ResultStream {
        let name = Value::from(self.name.as_str());
        let kind = Value::from(query_type.as_str());
        stream::iter(0..quantity)
            .map(move |i| {
                let n = i64::try_from(i).unwrap_or(i64::MAX);
                Ok(vec![name.clone(), kind.clone(), Value::Int(n)])
            })
            .boxed()
    }
}

#[async_trait]
impl QueryTarget for MockTarget {
    async fn invoke(
        &self,
        query_type: &QueryType,
        quantity: u64,
        cancel: CancellationToken,
    ) -> Result<TargetResponse> {
        let _guard = self.gauge.as_ref().map(|p| p.enter());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(BatchError::target(format!("{} cancelled", self.name)));
                }
            }
        }

        let (count, rows) = match &self.rows {
            Some(rows) => (
                rows.len() as u64,
                stream::iter(rows.clone().into_iter().map(Ok)).boxed(),
            ),
            None => (quantity, self.generate_rows(query_type, quantity)),
        };
        let details = format!("{count} rows from {}", self.name);

        let rows = match self.broken_after {
            Some(n) => {
                let name = self.name.clone();
                let broken = stream::once(async move {
                    Err(BatchError::target(format!("{name} stream interrupted")))
                });
                rows.take(n).chain(broken).boxed()
            }
            None => rows,
        };
        Ok(TargetResponse::new(details, rows))
    }
}

/// A target that always fails.
#[derive(Debug, Clone)]
pub struct FailingTarget {
    message: String,
}

impl FailingTarget {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl QueryTarget for FailingTarget {
    async fn invoke(
        &self,
        _query_type: &QueryType,
        _quantity: u64,
        _cancel: CancellationToken,
    ) -> Result<TargetResponse> {
        Err(BatchError::target(self.message.clone()))
    }
}

/// A target whose call panics.
#[derive(Debug, Clone, Default)]
pub struct PanickingTarget;

#[async_trait]
impl QueryTarget for PanickingTarget {
    async fn invoke(
        &self,
        query_type: &QueryType,
        _quantity: u64,
        _cancel: CancellationToken,
    ) -> Result<TargetResponse> {
        panic!("target crashed while handling {query_type}");
    }
}

/// A target whose call never resolves and ignores cancellation.
#[derive(Debug, Clone, Default)]
pub struct PendingTarget {
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl PendingTarget {
    pub fn with_gauge(gauge: Arc<ConcurrencyGauge>) -> Self {
        Self { gauge: Some(gauge) }
    }
}

#[async_trait]
impl QueryTarget for PendingTarget {
    async fn invoke(
        &self,
        _query_type: &QueryType,
        _quantity: u64,
        _cancel: CancellationToken,
    ) -> Result<TargetResponse> {
        let _guard = self.gauge.as_ref().map(|p| p.enter());
        std::future::pending::<Result<TargetResponse>>().await
    }
}

/// Resolver over an in-memory table of targets.
#[derive(Clone, Default)]
pub struct MockResolver {
    targets: HashMap<TargetId, Arc<dyn QueryTarget>>,
    auto_create: bool,
}

impl MockResolver {
    /// Creates a resolver that only knows explicitly added targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver that answers every id with a fresh [`MockTarget`].
    pub fn permissive() -> Self {
        Self {
            targets: HashMap::new(),
            auto_create: true,
        }
    }

    /// Adds a target under the given id.
    pub fn with_target(
        mut self,
        id: impl Into<String>,
        target: impl QueryTarget + 'static,
    ) -> Self {
        self.targets.insert(TargetId::new(id), Arc::new(target));
        self
    }
}

#[async_trait]
impl TargetResolver for MockResolver {
    async fn resolve(&self, target_id: &TargetId) -> Result<Arc<dyn QueryTarget>> {
        if let Some(target) = self.targets.get(target_id) {
            return Ok(Arc::clone(target));
        }
        if self.auto_create {
            return Ok(Arc::new(MockTarget::new(target_id.as_str())));
        }
        Err(BatchError::target_not_found(target_id.as_str()))
    }
}
