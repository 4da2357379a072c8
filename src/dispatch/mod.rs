//! Fault-isolating dispatch of query units.
//!
//! Each unit runs in its own task, gated by a fixed pool of worker permits so
//! that no more than `workers` target calls are ever in flight. A unit's
//! failure, panic or timeout is turned into an [`Outcome`] and recorded; it
//! never reaches sibling units or the caller as an error.

mod isolate;
mod manifest;

pub use isolate::isolate;
pub use manifest::{BatchManifest, Manifest, ManifestEntry};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::{BatchError, Result};
use crate::persistence::{BatchId, QueryRecordStore, QueryStatus, RecordId};
use crate::query::PartialQuery;
use crate::target::{TargetResolver, TargetResponse};

/// Details written for units that ran out of time.
pub const TIMEOUT_DETAIL: &str = "timeout";

/// Terminal classification of a unit's execution.
#[derive(Debug)]
pub enum Outcome {
    Success(TargetResponse),
    Failure(BatchError),
    TimedOut,
}

impl Outcome {
    /// The record status this outcome maps to.
    pub fn status(&self) -> QueryStatus {
        match self {
            Self::Success(_) => QueryStatus::Succeeded,
            Self::Failure(_) => QueryStatus::Failed,
            Self::TimedOut => QueryStatus::TimedOut,
        }
    }

    /// The details string persisted with the terminal status.
    pub fn details(&self) -> String {
        match self {
            Self::Success(response) => response.details.clone(),
            Self::Failure(e) => e.to_string(),
            Self::TimedOut => TIMEOUT_DETAIL.to_string(),
        }
    }
}

/// A unit paired with how it ended.
pub type UnitOutcome = (PartialQuery, Outcome);

/// Outcomes in completion order.
pub type OutcomeStream = BoxStream<'static, UnitOutcome>;

/// A batch whose units are running.
pub struct Dispatched {
    pub batch_id: BatchId,
    pub unit_count: usize,
    pub outcomes: OutcomeStream,
    pub manifest: Manifest,
}

impl Dispatched {
    /// Waits for every outcome, in completion order.
    pub async fn collect(self) -> Vec<UnitOutcome> {
        self.outcomes.collect().await
    }
}

/// Runs query units against their targets with bounded concurrency.
pub struct Dispatcher {
    resolver: Arc<dyn TargetResolver>,
    store: Arc<dyn QueryRecordStore>,
    permits: Arc<Semaphore>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher. The worker budget is shared by every batch it
    /// dispatches.
    pub fn new(
        resolver: Arc<dyn TargetResolver>,
        store: Arc<dyn QueryRecordStore>,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver,
            store,
            permits: Arc::new(Semaphore::new(config.workers)),
            config,
        })
    }

    /// Records every unit as pending, then starts them.
    ///
    /// Only the initial record creation can fail; after that every unit is
    /// guaranteed to produce exactly one outcome.
    pub async fn dispatch(&self, units: Vec<PartialQuery>) -> Result<Dispatched> {
        let records = self.store.create_batch(&units).await?;
        if records.record_ids.len() != units.len() {
            let err = BatchError::internal(format!(
                "record store created {} records for {} units",
                records.record_ids.len(),
                units.len()
            ));
            self.fail_batch(records.batch_id, &err).await;
            return Err(err);
        }

        let unit_count = units.len();
        info!(
            "Batch {}: dispatching {} units ({} workers, {}ms timeout)",
            records.batch_id, unit_count, self.config.workers, self.config.unit_timeout_ms
        );

        // Capacity covers one send per unit, so finished units never wait
        // on a slow or absent consumer.
        let (outcome_tx, outcome_rx) = mpsc::channel::<UnitOutcome>(unit_count.max(1));
        let (manifest_tx, manifest_rx) = mpsc::unbounded_channel();

        for (unit, record_id) in units.into_iter().zip(records.record_ids) {
            let task = UnitTask {
                unit,
                record_id,
                resolver: Arc::clone(&self.resolver),
                store: Arc::clone(&self.store),
                permits: Arc::clone(&self.permits),
                timeout: self.config.unit_timeout(),
            };
            let outcome_tx = outcome_tx.clone();
            let manifest_tx = manifest_tx.clone();

            tokio::spawn(async move {
                let (unit, outcome, entry) = task.run().await;
                let _ = manifest_tx.send(entry);
                if outcome_tx.send((unit, outcome)).await.is_err() {
                    debug!("Outcome dropped: merged stream was abandoned");
                }
            });
        }

        let outcomes = stream::unfold(outcome_rx, |mut rx| async move {
            rx.recv().await.map(|outcome| (outcome, rx))
        })
        .boxed();

        Ok(Dispatched {
            batch_id: records.batch_id,
            unit_count,
            outcomes,
            manifest: Manifest::new(records.batch_id, unit_count, manifest_rx),
        })
    }

    /// Writes `failed` to every record of a batch that will not be run.
    async fn fail_batch(&self, batch_id: BatchId, reason: &BatchError) {
        let records = match self.store.list_batch(batch_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Batch {batch_id}: could not list records to fail them: {e}");
                return;
            }
        };
        let details = reason.to_string();
        for record in records.iter().filter(|r| !r.status.is_terminal()) {
            if let Err(e) = self
                .store
                .set_terminal(record.id, QueryStatus::Failed, &details)
                .await
            {
                warn!("Batch {batch_id}: record {} left unfailed: {e}", record.id);
            }
        }
    }
}

/// Everything one unit's task needs.
struct UnitTask {
    unit: PartialQuery,
    record_id: RecordId,
    resolver: Arc<dyn TargetResolver>,
    store: Arc<dyn QueryRecordStore>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl UnitTask {
    async fn run(self) -> (PartialQuery, Outcome, ManifestEntry) {
        let outcome = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => {
                if let Err(e) = self.store.mark_in_flight(self.record_id).await {
                    warn!("Unit {}: could not mark in flight: {e}", self.unit);
                }

                let cancel = CancellationToken::new();
                let call = invoke_unit(self.resolver.as_ref(), &self.unit, cancel.clone());
                let outcome = isolate(self.timeout, cancel, call).await;
                drop(permit);
                outcome
            }
            Err(_) => Outcome::Failure(BatchError::internal("worker pool closed")),
        };

        let status = outcome.status();
        let details = outcome.details();
        match &outcome {
            Outcome::Success(_) => debug!("Unit {} succeeded: {details}", self.unit),
            Outcome::Failure(_) => debug!("Unit {} failed: {details}", self.unit),
            Outcome::TimedOut => warn!("Unit {} timed out after {:?}", self.unit, self.timeout),
        }

        if let Err(e) = self
            .store
            .set_terminal(self.record_id, status, &details)
            .await
        {
            warn!("Unit {}: terminal status not recorded: {e}", self.unit);
        }

        let entry = ManifestEntry {
            index: self.unit.index(),
            target_id: self.unit.target_id().to_string(),
            query_type: self.unit.query_type().to_string(),
            status,
            details,
        };
        (self.unit, outcome, entry)
    }
}

async fn invoke_unit(
    resolver: &dyn TargetResolver,
    unit: &PartialQuery,
    cancel: CancellationToken,
) -> Result<TargetResponse> {
    let target = resolver.resolve(unit.target_id()).await?;
    target
        .invoke(unit.query_type(), unit.quantity(), cancel)
        .await
}
