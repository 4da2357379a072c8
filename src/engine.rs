//! The batch engine: expand, dispatch, merge.

use std::io::Write;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::{BatchManifest, Dispatcher, Manifest};
use crate::error::{BatchError, Result};
use crate::merge::{merge, MergedStream};
use crate::persistence::{BatchId, QueryRecordStore};
use crate::query::{expand, ExpansionDefaults, PartialQueryPayload, QueryTypeRegistry};
use crate::target::TargetResolver;

/// What a caller gets back for an accepted batch.
pub struct BatchResponse {
    pub batch_id: BatchId,
    pub unit_count: usize,
    /// Results of every unit, in index order.
    pub stream: MergedStream,
    /// Terminal status of every unit, available without reading `stream`.
    pub manifest: Manifest,
}

impl BatchResponse {
    /// Writes the merged stream to `out` as NDJSON, one record per line, and
    /// returns the manifest once every unit is terminal.
    ///
    /// A write error stops output but not the batch: the error is returned
    /// only after every unit has finished and its record is written.
    pub async fn write_ndjson<W: Write>(self, out: &mut W) -> Result<BatchManifest> {
        let BatchResponse {
            batch_id,
            mut stream,
            manifest,
            ..
        } = self;

        let written = async {
            while let Some(record) = stream.next().await {
                serde_json::to_writer(&mut *out, &record)
                    .map_err(|e| BatchError::output(e.to_string()))?;
                out.write_all(b"\n")
                    .map_err(|e| BatchError::output(e.to_string()))?;
            }
            out.flush().map_err(|e| BatchError::output(e.to_string()))
        }
        .await;
        drop(stream);

        let manifest = manifest.collect().await;
        match written {
            Ok(()) => Ok(manifest),
            Err(e) => {
                warn!(
                    "Batch {batch_id}: {e}; {} units finished without output",
                    manifest.units.len()
                );
                Err(e)
            }
        }
    }
}

/// Accepts batch submissions and runs them to completion.
pub struct BatchEngine {
    registry: QueryTypeRegistry,
    defaults: ExpansionDefaults,
    dispatcher: Dispatcher,
}

impl BatchEngine {
    pub fn new(
        registry: QueryTypeRegistry,
        defaults: ExpansionDefaults,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            registry,
            defaults,
            dispatcher,
        }
    }

    /// Builds an engine from configuration with the given collaborators.
    pub fn from_config(
        config: &Config,
        resolver: Arc<dyn TargetResolver>,
        store: Arc<dyn QueryRecordStore>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(resolver, store, config.dispatch)?;
        Ok(Self::new(
            config.registry(),
            config.defaults.clone(),
            dispatcher,
        ))
    }

    pub fn registry(&self) -> &QueryTypeRegistry {
        &self.registry
    }

    /// Submits a batch.
    ///
    /// Malformed payloads are rejected before any record is written or any
    /// target is contacted. Once accepted, a batch always completes: unit
    /// failures show up in the manifest and as markers in the stream.
    pub async fn submit(&self, payload: &PartialQueryPayload) -> Result<BatchResponse> {
        let units = expand(payload, &self.registry, &self.defaults)?;
        let dispatched = self.dispatcher.dispatch(units).await?;

        info!(
            "Batch {} accepted with {} units",
            dispatched.batch_id, dispatched.unit_count
        );

        Ok(BatchResponse {
            batch_id: dispatched.batch_id,
            unit_count: dispatched.unit_count,
            stream: merge(dispatched.outcomes),
            manifest: dispatched.manifest,
        })
    }
}
