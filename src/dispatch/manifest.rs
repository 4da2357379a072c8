//! Out-of-band batch summary.
//!
//! Each unit reports its terminal status here as well as on the outcome
//! stream, so a caller can get a summary without consuming any rows.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::persistence::{BatchId, QueryStatus};

/// Terminal state of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub target_id: String,
    pub query_type: String,
    pub status: QueryStatus,
    pub details: String,
}

/// Summary of a finished batch, in unit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub batch_id: BatchId,
    pub units: Vec<ManifestEntry>,
}

impl BatchManifest {
    /// Statuses in unit order.
    pub fn statuses(&self) -> Vec<QueryStatus> {
        self.units.iter().map(|u| u.status).collect()
    }

    /// Number of units with the given status.
    pub fn count(&self, status: QueryStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }
}

/// Receiving side of a batch's manifest.
pub struct Manifest {
    batch_id: BatchId,
    expected: usize,
    rx: mpsc::UnboundedReceiver<ManifestEntry>,
}

impl Manifest {
    pub(crate) fn new(
        batch_id: BatchId,
        expected: usize,
        rx: mpsc::UnboundedReceiver<ManifestEntry>,
    ) -> Self {
        Self {
            batch_id,
            expected,
            rx,
        }
    }

    /// Waits for every unit to reach a terminal state.
    pub async fn collect(mut self) -> BatchManifest {
        let mut units = Vec::with_capacity(self.expected);
        while let Some(entry) = self.rx.recv().await {
            units.push(entry);
        }
        if units.len() != self.expected {
            warn!(
                "Batch {}: manifest has {} of {} units",
                self.batch_id,
                units.len(),
                self.expected
            );
        }
        units.sort_by_key(|e| e.index);
        BatchManifest {
            batch_id: self.batch_id,
            units,
        }
    }
}
