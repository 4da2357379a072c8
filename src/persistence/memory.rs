//! In-memory query record store.
//!
//! Mirrors the SQLite store's rules (bulk pending creation, single terminal
//! write) without a database, for tests and dry runs.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::records::{BatchId, BatchRecords, QueryRecord, QueryStatus, RecordId};
use super::QueryRecordStore;
use crate::error::{BatchError, Result};
use crate::query::PartialQuery;

#[derive(Debug, Default)]
struct MemoryState {
    next_batch: BatchId,
    records: Vec<QueryRecord>,
}

/// Query records kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every record.
    pub fn snapshot(&self) -> Vec<QueryRecord> {
        self.lock().map(|s| s.records.clone()).unwrap_or_default()
    }

    /// Number of records created so far.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.records.len()).unwrap_or_default()
    }

    /// Returns true if no record was ever created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| BatchError::internal("memory record store lock poisoned"))
    }

    fn update(
        &self,
        id: RecordId,
        allowed: &[QueryStatus],
        apply: impl FnOnce(&mut QueryRecord),
    ) -> Result<()> {
        let mut state = self.lock()?;
        let record = id
            .checked_sub(1)
            .and_then(|i| state.records.get_mut(i as usize))
            .ok_or_else(|| BatchError::persistence(format!("Record {id} not found")))?;

        if !allowed.contains(&record.status) {
            let what = if record.status.is_terminal() {
                "terminal"
            } else {
                record.status.as_str()
            };
            return Err(BatchError::persistence(format!("Record {id} already {what}")));
        }

        apply(record);
        record.updated_at = timestamp();
        Ok(())
    }
}

fn timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl QueryRecordStore for MemoryRecordStore {
    async fn create_batch(&self, units: &[PartialQuery]) -> Result<BatchRecords> {
        let mut state = self.lock()?;
        state.next_batch += 1;
        let batch_id = state.next_batch;
        let now = timestamp();

        let mut record_ids = Vec::with_capacity(units.len());
        for unit in units {
            let id = state.records.len() as RecordId + 1;
            state.records.push(QueryRecord {
                id,
                batch_id,
                unit_index: unit.index(),
                target_id: unit.target_id().to_string(),
                query_type: unit.query_type().to_string(),
                quantity: unit.quantity(),
                status: QueryStatus::Pending,
                details: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            });
            record_ids.push(id);
        }

        Ok(BatchRecords {
            batch_id,
            record_ids,
        })
    }

    async fn mark_in_flight(&self, id: RecordId) -> Result<()> {
        self.update(id, &[QueryStatus::Pending], |r| {
            r.status = QueryStatus::InFlight;
        })
    }

    async fn set_terminal(&self, id: RecordId, status: QueryStatus, details: &str) -> Result<()> {
        if !status.is_terminal() {
            return Err(BatchError::internal(format!(
                "'{status}' is not a terminal status"
            )));
        }
        self.update(id, &[QueryStatus::Pending, QueryStatus::InFlight], |r| {
            r.status = status;
            r.details = Some(details.to_string());
        })
    }

    async fn get(&self, id: RecordId) -> Result<Option<QueryRecord>> {
        let state = self.lock()?;
        Ok(state.records.iter().find(|r| r.id == id).cloned())
    }

    async fn list_batch(&self, batch_id: BatchId) -> Result<Vec<QueryRecord>> {
        let state = self.lock()?;
        let mut records: Vec<QueryRecord> = state
            .records
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.unit_index);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{expand, ExpansionDefaults, PartialQueryPayload, QueryTypeRegistry};

    fn units(n: usize) -> Vec<PartialQuery> {
        let payload = PartialQueryPayload {
            quantities: Some(vec![1; n]),
            ..Default::default()
        };
        expand(
            &payload,
            &QueryTypeRegistry::new(),
            &ExpansionDefaults::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_batches_get_distinct_ids() {
        let store = MemoryRecordStore::new();
        let a = store.create_batch(&units(2)).await.unwrap();
        let b = store.create_batch(&units(1)).await.unwrap();
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(a.record_ids, vec![1, 2]);
        assert_eq!(b.record_ids, vec![3]);
        assert_eq!(store.list_batch(a.batch_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_write_once() {
        let store = MemoryRecordStore::new();
        let created = store.create_batch(&units(1)).await.unwrap();
        let id = created.record_ids[0];

        store.mark_in_flight(id).await.unwrap();
        store
            .set_terminal(id, QueryStatus::Failed, "boom")
            .await
            .unwrap();
        let err = store
            .set_terminal(id, QueryStatus::Succeeded, "late")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already terminal"));

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, QueryStatus::Failed);
        assert_eq!(record.details.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_mark_in_flight_twice_rejected() {
        let store = MemoryRecordStore::new();
        let created = store.create_batch(&units(1)).await.unwrap();
        let id = created.record_ids[0];
        store.mark_in_flight(id).await.unwrap();
        assert!(store.mark_in_flight(id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_record() {
        let store = MemoryRecordStore::new();
        assert!(store.mark_in_flight(0).await.is_err());
        assert!(store
            .set_terminal(9, QueryStatus::Failed, "")
            .await
            .is_err());
    }
}
