//! Integration tests for the SQLite query record store.

use std::sync::Arc;
use std::time::Duration;

use db_batchq::config::{Config, DispatchConfig};
use db_batchq::merge::MergedRecord;
use db_batchq::persistence::{self, QueryRecordStore, QueryStatus, StateDb};
use db_batchq::query::{expand, ExpansionDefaults, PartialQueryPayload, QueryTypeRegistry};
use db_batchq::target::{FailingTarget, MockResolver, MockTarget};
use db_batchq::BatchEngine;
use futures::StreamExt;
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};

async fn create_test_db() -> (Arc<StateDb>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test_state.db");
    let db = StateDb::open(&path).await.unwrap();
    (Arc::new(db), dir)
}

fn units(json: &str) -> Vec<db_batchq::query::PartialQuery> {
    let payload = PartialQueryPayload::from_json(json).unwrap();
    expand(
        &payload,
        &QueryTypeRegistry::new(),
        &ExpansionDefaults::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_state_db_creation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");

    let db = StateDb::open(&path).await.unwrap();
    assert!(path.exists());
    db.close().await;
}

#[tokio::test]
async fn test_batch_records_lifecycle() {
    let (db, _dir) = create_test_db().await;

    let created = db
        .create_batch(&units(
            r#"{"targetIds":["t1","t2"],"typeIds":["balance_check","account_status"],"quantities":[5,0]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(created.record_ids.len(), 2);

    let pending = db.list_batch(created.batch_id).await.unwrap();
    assert!(pending.iter().all(|r| r.status == QueryStatus::Pending));
    assert_eq!(pending[0].target_id, "t1");
    assert_eq!(pending[1].query_type, "account_status");
    assert_eq!(pending[0].quantity, 5);

    let id = created.record_ids[0];
    assert_ok!(db.mark_in_flight(id).await);
    assert_ok!(db.set_terminal(id, QueryStatus::Succeeded, "5 rows").await);

    let record = db.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, QueryStatus::Succeeded);
    assert_eq!(record.details.as_deref(), Some("5 rows"));

    db.close().await;
}

#[tokio::test]
async fn test_second_terminal_write_rejected() {
    let (db, _dir) = create_test_db().await;
    let created = db
        .create_batch(&units(r#"{"targetIds":["t1"]}"#))
        .await
        .unwrap();
    let id = created.record_ids[0];

    assert_ok!(db.set_terminal(id, QueryStatus::TimedOut, "timeout").await);
    let err = assert_err!(db.set_terminal(id, QueryStatus::Succeeded, "late").await);
    assert!(err.to_string().contains("already terminal"));

    let record = db.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, QueryStatus::TimedOut);
    assert_eq!(record.details.as_deref(), Some("timeout"));

    db.close().await;
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");

    let batch_id = {
        let db = StateDb::open(&path).await.unwrap();
        let created = db
            .create_batch(&units(r#"{"quantities":[1,2,3]}"#))
            .await
            .unwrap();
        db.close().await;
        created.batch_id
    };

    let db = StateDb::open(&path).await.unwrap();
    let records = db.list_batch(batch_id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().map(|r| r.unit_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(persistence::records::count_records(db.pool()).await.unwrap(), 3);
    db.close().await;
}

#[tokio::test]
async fn test_engine_writes_terminal_status_for_every_unit() {
    let (db, _dir) = create_test_db().await;
    let resolver = MockResolver::new()
        .with_target("ok", MockTarget::new("ok"))
        .with_target("down", FailingTarget::new("refused"))
        .with_target("slow", MockTarget::new("slow").with_delay(Duration::from_secs(30)));
    let config = Config {
        dispatch: DispatchConfig::new(2, Duration::from_millis(100)),
        ..Default::default()
    };
    let engine = BatchEngine::from_config(
        &config,
        Arc::new(resolver),
        Arc::clone(&db) as Arc<dyn QueryRecordStore>,
    )
    .unwrap();

    let payload = PartialQueryPayload::from_json(
        r#"{"targetIds":["ok","down","slow","missing"],"quantities":[3,1,1,1]}"#,
    )
    .unwrap();
    let response = engine.submit(&payload).await.unwrap();
    let batch_id = response.batch_id;
    let merged: Vec<MergedRecord> = response.stream.collect().await;
    let manifest = response.manifest.collect().await;

    assert_eq!(merged.iter().filter(|r| r.closes_segment()).count(), 4);

    let records = db.list_batch(batch_id).await.unwrap();
    let statuses: Vec<QueryStatus> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            QueryStatus::Succeeded,
            QueryStatus::Failed,
            QueryStatus::TimedOut,
            QueryStatus::Failed,
        ]
    );
    assert_eq!(statuses, manifest.statuses());
    assert_eq!(records[0].details.as_deref(), Some("3 rows from ok"));
    assert_eq!(records[1].details.as_deref(), Some("Target error: refused"));
    assert_eq!(records[3].details.as_deref(), Some("Target not found: missing"));

    db.close().await;
}
