//! End-to-end batch scenarios against mock targets.

use std::sync::Arc;
use std::time::Duration;

use db_batchq::config::{Config, DispatchConfig};
use db_batchq::merge::MergedRecord;
use db_batchq::persistence::{MemoryRecordStore, QueryRecordStore, QueryStatus};
use db_batchq::query::PartialQueryPayload;
use db_batchq::target::{
    ConcurrencyGauge, FailingTarget, MockResolver, MockTarget, PanickingTarget, PendingTarget,
    Value,
};
use db_batchq::{BatchEngine, BatchError};
use futures::StreamExt;
use pretty_assertions::assert_eq;

fn engine_with(
    resolver: MockResolver,
    store: Arc<MemoryRecordStore>,
    workers: usize,
    timeout: Duration,
) -> BatchEngine {
    let config = Config {
        dispatch: DispatchConfig::new(workers, timeout),
        ..Default::default()
    };
    BatchEngine::from_config(&config, Arc::new(resolver), store).unwrap()
}

fn payload(json: &str) -> PartialQueryPayload {
    PartialQueryPayload::from_json(json).unwrap()
}

/// Index of each closing record, in stream order.
fn segments(records: &[MergedRecord]) -> Vec<usize> {
    records
        .iter()
        .filter(|r| r.closes_segment())
        .map(MergedRecord::index)
        .collect()
}

#[tokio::test]
async fn test_two_targets_stream_in_request_order() {
    let resolver = MockResolver::new()
        .with_target("t1", MockTarget::new("t1").with_delay(Duration::from_millis(40)))
        .with_target("t2", MockTarget::new("t2"));
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(resolver, Arc::clone(&store), 4, Duration::from_secs(5));

    let response = engine
        .submit(&payload(
            r#"{"targetIds":["t1","t2"],"typeIds":["balance_check","balance_check"],"quantities":[1,1]}"#,
        ))
        .await
        .unwrap();
    let records: Vec<MergedRecord> = response.stream.collect().await;

    assert_eq!(
        records,
        vec![
            MergedRecord::Row {
                index: 0,
                row: vec![Value::from("t1"), Value::from("balance_check"), Value::Int(0)],
            },
            MergedRecord::End { index: 0, rows: 1 },
            MergedRecord::Row {
                index: 1,
                row: vec![Value::from("t2"), Value::from("balance_check"), Value::Int(0)],
            },
            MergedRecord::End { index: 1, rows: 1 },
        ]
    );
}

#[tokio::test]
async fn test_unknown_query_type_creates_no_records() {
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(
        MockResolver::permissive(),
        Arc::clone(&store),
        4,
        Duration::from_secs(5),
    );

    let err = engine
        .submit(&payload(r#"{"typeIds":["not_a_real_type"]}"#))
        .await
        .err()
        .unwrap();

    assert_eq!(
        err,
        BatchError::UnknownQueryType {
            index: 0,
            type_id: "not_a_real_type".to_string()
        }
    );
    assert!(err.is_validation());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_middle_unit_timeout() {
    let resolver = MockResolver::new()
        .with_target("a", MockTarget::new("a"))
        .with_target("slow", MockTarget::new("slow").with_delay(Duration::from_secs(30)))
        .with_target("c", MockTarget::new("c"));
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(resolver, Arc::clone(&store), 4, Duration::from_millis(100));

    let response = engine
        .submit(&payload(r#"{"targetIds":["a","slow","c"],"quantities":[1,1,1]}"#))
        .await
        .unwrap();
    let batch_id = response.batch_id;
    let records: Vec<MergedRecord> = response.stream.collect().await;
    let manifest = response.manifest.collect().await;

    assert_eq!(
        manifest.statuses(),
        vec![
            QueryStatus::Succeeded,
            QueryStatus::TimedOut,
            QueryStatus::Succeeded
        ]
    );
    assert_eq!(segments(&records), vec![0, 1, 2]);
    assert!(records.contains(&MergedRecord::Marker {
        index: 1,
        kind: QueryStatus::TimedOut,
        detail: "timeout".to_string(),
    }));

    let stored = store.list_batch(batch_id).await.unwrap();
    assert_eq!(stored[1].status, QueryStatus::TimedOut);
    assert_eq!(stored[1].details.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_failing_units_do_not_affect_siblings() {
    let resolver = MockResolver::new()
        .with_target("ok", MockTarget::new("ok"))
        .with_target("down", FailingTarget::new("connection refused"))
        .with_target("crash", PanickingTarget);
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(resolver, Arc::clone(&store), 2, Duration::from_secs(5));

    let response = engine
        .submit(&payload(
            r#"{"targetIds":["ok","down","ok","crash","ghost","ok"],"quantities":[2,2,2,2,2,2]}"#,
        ))
        .await
        .unwrap();
    let records: Vec<MergedRecord> = response.stream.collect().await;
    let manifest = response.manifest.collect().await;

    assert_eq!(segments(&records), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(manifest.count(QueryStatus::Succeeded), 3);
    assert_eq!(manifest.count(QueryStatus::Failed), 3);
    assert!(manifest.units[3].details.contains("panicked"));
    assert_eq!(manifest.units[4].details, "Target not found: ghost");

    let rows = records
        .iter()
        .filter(|r| matches!(r, MergedRecord::Row { .. }))
        .count();
    assert_eq!(rows, 6);
}

#[tokio::test]
async fn test_in_flight_calls_never_exceed_workers() {
    let gauge = ConcurrencyGauge::new();
    let resolver =
        MockResolver::new().with_target("stuck", PendingTarget::with_gauge(Arc::clone(&gauge)));
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(resolver, Arc::clone(&store), 4, Duration::from_millis(50));

    let ids: Vec<String> = (0..12).map(|_| "stuck".to_string()).collect();
    let response = engine
        .submit(&PartialQueryPayload {
            target_ids: Some(ids),
            ..Default::default()
        })
        .await
        .unwrap();
    let records: Vec<MergedRecord> = response.stream.collect().await;

    assert_eq!(segments(&records).len(), 12);
    assert_eq!(gauge.started(), 12);
    assert!(gauge.peak() >= 1);
    assert!(gauge.peak() <= 4, "peak concurrency {}", gauge.peak());
    assert_eq!(gauge.current(), 0);
}

#[tokio::test]
async fn test_broken_stream_yields_rows_then_marker() {
    let resolver = MockResolver::new()
        .with_target("flaky", MockTarget::new("flaky").with_broken_stream(2));
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(resolver, Arc::clone(&store), 1, Duration::from_secs(5));

    let response = engine
        .submit(&payload(r#"{"targetIds":["flaky"],"quantities":[5]}"#))
        .await
        .unwrap();
    let records: Vec<MergedRecord> = response.stream.collect().await;

    assert_eq!(records.len(), 3);
    assert!(matches!(
        records[2],
        MergedRecord::Marker {
            index: 0,
            kind: QueryStatus::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_dropping_stream_still_finishes_every_unit() {
    let resolver = MockResolver::new()
        .with_target("slow", MockTarget::new("slow").with_delay(Duration::from_millis(20)));
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(resolver, Arc::clone(&store), 2, Duration::from_secs(5));

    let response = engine
        .submit(&payload(r#"{"targetIds":["slow","slow","slow","slow"]}"#))
        .await
        .unwrap();
    drop(response.stream);

    let manifest = response.manifest.collect().await;
    assert_eq!(manifest.count(QueryStatus::Succeeded), 4);
    assert!(store
        .snapshot()
        .iter()
        .all(|r| r.status == QueryStatus::Succeeded));
}

#[tokio::test]
async fn test_empty_payload_completes_immediately() {
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with(
        MockResolver::permissive(),
        Arc::clone(&store),
        4,
        Duration::from_secs(5),
    );

    let response = engine
        .submit(&payload(r#"{"targetIds":[],"typeIds":[],"quantities":[]}"#))
        .await
        .unwrap();
    assert_eq!(response.unit_count, 0);
    assert!(response.stream.collect::<Vec<_>>().await.is_empty());
    assert!(response.manifest.collect().await.units.is_empty());
}
