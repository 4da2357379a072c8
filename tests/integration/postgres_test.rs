//! Integration tests against a live PostgreSQL target.
//!
//! These tests require a running PostgreSQL database.
//! Set DATABASE_URL environment variable to run them.

use std::sync::Arc;
use std::time::Duration;

use db_batchq::config::{Config, ConnectionConfig, DispatchConfig, QueryTypeConfig};
use db_batchq::merge::MergedRecord;
use db_batchq::persistence::{QueryRecordStore, QueryStatus, StateDb};
use db_batchq::query::PartialQueryPayload;
use db_batchq::target::{ConfiguredResolver, Value};
use db_batchq::BatchEngine;
use futures::StreamExt;

fn test_config() -> Option<Config> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let mut config = Config::default();
    config.targets.insert(
        "primary".to_string(),
        ConnectionConfig {
            url: Some(url),
            ..Default::default()
        },
    );
    config.query_types.insert(
        "balance_check".to_string(),
        QueryTypeConfig {
            statement: Some("SELECT g AS n FROM generate_series(1, $1::int8) AS g".to_string()),
        },
    );
    Some(config)
}

#[tokio::test]
async fn test_batch_against_postgres() {
    let Some(config) = test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let resolver = Arc::new(ConfiguredResolver::from_config(&config));
    let store = Arc::new(StateDb::open_in_memory().await.unwrap());
    let engine = BatchEngine::from_config(
        &config,
        Arc::clone(&resolver) as Arc<dyn db_batchq::target::TargetResolver>,
        Arc::clone(&store) as Arc<dyn QueryRecordStore>,
    )
    .unwrap();

    let payload = PartialQueryPayload::from_json(
        r#"{"targetIds":["primary","nowhere","primary"],"quantities":[3,1,2]}"#,
    )
    .unwrap();
    let response = engine.submit(&payload).await.unwrap();
    let merged: Vec<MergedRecord> = response.stream.collect().await;
    let manifest = response.manifest.collect().await;

    assert_eq!(
        manifest.statuses(),
        vec![
            QueryStatus::Succeeded,
            QueryStatus::Failed,
            QueryStatus::Succeeded
        ]
    );

    let first_unit: Vec<&MergedRecord> = merged.iter().filter(|r| r.index() == 0).collect();
    assert_eq!(first_unit.len(), 4);
    assert_eq!(
        first_unit[0],
        &MergedRecord::Row {
            index: 0,
            row: vec![Value::Int(1)]
        }
    );
    assert_eq!(first_unit[3], &MergedRecord::End { index: 0, rows: 3 });
    assert_eq!(merged.last(), Some(&MergedRecord::End { index: 2, rows: 2 }));

    resolver.close().await;
    store.close().await;
}

#[tokio::test]
async fn test_unreachable_target_fails_unit_only() {
    let mut config = Config {
        dispatch: DispatchConfig::new(1, Duration::from_secs(30)),
        ..Default::default()
    };
    config.targets.insert(
        "dead".to_string(),
        ConnectionConfig {
            url: Some("postgres://nobody@127.0.0.1:1/none".to_string()),
            ..Default::default()
        },
    );

    let engine = BatchEngine::from_config(
        &config,
        Arc::new(ConfiguredResolver::from_config(&config)),
        Arc::new(StateDb::open_in_memory().await.unwrap()),
    )
    .unwrap();

    let payload = PartialQueryPayload::from_json(r#"{"targetIds":["dead"]}"#).unwrap();
    let response = engine.submit(&payload).await.unwrap();
    let manifest = response.manifest.collect().await;
    assert_eq!(manifest.statuses(), vec![QueryStatus::Failed]);
}
