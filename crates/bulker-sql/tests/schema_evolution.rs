//! Schema evolution and destination lifecycle scenarios.
//!
//! Covers primary-key reconfiguration under the managed-constraint rule,
//! concurrent writers evolving one table, and destination swaps with
//! in-flight streams.

use serde_json::{json, Value};
use std::sync::Arc;

use bulker_core::prelude::*;
use bulker_core::schema::is_managed_pk;
use bulker_sql::memory::MemoryAdapter;
use bulker_sql::{Destination, DestinationConfig, DestinationRegistry, SqlAdapter};

fn record(value: Value) -> Record {
    value.as_object().expect("object").clone()
}

fn destination(adapter: &MemoryAdapter) -> Arc<Destination> {
    Destination::with_adapter("test-destination", Box::new(adapter.clone()))
}

async fn schema(adapter: &MemoryAdapter, table: &str) -> Table {
    let mut session = adapter.open_session().await.expect("session");
    session.get_table_schema(table).await.expect("schema")
}

#[tokio::test]
async fn test_managed_pk_is_reconfigured_on_drift() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);

    let options = StreamOptions {
        primary_keys: vec!["id".into()],
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, options)
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "tenant": "a"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let before = schema(&adapter, "events").await;
    assert_eq!(before.pk_fields.iter().collect::<Vec<_>>(), vec!["id"]);
    assert!(is_managed_pk(&before.pk_name));

    // a later producer widens the key
    let options = StreamOptions {
        primary_keys: vec!["id".into(), "tenant".into()],
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s2", "events", BulkMode::Batch, options)
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "tenant": "b"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let after = schema(&adapter, "events").await;
    assert_eq!(
        after.pk_fields.iter().collect::<Vec<_>>(),
        vec!["id", "tenant"]
    );
    assert!(is_managed_pk(&after.pk_name));
    assert_ne!(after.pk_name, before.pk_name);
}

#[tokio::test]
async fn test_user_defined_pk_is_preserved() {
    let adapter = MemoryAdapter::new();
    {
        let mut session = adapter.open_session().await.expect("session");
        let mut table = Table::new("events");
        table
            .columns
            .insert("id".into(), Column::of(DataType::Int64));
        table.pk_fields.insert("id".into());
        table.pk_name = "events_pkey".into();
        session.create_table(&table).await.expect("create");
    }

    let dest = destination(&adapter);
    let options = StreamOptions {
        primary_keys: vec!["id".into(), "tenant".into()],
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, options)
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "tenant": "a"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let after = schema(&adapter, "events").await;
    assert!(after.columns.contains_key("tenant"));
    assert_eq!(after.pk_fields.iter().collect::<Vec<_>>(), vec!["id"]);
    assert_eq!(after.pk_name, "events_pkey");
}

#[tokio::test]
async fn test_concurrent_streams_evolve_one_table() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let dest = Arc::clone(&dest);
            tokio::spawn(async move {
                let mut stream = dest
                    .create_stream(
                        &format!("s{i}"),
                        "events",
                        BulkMode::AutoCommit,
                        StreamOptions::default(),
                    )
                    .expect("stream");
                let mut row = Record::new();
                row.insert("id".into(), json!(i));
                row.insert(format!("c{i}"), json!("x"));
                stream.consume(row).await.expect("consume");
                stream.complete().await.expect("complete");
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("join");
    }

    let table = schema(&adapter, "events").await;
    for i in 0..4 {
        assert!(table.columns.contains_key(&format!("c{i}")), "missing c{i}");
    }
    let mut session = adapter.open_session().await.expect("session");
    assert_eq!(session.count("events").await.expect("count"), 4);
}

#[tokio::test]
async fn test_registry_swap_keeps_old_destination_usable() {
    let old_adapter = MemoryAdapter::new();
    let new_adapter = MemoryAdapter::new();
    let registry = DestinationRegistry::new();
    registry.register(destination(&old_adapter));

    let dest = registry.get("test-destination").expect("destination");
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, StreamOptions::default())
        .expect("stream");
    stream
        .consume(record(json!({"id": 1})))
        .await
        .expect("consume");

    // a config reload swaps the destination while the stream is in flight
    let replaced = registry
        .register(destination(&new_adapter))
        .expect("replaced");
    drop(replaced);

    stream
        .consume(record(json!({"id": 2})))
        .await
        .expect("consume after swap");
    stream.complete().await.expect("complete");

    let mut session = old_adapter.open_session().await.expect("session");
    assert_eq!(session.count("events").await.expect("count"), 2);
    assert!(!schema(&new_adapter, "events").await.exists());
}

#[tokio::test]
async fn test_connect_builds_memory_destination() {
    let config: DestinationConfig = serde_json::from_value(json!({
        "id": "in-memory",
        "type": "memory",
    }))
    .expect("config");
    let dest = bulker_sql::destination::connect(config).await.expect("connect");

    let mut stream = dest
        .create_stream("s1", "pages", BulkMode::Batch, StreamOptions::default())
        .expect("stream");
    stream
        .consume(record(json!({"url": "/"})))
        .await
        .expect("consume");
    let state = stream.complete().await.expect("complete");
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.successful_rows, 1);
}

#[tokio::test]
async fn test_bigquery_rejects_autocommit_streams() {
    let config: DestinationConfig = serde_json::from_value(json!({
        "id": "bq",
        "type": "bigquery",
        "parameters": {
            "project": "acme",
            "dataset": "events",
            "accessToken": "token",
        },
    }))
    .expect("config");
    let adapter = bulker_sql::bigquery::BigQueryAdapter::connect(&config).expect("adapter");
    let dest = Destination::with_adapter("bq", Box::new(adapter));

    let err = dest
        .create_stream("s1", "events", BulkMode::AutoCommit, StreamOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::AutocommitUnsupported { .. }));

    // batch mode is still constructible
    dest.create_stream("s2", "events", BulkMode::Batch, StreamOptions::default())
        .expect("batch stream");
}
