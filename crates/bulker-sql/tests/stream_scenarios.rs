//! End-to-end stream scenarios over the in-memory backend.
//!
//! These exercise the four delivery modes through the public stream API:
//! type widening across a batch, the auto-commit type-collision recovery,
//! replace-table and replace-partition semantics, merge idempotence, and
//! the commit/abort protocol.

use serde_json::{json, Value};
use std::sync::Arc;

use bulker_core::prelude::*;
use bulker_sql::memory::MemoryAdapter;
use bulker_sql::{Destination, SqlAdapter};

fn record(value: Value) -> Record {
    value.as_object().expect("object").clone()
}

fn destination(adapter: &MemoryAdapter) -> Arc<Destination> {
    Destination::with_adapter("test-destination", Box::new(adapter.clone()))
}

async fn rows(adapter: &MemoryAdapter, table: &str) -> Vec<Record> {
    let mut session = adapter.open_session().await.expect("session");
    session.select_all(table).await.expect("select")
}

async fn schema(adapter: &MemoryAdapter, table: &str) -> Table {
    let mut session = adapter.open_session().await.expect("session");
    session.get_table_schema(table).await.expect("schema")
}

#[tokio::test]
async fn test_batch_type_widening() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, StreamOptions::default())
        .expect("stream");

    for value in [json!("7"), json!(7), json!(3.14), json!("str")] {
        stream
            .consume(record(json!({"id": 1, "v": value})))
            .await
            .expect("consume");
    }
    let state = stream.complete().await.expect("complete");
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.successful_rows, 4);

    let table = schema(&adapter, "events").await;
    assert_eq!(table.columns["v"].data_type, DataType::String);

    let stored: Vec<Value> = rows(&adapter, "events")
        .await
        .into_iter()
        .map(|r| r["v"].clone())
        .collect();
    assert_eq!(
        stored,
        vec![json!("7"), json!("7"), json!("3.14"), json!("str")]
    );
}

#[tokio::test]
async fn test_stream_collision_widens_on_transactional_backend() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::AutoCommit,
            StreamOptions::default(),
        )
        .expect("stream");

    stream
        .consume(record(json!({"id": 1, "n": 1})))
        .await
        .expect("first record");
    stream
        .consume(record(json!({"id": 2, "n": "a"})))
        .await
        .expect("second record recovers");
    let state = stream.complete().await.expect("complete");
    assert_eq!(state.successful_rows, 2);

    let table = schema(&adapter, "events").await;
    assert_eq!(table.columns["n"].data_type, DataType::String);

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored[0]["n"], json!("1"));
    assert_eq!(stored[1]["n"], json!("a"));
}

#[tokio::test]
async fn test_stream_collision_diverts_without_widening() {
    let adapter = MemoryAdapter::without_widening();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::AutoCommit,
            StreamOptions::default(),
        )
        .expect("stream");

    stream
        .consume(record(json!({"id": 1, "n": 1})))
        .await
        .expect("first record");
    stream
        .consume(record(json!({"id": 2, "n": "a"})))
        .await
        .expect("second record diverts");
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0]["n"], json!(1));
    assert_eq!(stored[0]["_unmapped_data"], Value::Null);
    assert_eq!(stored[1]["n"], Value::Null);
    assert_eq!(stored[1]["_unmapped_data"], json!("{\"n\":\"a\"}"));
}

#[tokio::test]
async fn test_replace_table_with_zero_records_truncates() {
    let adapter = MemoryAdapter::new();

    // pre-existing destination with data
    {
        let mut session = adapter.open_session().await.expect("session");
        let mut table = Table::new("events");
        table
            .columns
            .insert("id".into(), Column::of(DataType::Int64));
        table
            .columns
            .insert("name".into(), Column::of(DataType::String));
        session.create_table(&table).await.expect("create");
        for i in 0..100 {
            session
                .insert(
                    &table,
                    false,
                    &[record(json!({"id": i, "name": format!("row{i}")}))],
                )
                .await
                .expect("seed");
        }
    }

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::ReplaceTable,
            StreamOptions::default(),
        )
        .expect("stream");
    let state = stream.complete().await.expect("complete");
    assert_eq!(state.status, StreamStatus::Completed);

    let table = schema(&adapter, "events").await;
    assert_eq!(
        table.column_names().collect::<Vec<_>>(),
        vec!["id", "name"]
    );
    assert!(rows(&adapter, "events").await.is_empty());
}

#[tokio::test]
async fn test_replace_table_swaps_and_drops_old() {
    let adapter = MemoryAdapter::new();
    {
        let mut session = adapter.open_session().await.expect("session");
        let mut table = Table::new("events");
        table
            .columns
            .insert("id".into(), Column::of(DataType::Int64));
        session.create_table(&table).await.expect("create");
        session
            .insert(&table, false, &[record(json!({"id": 999}))])
            .await
            .expect("seed");
    }

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::ReplaceTable,
            StreamOptions::default(),
        )
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "v": "a"})))
        .await
        .expect("consume");
    stream
        .consume(record(json!({"id": 2, "v": "b"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0]["id"], json!(1));
    // staging and deprecated tables are gone
    assert_eq!(adapter.table_names(), vec!["events".to_owned()]);
}

#[tokio::test]
async fn test_replace_table_survives_drop_failure() {
    let adapter = MemoryAdapter::new();
    {
        let mut session = adapter.open_session().await.expect("session");
        let mut table = Table::new("events");
        table
            .columns
            .insert("id".into(), Column::of(DataType::Int64));
        session.create_table(&table).await.expect("create");
    }

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::ReplaceTable,
            StreamOptions::default(),
        )
        .expect("stream");
    stream
        .consume(record(json!({"id": 1})))
        .await
        .expect("consume");

    adapter.fail_next_drop();
    let state = stream.complete().await.expect("complete despite drop failure");
    assert_eq!(state.status, StreamStatus::Completed);

    assert_eq!(rows(&adapter, "events").await.len(), 1);
    // the deprecated table is left behind for out-of-band cleanup
    assert!(adapter
        .table_names()
        .iter()
        .any(|n| n.starts_with("deprecated_events_")));
}

#[tokio::test]
async fn test_replace_partition_scopes_to_one_partition() {
    let adapter = MemoryAdapter::new();
    {
        let mut session = adapter.open_session().await.expect("session");
        let mut table = Table::new("events");
        table
            .columns
            .insert("id".into(), Column::of(DataType::Int64));
        table
            .columns
            .insert("__partition_id".into(), Column::of(DataType::String));
        session.create_table(&table).await.expect("create");
        for (id, partition) in [(1, "2024-01-01"), (2, "2024-01-01"), (3, "2024-01-02")] {
            session
                .insert(
                    &table,
                    false,
                    &[record(json!({"id": id, "__partition_id": partition}))],
                )
                .await
                .expect("seed");
        }
    }

    let dest = destination(&adapter);
    let options = StreamOptions {
        partition_id: Some("2024-01-01".into()),
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::ReplacePartition, options)
        .expect("stream");
    for id in [10, 11, 12] {
        stream
            .consume(record(json!({"id": id})))
            .await
            .expect("consume");
    }
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    let in_partition: Vec<&Record> = stored
        .iter()
        .filter(|r| r["__partition_id"] == json!("2024-01-01"))
        .collect();
    let untouched: Vec<&Record> = stored
        .iter()
        .filter(|r| r["__partition_id"] == json!("2024-01-02"))
        .collect();
    assert_eq!(in_partition.len(), 3);
    assert_eq!(untouched.len(), 1);
    assert_eq!(untouched[0]["id"], json!(3));
}

#[tokio::test]
async fn test_batch_merge_is_idempotent_on_primary_key() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let options = StreamOptions {
        merge: true,
        primary_keys: vec!["id".into()],
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, options)
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "v": "a"})))
        .await
        .expect("consume");
    stream
        .consume(record(json!({"id": 1, "v": "b"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["v"], json!("b"));

    let table = schema(&adapter, "events").await;
    assert_eq!(table.pk_fields.iter().collect::<Vec<_>>(), vec!["id"]);
}

#[tokio::test]
async fn test_autocommit_merges_when_primary_keys_configured() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let options = StreamOptions {
        primary_keys: vec!["id".into()],
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::AutoCommit, options)
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "v": "a"})))
        .await
        .expect("consume");
    stream
        .consume(record(json!({"id": 1, "v": "b"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["v"], json!("b"));
}

#[tokio::test]
async fn test_batch_size_commits_intermediate_chunks() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let options = StreamOptions {
        batch_size: 2,
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, options)
        .expect("stream");

    for id in 0..3 {
        stream
            .consume(record(json!({"id": id})))
            .await
            .expect("consume");
    }
    // the first chunk of two committed mid-stream
    assert_eq!(rows(&adapter, "events").await.len(), 2);

    let state = stream.complete().await.expect("complete");
    assert_eq!(state.successful_rows, 3);
    assert_eq!(rows(&adapter, "events").await.len(), 3);
}

#[tokio::test]
async fn test_abort_rolls_back_and_closes_stream() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, StreamOptions::default())
        .expect("stream");
    stream
        .consume(record(json!({"id": 1})))
        .await
        .expect("consume");

    let state = stream.abort().await;
    assert_eq!(state.status, StreamStatus::Aborted);
    assert!(!schema(&adapter, "events").await.exists());

    // abort is idempotent, consume after terminal fails
    assert_eq!(stream.abort().await.status, StreamStatus::Aborted);
    let err = stream.consume(record(json!({"id": 2}))).await.unwrap_err();
    assert!(matches!(err, Error::StreamClosed));
}

#[tokio::test]
async fn test_per_record_error_does_not_terminate_batch() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, StreamOptions::default())
        .expect("stream");

    // key collision after sanitization fails this record only
    let err = stream
        .consume(record(json!({"a_b": 1, "a": {"b": 2}})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyCollision { .. }));
    assert_eq!(stream.state().status, StreamStatus::Active);

    stream
        .consume(record(json!({"id": 1})))
        .await
        .expect("good record");
    let state = stream.complete().await.expect("complete");
    assert_eq!(state.successful_rows, 1);
    assert_eq!(state.processed_rows, 2);
    assert_eq!(rows(&adapter, "events").await.len(), 1);
}

#[tokio::test]
async fn test_record_error_aborts_replace_table() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::ReplaceTable,
            StreamOptions::default(),
        )
        .expect("stream");

    stream
        .consume(record(json!({"id": 1})))
        .await
        .expect("good record");
    stream
        .consume(record(json!({"a_b": 1, "a": {"b": 2}})))
        .await
        .unwrap_err();

    // a partial replace must not publish; complete replays the error
    let err = stream.complete().await.unwrap_err();
    assert!(err.to_string().contains("collision"));
    assert_eq!(stream.state().status, StreamStatus::Failed);
    assert!(!schema(&adapter, "events").await.exists());
}

#[tokio::test]
async fn test_autocommit_recovers_from_schema_drift() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s1",
            "events",
            BulkMode::AutoCommit,
            StreamOptions::default(),
        )
        .expect("stream");

    stream
        .consume(record(json!({"id": 1})))
        .await
        .expect("first record");

    // table vanishes behind the helper's cache
    {
        let mut session = adapter.open_session().await.expect("session");
        session.drop_table("events", false).await.expect("drop");
    }

    stream
        .consume(record(json!({"id": 2})))
        .await
        .expect("second record re-ensures");
    let state = stream.complete().await.expect("complete");
    assert_eq!(state.successful_rows, 2);

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["id"], json!(2));
}

#[tokio::test]
async fn test_column_type_hints_override_inference() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let options = StreamOptions {
        column_types: TypeHints::new().with("payload", "jsonb"),
        ..StreamOptions::default()
    };
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, options)
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "payload": "{\"a\": 1}"})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let table = schema(&adapter, "events").await;
    assert_eq!(table.columns["payload"].sql_type, "jsonb");
}

#[tokio::test]
async fn test_nested_records_flatten_into_columns() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, StreamOptions::default())
        .expect("stream");
    stream
        .consume(record(json!({
            "$a": 1,
            "(b)": 2,
            "c": {"d": {"e": 3}},
            "arr": [1, 2],
        })))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["_a"], json!(1));
    assert_eq!(stored[0]["_b_"], json!(2));
    assert_eq!(stored[0]["c_d_e"], json!(3));
    assert_eq!(stored[0]["arr"], json!("[1,2]"));
}

#[tokio::test]
async fn test_csv_staging_roundtrip() {
    let adapter = MemoryAdapter::new().with_csv_batches();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Batch, StreamOptions::default())
        .expect("stream");
    stream
        .consume(record(json!({"id": 1, "name": "with \"quotes\", and commas"})))
        .await
        .expect("consume");
    stream
        .consume(record(json!({"id": 2})))
        .await
        .expect("consume");
    stream.complete().await.expect("complete");

    let stored = rows(&adapter, "events").await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0]["name"], json!("with \"quotes\", and commas"));
    assert_eq!(stored[1]["name"], Value::Null);
}
