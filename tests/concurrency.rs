//! Concurrency tests: racing writers and shared storage between stores.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{Product, ProductError, create, ctx, memory, open_store, rename};
use eventstream_es::{AggregateStore, ExecuteError, NewEvent, StoreError};

#[tokio::test]
async fn racing_appends_at_same_start_have_one_winner() {
    let storage = memory();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let storage = Arc::clone(&storage);
        tasks.push(tokio::spawn(async move {
            storage
                .append(
                    "product-a",
                    1,
                    vec![NewEvent::new("Created", format!("{{\"name\":\"{i}\"}}").into_bytes())],
                )
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(globals) => {
                winners += 1;
                assert_eq!(globals.len(), 1);
            }
            Err(err) => assert!(matches!(err, StoreError::DuplicateConflict(_)), "{err}"),
        }
    }
    assert_eq!(winners, 1);

    let events = storage.read_stream("product-a", 1, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stream_sequence, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_batches_commit_whole_or_nothing() {
    let storage = memory();
    for round in 0..2u64 {
        let start = round * 4 + 1;
        let mut tasks = Vec::new();
        for writer in 0..8 {
            let storage = Arc::clone(&storage);
            tasks.push(tokio::spawn(async move {
                let batch = (0..4)
                    .map(|n| NewEvent::new(format!("R{round}W{writer}E{n}"), b"{}".to_vec()))
                    .collect();
                (writer, storage.append("product-a", start, batch).await)
            }));
        }

        let mut winner = None;
        for task in tasks {
            match task.await.unwrap() {
                (writer, Ok(globals)) => {
                    assert!(winner.is_none(), "two batches committed at start {start}");
                    assert_eq!(globals, (start..start + 4).collect::<Vec<_>>());
                    winner = Some(writer);
                }
                (_, Err(err)) => {
                    assert!(matches!(err, StoreError::DuplicateConflict(_)), "{err}")
                }
            }
        }
        let winner = winner.expect("one batch commits");

        let events = storage.read_stream("product-a", start, 10).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.stream_sequence).collect();
        assert_eq!(seqs, (start..start + 4).collect::<Vec<_>>());
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        let expected: Vec<String> = (0..4).map(|n| format!("R{round}W{winner}E{n}")).collect();
        assert_eq!(types, expected);
    }

    // Losing batches left nothing behind in either ordering.
    let all = storage.read_stream("product-a", 1, 100).await.unwrap();
    let seqs: Vec<u64> = all.iter().map(|e| e.stream_sequence).collect();
    assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    let globals: Vec<u64> = all.iter().map(|e| e.global_sequence).collect();
    assert_eq!(globals, (1..=8).collect::<Vec<_>>());
    assert_eq!(storage.head().await.unwrap(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_on_one_stream_are_serialized() {
    let store = open_store(memory()).await;
    store
        .get::<Product>("a")
        .await
        .unwrap()
        .execute(create("v0"), ctx())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 1..=20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let product = store.get::<Product>("a").await.unwrap();
            product.execute(rename(&format!("v{i}")), ctx()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("serialized commands never conflict");
    }

    let events = store.storage().read_stream("product-a", 1, 100).await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.stream_sequence).collect();
    assert_eq!(seqs, (1..=21).collect::<Vec<_>>());
    let state = store.get::<Product>("a").await.unwrap().state().await.unwrap();
    assert_eq!(state.renames, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_sequence_is_gap_free_across_streams() {
    let store = open_store(memory()).await;
    let mut tasks = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let product = store.get::<Product>(&format!("p{i}")).await.unwrap();
            product.execute(create("x"), ctx()).await.unwrap();
            for n in 0..4 {
                product.execute(rename(&format!("x{n}")), ctx()).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let log = store.storage().read_global(1, 1000, None).await.unwrap();
    let globals: Vec<u64> = log.iter().map(|e| e.global_sequence).collect();
    assert_eq!(globals, (1..=50).collect::<Vec<_>>());

    // Every stream's sequences are dense in global order too.
    let mut last_seq: HashMap<&str, u64> = HashMap::new();
    for event in &log {
        let last = last_seq.entry(event.stream_id.as_str()).or_default();
        assert_eq!(event.stream_sequence, *last + 1);
        *last = event.stream_sequence;
    }
    assert_eq!(store.storage().head().await.unwrap(), 50);
}

#[tokio::test]
async fn second_store_on_shared_storage_sees_conflict_then_reloads() {
    let storage = memory();
    let first = open_store(Arc::clone(&storage)).await;
    // Without projection streams, so `first` stays the only indexer.
    let second = AggregateStore::builder(Arc::clone(&storage))
        .open()
        .await
        .unwrap();

    let stale = second.get::<Product>("a").await.unwrap();
    assert!(!stale.state().await.unwrap().is_created);

    first
        .get::<Product>("a")
        .await
        .unwrap()
        .execute(create("first"), ctx())
        .await
        .unwrap();

    let err = stale.execute(create("second"), ctx()).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Conflict));

    // Resubmitting runs the handler against the reloaded state.
    let err = stale.execute(create("second"), ctx()).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Domain(ProductError::AlreadyCreated)));
    assert_eq!(stale.state().await.unwrap().name, "first");

    first.shutdown().await;
    second.shutdown().await;
}
