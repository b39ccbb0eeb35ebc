//! Concurrency tests for the serial edit queue
//!
//! Edits submitted from many threads must behave as if they ran one after
//! another: every read-modify-write sees the previous edit's result.

use coffer::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

fn schema() -> SchemaModel {
    SchemaModel::new(1).with_entity(
        "Counter",
        EntitySchema::new()
            .with_attribute("name", AttributeSchema::required(AttributeKind::Text))
            .with_attribute("value", AttributeSchema::required(AttributeKind::Int)),
    )
}

fn open(dir: &tempfile::TempDir) -> Coordinator {
    let config = CoordinatorConfig::new(vec![StoreDescriptor::local_data(dir.path(), "Default")]);
    Coordinator::open(config, SchemaCatalog::single(schema())).unwrap()
}

fn increment(ctx: &mut Context) -> Result<i64> {
    let counter = match ctx.find_first("Counter", "name", "hits")? {
        Some(counter) => counter,
        None => ctx.insert("Counter", attrs! { "name" => "hits", "value" => 0i64 })?,
    };
    let next = ctx.attribute(counter, "value")?.as_i64().unwrap_or(0) + 1;
    ctx.set(counter, "value", next)?;
    Ok(next)
}

fn read_counter(coordinator: &Coordinator) -> i64 {
    coordinator
        .fetch_sync(|ctx| {
            let counter = ctx.find_first("Counter", "name", "hits")?.expect("counter exists");
            Ok(ctx.attribute(counter, "value")?.as_i64().unwrap())
        })
        .unwrap()
}

/// Concurrent read-modify-write edits must not lose updates
#[test]
fn test_no_lost_updates_from_many_threads() {
    let temp_dir = tempfile::tempdir().unwrap();
    let coordinator = open(&temp_dir);

    let num_threads = 8;
    let increments_per_thread = 25;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..increments_per_thread {
                    coordinator.edit_sync(increment).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        read_counter(&coordinator),
        (num_threads * increments_per_thread) as i64
    );
    let counters = coordinator
        .fetch_sync(|ctx| Ok(ctx.all("Counter")?.len()))
        .unwrap();
    assert_eq!(counters, 1);
}

/// Results come back in submission order for one submitter
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_edits_are_serialized() {
    let temp_dir = tempfile::tempdir().unwrap();
    let coordinator = open(&temp_dir);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.edit(increment).await.unwrap() })
        })
        .collect();

    let mut seen = Vec::new();
    for task in tasks {
        seen.push(task.await.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=16).collect::<Vec<i64>>());
    assert_eq!(read_counter(&coordinator), 16);
}

/// Readers run concurrently with the writer and always see a committed
/// state
#[test]
fn test_reads_during_writes_see_committed_values() {
    let temp_dir = tempfile::tempdir().unwrap();
    let coordinator = open(&temp_dir);
    coordinator.edit_sync(increment).unwrap();

    let writer = {
        let coordinator = coordinator.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                coordinator.edit_sync(increment).unwrap();
            }
        })
    };

    let mut last = 0;
    for _ in 0..50 {
        let value = read_counter(&coordinator);
        assert!(value >= last, "counter went backwards: {value} < {last}");
        last = value;
    }
    writer.join().unwrap();
    assert_eq!(read_counter(&coordinator), 51);
}

#[test]
fn test_detached_edits_run_before_flush_returns() {
    let temp_dir = tempfile::tempdir().unwrap();
    let coordinator = open(&temp_dir);

    for _ in 0..10 {
        coordinator
            .edit_detached(|ctx| increment(ctx).map(|_| ()))
            .unwrap();
    }
    coordinator.flush().unwrap();
    assert_eq!(read_counter(&coordinator), 10);
}
