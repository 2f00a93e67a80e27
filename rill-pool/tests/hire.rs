//! Behaviour tests for the worker lease lifecycle.

use rill_core::test_utils::Collector;
use rill_core::flush;
use rill_pool::{HiredWorker, LocalWorkerPool, PoolError, WorkerPool, hire};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn echo_pool(workers: usize) -> Arc<LocalWorkerPool> {
    LocalWorkerPool::new(workers, |task| async move {
        if task.get("fail").is_some() {
            Err("worker exploded".to_string())
        } else {
            Ok(json!({ "echo": task }))
        }
    })
}

#[tokio::test]
async fn hire_yields_one_dedicated_handle_until_release() {
    let pool = echo_pool(1);
    let collector: Collector<HiredWorker> = Collector::new();
    let sub = hire(pool.clone(), |_| {}, |_| {}).subscribe(collector.clone());
    flush().await;

    let handles = collector.values();
    assert_eq!(handles.len(), 1);
    let handle = &handles[0];

    let result = handle.send_task(json!({"n": 1})).await.unwrap();
    assert_eq!(result, json!({ "echo": { "n": 1 } }));

    // The flow stays open until release.
    assert!(!collector.is_completed());
    handle.release();
    sub.completed().await;
    assert!(collector.is_completed());

    // The worker is back: a second hire can check it out.
    let again: Collector<HiredWorker> = Collector::new();
    let sub2 = hire(pool, |_| {}, |_| {}).subscribe(again.clone());
    flush().await;
    assert_eq!(again.values().len(), 1);
    again.values()[0].release();
    sub2.completed().await;
}

#[tokio::test]
async fn release_is_idempotent_and_blocks_further_tasks() {
    let pool = echo_pool(1);
    let collector: Collector<HiredWorker> = Collector::new();
    let sub = hire(pool, |_| {}, |_| {}).subscribe(collector.clone());
    flush().await;

    let handle = collector.values().remove(0);
    handle.release();
    handle.release();
    sub.completed().await;

    assert!(handle.is_released());
    assert_eq!(
        handle.send_task(json!({})).await,
        Err(PoolError::LeaseReleased)
    );
}

#[tokio::test]
async fn unsubscribe_returns_the_worker() {
    let pool = echo_pool(1);
    let collector: Collector<HiredWorker> = Collector::new();
    let sub = hire(pool.clone(), |_| {}, |_| {}).subscribe(collector.clone());
    flush().await;
    assert_eq!(collector.values().len(), 1);

    sub.unsubscribe();
    sub.completed().await;

    // Checkout succeeds again without waiting.
    let worker = pool.checkout().await.unwrap();
    pool.checkin(worker).await.unwrap();
}

#[tokio::test]
async fn worker_error_auto_releases_the_lease() {
    let pool = echo_pool(1);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    let collector: Collector<HiredWorker> = Collector::new();
    let sub = hire(
        pool,
        |_| {},
        move |message| seen.lock().unwrap().push(message),
    )
    .subscribe(collector.clone());
    flush().await;

    let handle = collector.values().remove(0);
    let result = handle.send_task(json!({"fail": true})).await;
    assert!(matches!(result, Err(PoolError::Task(_))));

    // The error event reaches the callback and ends the lease on its own.
    sub.completed().await;
    assert!(handle.is_released());
    assert_eq!(errors.lock().unwrap().as_slice(), ["worker exploded"]);
}

#[tokio::test]
async fn messages_are_scoped_to_the_hired_worker() {
    let pool = echo_pool(2);
    let messages_a = Arc::new(Mutex::new(Vec::new()));
    let messages_b = Arc::new(Mutex::new(Vec::new()));

    let sink_a = messages_a.clone();
    let a: Collector<HiredWorker> = Collector::new();
    let sub_a = hire(
        pool.clone(),
        move |payload| sink_a.lock().unwrap().push(payload),
        |_| {},
    )
    .subscribe(a.clone());

    let sink_b = messages_b.clone();
    let b: Collector<HiredWorker> = Collector::new();
    let sub_b = hire(
        pool.clone(),
        move |payload| sink_b.lock().unwrap().push(payload),
        |_| {},
    )
    .subscribe(b.clone());
    flush().await;

    let handle_a = a.values().remove(0);
    let handle_b = b.values().remove(0);
    assert_ne!(handle_a.worker_id(), handle_b.worker_id());

    handle_a.send_task(json!("for-a")).await.unwrap();
    handle_b.send_task(json!("for-b")).await.unwrap();
    flush().await;

    assert_eq!(messages_a.lock().unwrap().as_slice(), &[json!({"echo": "for-a"})]);
    assert_eq!(messages_b.lock().unwrap().as_slice(), &[json!({"echo": "for-b"})]);

    handle_a.release();
    handle_b.release();
    sub_a.completed().await;
    sub_b.completed().await;
}
