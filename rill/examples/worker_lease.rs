//! Example: leasing a worker from a local pool.
//!
//! Hires one worker, sends it a couple of tasks, and releases it. The
//! message callback sees every result the worker surfaces.
//!
//! Run with: `cargo run --example worker_lease -p rill`

use rill::prelude::*;
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let pool = LocalWorkerPool::new(2, |task| async move {
        let n = task.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(json!({ "squared": n * n }))
    });

    let (handles_tx, mut handles_rx) = mpsc::unbounded_channel();
    let sub = hire(
        pool,
        |message| println!("worker said: {message}"),
        |error| eprintln!("worker failed: {error}"),
    )
    .subscribe(move |handle: HiredWorker| {
        let _ = handles_tx.send(handle);
    });

    let handle = handles_rx.recv().await.expect("one hired worker");
    println!("hired worker {}", handle.worker_id());

    for n in [3, 7] {
        let result = handle.send_task(json!({ "n": n })).await.unwrap();
        println!("task {n} -> {result}");
    }

    handle.release();
    sub.completed().await;
    println!("lease released, worker returned");
}
