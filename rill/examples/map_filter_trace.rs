//! Example: a traced map/filter pipeline.
//!
//! Runs a small pipeline with the value tracer enabled and prints the fate
//! of every source value. No external collaborators needed.
//!
//! Run with: `cargo run --example map_filter_trace -p rill`

use rill::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let tracer = Arc::new(ValueTracer::new(TracerOptions::default()));
    enable_tracing(tracer.clone());

    let flow = Flow::from_iter(1..=5)
        .pipe(map(|x: i32| x * 2))
        .pipe(filter(|x: &i32| *x > 4));

    let sub = flow.subscribe(|value: i32| println!("received {value}"));
    sub.completed().await;
    disable_tracing();

    for trace in tracer.get_all_traces() {
        println!(
            "value {} ({}) -> {:?} after {} operator steps",
            trace.record.value_id,
            trace.record.source_value,
            trace.state,
            trace.record.operator_steps.len(),
        );
    }
}
