//! End-to-end scenarios across the whole workspace.

use rill::prelude::*;
use rill_core::test_utils::Collector;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The global tracer slot is process-wide; traced scenarios take this guard.
fn tracing_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[tokio::test]
async fn scenario_map_filter_with_trace_accounting() {
    let _guard = tracing_guard();
    let tracer = Arc::new(ValueTracer::new(TracerOptions::default()));
    enable_tracing(tracer.clone());

    let collector = Collector::new();
    let sub = Flow::from_iter(vec![1, 2, 3, 4, 5])
        .pipe(map(|x: i32| x * 2))
        .pipe(filter(|x: &i32| *x > 4))
        .subscribe(collector.clone());
    let subscription = sub.id();
    sub.completed().await;
    disable_tracing();

    assert_eq!(collector.values(), vec![6, 8, 10]);
    assert!(collector.is_completed());

    let states: Vec<TraceState> = tracer
        .get_all_traces()
        .into_iter()
        .filter(|t| t.record.subscription_id == subscription)
        .map(|t| t.state)
        .collect();
    assert_eq!(states.len(), 5, "five values emitted, five traces");
    let count = |state: TraceState| states.iter().filter(|s| **s == state).count();
    assert_eq!(count(TraceState::Delivered), 3);
    assert_eq!(count(TraceState::Filtered), 2);
    assert_eq!(count(TraceState::Dropped), 0);
}

#[tokio::test]
async fn scenario_buffer_until_batches_by_notifier_stamps() {
    let _guard = tracing_guard();
    let tracer = Arc::new(ValueTracer::new(TracerOptions::default()));
    enable_tracing(tracer.clone());

    let source = Subject::new();
    let notifier = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(buffer_until(notifier.flow()))
        .subscribe(collector.clone());
    let subscription = sub.id();
    flush().await;

    source.next(1).unwrap();
    source.next(2).unwrap();
    notifier.next(()).unwrap();
    source.next(3).unwrap();
    source.next(4).unwrap();
    source.next(5).unwrap();
    notifier.next(()).unwrap();
    flush().await;
    source.complete().unwrap();
    sub.completed().await;
    disable_tracing();

    assert_eq!(collector.values(), vec![vec![1, 2], vec![3, 4, 5]]);

    // The non-carrier inputs (2 in the first window, 4 and 5 in the second)
    // collapse into their window's carrier.
    let collapsed = tracer
        .get_all_traces()
        .into_iter()
        .filter(|t| t.record.subscription_id == subscription)
        .filter(|t| t.state == TraceState::Collapsed)
        .count();
    assert_eq!(collapsed, 3);
}

#[tokio::test]
async fn scenario_switch_map_keeps_only_the_last_inner() {
    let collector = Collector::new();
    Flow::from_iter(vec![1, 2, 3])
        .pipe(switch_map(|x: i32| Inner::many(vec![x * 10, x * 100])))
        .subscribe(collector.clone())
        .completed()
        .await;
    assert_eq!(collector.values(), vec![30, 300]);
}

#[tokio::test]
async fn scenario_behavior_subject_snapshots_per_subscriber() {
    let subject = BehaviorSubject::new(0);
    let a = Collector::new();
    let sub_a = subject.subscribe(a.clone());
    flush().await;

    subject.next(1).unwrap();
    flush().await;

    let b = Collector::new();
    let sub_b = subject.subscribe(b.clone());
    flush().await;

    subject.next(2).unwrap();
    subject.complete().unwrap();
    sub_a.completed().await;
    sub_b.completed().await;

    assert_eq!(a.values(), vec![0, 1, 2]);
    assert_eq!(b.values(), vec![1, 2]);
}

#[tokio::test]
async fn scenario_replay_backpressure_interleaves_writer_and_reader() {
    let subject = Arc::new(ReplaySubject::new(2));
    let mut reader = subject.flow().events();

    subject.next('a').await.unwrap();
    subject.next('b').await.unwrap();

    // Both retained slots are unread: writing 'c' must wait for the reader.
    let writer = {
        let subject = subject.clone();
        tokio::spawn(async move { subject.next('c').await })
    };
    flush().await;
    assert!(!writer.is_finished());

    let mut seen = Vec::new();
    seen.push(reader.pull().await.unwrap().unwrap().value);
    writer.await.unwrap().unwrap();
    subject.complete().unwrap();
    while let Some(e) = reader.pull().await.unwrap() {
        seen.push(e.value);
    }
    assert_eq!(seen, vec!['a', 'b', 'c']);
}

#[tokio::test]
async fn scenario_first_without_match_errors() {
    let collector = Collector::new();
    Flow::from_iter(vec![1, 3, 5])
        .pipe(first_matching(|x: &i32| x % 2 == 0))
        .subscribe(collector.clone())
        .completed()
        .await;

    assert!(collector.values().is_empty());
    assert!(!collector.is_completed());
    let errors = collector.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "No elements in sequence");
}
