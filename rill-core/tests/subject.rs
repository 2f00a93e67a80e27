//! Behaviour tests for the subject family.

use rill_core::test_utils::Collector;
use rill_core::{BehaviorSubject, ReplaySubject, StreamError, Subject, flush};

#[tokio::test]
async fn subject_multicasts_to_all_subscribers() {
    let subject = Subject::new();
    let a = Collector::new();
    let b = Collector::new();
    let sub_a = subject.subscribe(a.clone());
    let sub_b = subject.subscribe(b.clone());
    flush().await;

    subject.next(1).unwrap();
    subject.next(2).unwrap();
    subject.complete().unwrap();
    sub_a.completed().await;
    sub_b.completed().await;

    assert_eq!(a.values(), vec![1, 2]);
    assert_eq!(b.values(), vec![1, 2]);
    assert!(a.is_completed() && b.is_completed());
}

#[tokio::test]
async fn subject_round_trip_preserves_write_order() {
    let subject = Subject::new();
    let collector = Collector::new();
    let sub = subject.subscribe(collector.clone());
    flush().await;

    for i in 0..32 {
        subject.next(i).unwrap();
    }
    subject.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), (0..32).collect::<Vec<_>>());
}

#[tokio::test]
async fn late_subject_subscribers_miss_earlier_values() {
    let subject = Subject::new();
    let early = Collector::new();
    let sub_early = subject.subscribe(early.clone());
    flush().await;

    subject.next(1).unwrap();
    flush().await;

    let late = Collector::new();
    let sub_late = subject.subscribe(late.clone());
    flush().await;

    subject.next(2).unwrap();
    subject.complete().unwrap();
    sub_early.completed().await;
    sub_late.completed().await;

    assert_eq!(early.values(), vec![1, 2]);
    assert_eq!(late.values(), vec![2]);
}

#[tokio::test]
async fn subject_error_reaches_every_subscriber_once() {
    let subject: Subject<i32> = Subject::new();
    let collector = Collector::new();
    let sub = subject.subscribe(collector.clone());
    flush().await;

    subject.next(1).unwrap();
    subject.error(StreamError::coerce("upstream fell over")).unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![1]);
    assert_eq!(collector.errors().len(), 1);
    assert!(!collector.is_completed());
}

#[tokio::test]
async fn tagged_writes_keep_their_lineage() {
    use rill_core::{EventSource, Tagged, ValueMeta};

    let subject = Subject::new();
    let mut reader = subject.flow().events();

    let origin = rill_core::ValueId::next();
    subject
        .next_tagged(Tagged::new(5, ValueMeta::source(origin)))
        .unwrap();

    let emission = reader.pull().await.unwrap().unwrap();
    assert_eq!(emission.value, 5);
    assert_eq!(emission.value_id(), Some(origin));
}

#[tokio::test]
async fn behavior_subject_serves_current_value_first() {
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
async fn behavior_subject_value_getter_tracks_writes() {
    let subject = BehaviorSubject::new(10);
    assert_eq!(subject.value(), Some(10));
    subject.next(11).unwrap();
    assert_eq!(subject.value(), Some(11));
}

#[tokio::test]
async fn behavior_subject_seed_resolves_for_early_subscribers() {
    let subject = BehaviorSubject::with_seed(async {
        tokio::task::yield_now().await;
        5
    });
    assert_eq!(subject.value(), None);
    let collector = Collector::new();
    let sub = subject.subscribe(collector.clone());
    flush().await;
    assert_eq!(subject.value(), Some(5));

    subject.complete().unwrap();
    sub.completed().await;
    assert_eq!(collector.values(), vec![5]);
}

#[tokio::test]
async fn replay_subject_replays_window_to_late_subscribers() {
    let subject = ReplaySubject::new(2);
    subject.next(1).await.unwrap();
    subject.next(2).await.unwrap();
    subject.next(3).await.unwrap();

    let collector = Collector::new();
    let sub = subject.subscribe(collector.clone());
    flush().await;

    subject.next(4).await.unwrap();
    subject.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![2, 3, 4]);
}

#[tokio::test]
async fn replay_backpressure_blocks_writer_until_reader_advances() {
    let subject = std::sync::Arc::new(ReplaySubject::new(2));
    let collector = Collector::new();
    let sub = subject.subscribe(collector.clone());
    flush().await;
    // Park the driver behind a slow consumer by not yielding to it: write
    // directly until the window is full of unread values.
    subject.next('a').await.unwrap();
    subject.next('b').await.unwrap();

    let writer = {
        let subject = subject.clone();
        tokio::spawn(async move { subject.next('c').await })
    };
    // The driver drains 'a' as soon as it runs, releasing the writer.
    writer.await.unwrap().unwrap();
    subject.complete().unwrap();
    sub.completed().await;
    assert_eq!(collector.values(), vec!['a', 'b', 'c']);
}

#[tokio::test]
async fn unbounded_replay_never_blocks() {
    let subject = ReplaySubject::unbounded();
    for i in 0..256 {
        subject.next(i).await.unwrap();
    }
    let collector = Collector::new();
    let sub = subject.subscribe(collector.clone());
    flush().await;
    subject.complete().unwrap();
    sub.completed().await;
    assert_eq!(collector.values(), (0..256).collect::<Vec<_>>());
}
