//! Behaviour tests for the stamp-ordered coordination operators.

use rill_core::test_utils::Collector;
use rill_core::{Subject, flush};
use rill_ops::{Aux, buffer_until, skip_until, with_latest_from, with_latest_from_all};

#[tokio::test]
async fn buffer_until_flushes_windows_by_stamp_order() {
    let source = Subject::new();
    let notifier = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(buffer_until(notifier.flow()))
        .subscribe(collector.clone());
    flush().await;

    // Stamps follow call order: the first tick lands between 2 and 3, the
    // second after 5, regardless of how the racing pulls resolve.
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

    assert_eq!(collector.values(), vec![vec![1, 2], vec![3, 4, 5]]);
}

#[tokio::test]
async fn buffer_until_flushes_residue_on_source_completion() {
    let source = Subject::new();
    let notifier: Subject<()> = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(buffer_until(notifier.flow()))
        .subscribe(collector.clone());
    flush().await;

    source.next(1).unwrap();
    source.next(2).unwrap();
    flush().await;
    source.complete().unwrap();
    sub.completed().await;

    // The notifier never ticked: one final flush at completion.
    assert_eq!(collector.values(), vec![vec![1, 2]]);
    assert!(collector.is_completed());
}

#[tokio::test]
async fn with_latest_from_waits_for_the_auxiliary() {
    let source = Subject::new();
    let aux = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(with_latest_from(aux.flow()))
        .subscribe(collector.clone());
    flush().await;

    source.next(1).unwrap(); // no auxiliary value yet: dropped
    flush().await;
    aux.next(10).unwrap();
    flush().await;
    source.next(2).unwrap();
    flush().await;
    aux.next(20).unwrap();
    aux.next(30).unwrap();
    flush().await;
    source.next(3).unwrap();
    flush().await;

    source.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![(2, 10), (3, 30)]);
}

#[tokio::test]
async fn with_latest_from_accepts_one_shot_value_auxiliaries() {
    let source = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(with_latest_from(Aux::value(99)))
        .subscribe(collector.clone());
    flush().await;

    source.next(1).unwrap();
    source.next(2).unwrap();
    flush().await;
    source.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![(1, 99), (2, 99)]);
}

#[tokio::test]
async fn with_latest_from_all_pairs_every_auxiliary() {
    let source = Subject::new();
    let aux = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(with_latest_from_all(vec![
            Aux::value(5),
            Aux::from(aux.flow()),
        ]))
        .subscribe(collector.clone());
    flush().await;

    aux.next(7).unwrap();
    flush().await;
    source.next(1).unwrap();
    flush().await;

    source.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![(1, vec![5, 7])]);
}

#[tokio::test]
async fn with_latest_from_future_auxiliary_resolves_before_pairing() {
    let source = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(with_latest_from(Aux::future(|| async {
            tokio::task::yield_now().await;
            42
        })))
        .subscribe(collector.clone());
    flush().await;

    source.next(1).unwrap();
    flush().await;
    source.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![(1, 42)]);
}

#[tokio::test]
async fn skip_until_opens_on_the_first_notifier_emission() {
    let source = Subject::new();
    let gate = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(skip_until(gate.flow()))
        .subscribe(collector.clone());
    flush().await;

    source.next(1).unwrap();
    flush().await;
    source.next(2).unwrap();
    flush().await;
    gate.next(()).unwrap();
    flush().await;
    source.next(3).unwrap();
    source.next(4).unwrap();
    flush().await;

    source.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![3, 4]);
    assert!(collector.is_completed());
}

#[tokio::test]
async fn skip_until_never_opens_when_the_notifier_completes_silently() {
    let source = Subject::new();
    let gate: Subject<()> = Subject::new();
    let collector = Collector::new();
    let sub = source
        .pipe(skip_until(gate.flow()))
        .subscribe(collector.clone());
    flush().await;

    gate.complete().unwrap();
    flush().await;
    source.next(1).unwrap();
    source.next(2).unwrap();
    flush().await;
    source.complete().unwrap();
    sub.completed().await;

    assert!(collector.values().is_empty());
    assert!(collector.is_completed());
}
