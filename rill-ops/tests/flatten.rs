//! Behaviour tests for the fan-out operators.

use rill_core::test_utils::Collector;
use rill_core::{Flow, Subject, flush};
use rill_ops::{Inner, concat_map, merge_map, switch_map};

#[tokio::test]
async fn switch_map_keeps_only_the_newest_inner_on_bursts() {
    // All three outer values are buffered before the operator runs, so the
    // inners of 1 and 2 are overwritten before ever emitting.
    let collector = Collector::new();
    Flow::from_iter(vec![1, 2, 3])
        .pipe(switch_map(|x: i32| Inner::many(vec![x * 10, x * 100])))
        .subscribe(collector.clone())
        .completed()
        .await;
    assert_eq!(collector.values(), vec![30, 300]);
}

#[tokio::test]
async fn switch_map_cancels_a_running_inner_on_a_new_outer_value() {
    let outer = Subject::new();
    let collector = Collector::new();
    let sub = outer
        .pipe(switch_map(|x: i32| {
            if x == 1 {
                // An inner that never completes; it must be closed when 2
                // arrives, and its silence must not block the pipeline.
                Inner::from(Flow::<i32>::never())
            } else {
                Inner::value(x * 10)
            }
        }))
        .subscribe(collector.clone());
    flush().await;

    outer.next(1).unwrap();
    flush().await;
    outer.next(2).unwrap();
    flush().await;
    outer.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![20]);
    assert!(collector.is_completed());
}

#[tokio::test]
async fn switch_map_drains_the_last_inner_after_outer_completion() {
    let collector = Collector::new();
    Flow::from_iter(vec![3])
        .pipe(switch_map(|x: i32| Inner::many(vec![x, x + 1, x + 2])))
        .subscribe(collector.clone())
        .completed()
        .await;
    assert_eq!(collector.values(), vec![3, 4, 5]);
}

#[tokio::test]
async fn switch_map_accepts_future_inners() {
    let collector = Collector::new();
    Flow::from_iter(vec![7])
        .pipe(switch_map(|x: i32| {
            Inner::future(async move {
                tokio::task::yield_now().await;
                x * 2
            })
        }))
        .subscribe(collector.clone())
        .completed()
        .await;
    assert_eq!(collector.values(), vec![14]);
}

#[tokio::test]
async fn merge_map_interleaves_inners_in_arrival_order() {
    let outer = Subject::new();
    let collector = Collector::new();
    let sub = outer
        .pipe(merge_map(|x: i32| Inner::many(vec![x, x + 100])))
        .subscribe(collector.clone());
    flush().await;

    outer.next(1).unwrap();
    flush().await;
    outer.next(2).unwrap();
    flush().await;
    outer.complete().unwrap();
    sub.completed().await;

    assert_eq!(collector.values(), vec![1, 101, 2, 102]);
}

#[tokio::test]
async fn merge_map_keeps_every_inner_active() {
    // Both inners outlive the outer; all their values must arrive.
    let collector = Collector::new();
    Flow::from_iter(vec![10, 20])
        .pipe(merge_map(|x: i32| {
            Inner::future(async move {
                tokio::task::yield_now().await;
                x + 1
            })
        }))
        .subscribe(collector.clone())
        .completed()
        .await;
    let mut values = collector.values();
    values.sort_unstable();
    assert_eq!(values, vec![11, 21]);
}

#[tokio::test]
async fn concat_map_runs_inners_strictly_in_order() {
    let collector = Collector::new();
    Flow::from_iter(vec![1, 2, 3])
        .pipe(concat_map(|x: i32| Inner::many(vec![x, x * 10])))
        .subscribe(collector.clone())
        .completed()
        .await;
    assert_eq!(collector.values(), vec![1, 10, 2, 20, 3, 30]);
}

#[tokio::test]
async fn empty_outer_flattens_to_an_empty_completion() {
    let collector = Collector::new();
    Flow::<i32>::empty()
        .pipe(merge_map(|x: i32| Inner::value(x)))
        .subscribe(collector.clone())
        .completed()
        .await;
    assert!(collector.values().is_empty());
    assert!(collector.is_completed());
}
