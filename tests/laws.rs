//! Algebraic laws of the combinators, checked over generated inputs.

use proptest::prelude::*;
use rill::prelude::*;
use rill_core::test_utils::Collector;
use std::future::Future;

fn run<T>(f: impl Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
        .block_on(f)
}

fn collect(flow: Flow<i32>) -> (Vec<i32>, bool) {
    run(async move {
        let collector = Collector::new();
        flow.subscribe(collector.clone()).completed().await;
        (collector.values(), collector.is_completed())
    })
}

fn subject_round_trip(values: Vec<i32>) -> (Vec<i32>, bool) {
    run(async move {
        let subject = Subject::new();
        let collector = Collector::new();
        let sub = subject.subscribe(collector.clone());
        flush().await;
        for v in values {
            subject.next(v).expect("subject accepts writes before complete");
        }
        subject.complete().expect("complete once");
        sub.completed().await;
        (collector.values(), collector.is_completed())
    })
}

proptest! {
    /// `s.pipe()` with no operators is observationally `s`.
    #[test]
    fn pipe_identity_preserves_the_sequence(
        values in proptest::collection::vec(-100..100i32, 0..32),
    ) {
        let (seen, completed) = collect(Flow::from_iter(values.clone()));
        prop_assert_eq!(seen, values);
        prop_assert!(completed);
    }

    /// `map(f)` then `map(g)` is observationally `map(g ∘ f)`.
    #[test]
    fn map_composition_fuses(
        values in proptest::collection::vec(-100..100i32, 0..32),
    ) {
        let (chained, _) = collect(
            Flow::from_iter(values.clone())
                .pipe(map(|x: i32| x.wrapping_mul(3)))
                .pipe(map(|x: i32| x.wrapping_sub(7))),
        );
        let (fused, _) = collect(
            Flow::from_iter(values).pipe(map(|x: i32| x.wrapping_mul(3).wrapping_sub(7))),
        );
        prop_assert_eq!(chained, fused);
    }

    /// Applying `distinct_until_changed` twice changes nothing.
    #[test]
    fn distinct_until_changed_is_idempotent(
        values in proptest::collection::vec(0..4i32, 0..48),
    ) {
        let (once, _) = collect(Flow::from_iter(values.clone()).pipe(distinct_until_changed()));
        let (twice, _) = collect(
            Flow::from_iter(values)
                .pipe(distinct_until_changed())
                .pipe(distinct_until_changed()),
        );
        prop_assert_eq!(once, twice);
    }

    /// On an infinite source, chaining `first(p)` into `first(q)` matches
    /// `first(p ∧ q)` whenever p subsumes q (the first p-match satisfies q).
    #[test]
    fn first_then_first_matches_first_of_conjunction(
        (low, high) in (0..500i32, 0..500i32).prop_map(|(a, b)| (a.min(b), a.max(b))),
    ) {
        let (chained, _) = collect(
            Flow::from_iter(0..)
                .pipe(first_matching(move |x: &i32| *x > high))
                .pipe(first_matching(move |x: &i32| *x > low)),
        );
        let (conjoined, _) = collect(
            Flow::from_iter(0..)
                .pipe(first_matching(move |x: &i32| *x > high && *x > low)),
        );
        prop_assert_eq!(chained, conjoined);
    }

    /// Writing v1..vn then complete through a subject delivers v1..vn in
    /// order, then completion.
    #[test]
    fn subject_round_trip_preserves_order(
        values in proptest::collection::vec(-100..100i32, 0..48),
    ) {
        let (seen, completed) = subject_round_trip(values.clone());
        prop_assert_eq!(seen, values);
        prop_assert!(completed);
    }
}
