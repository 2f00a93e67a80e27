//! Reducers described by their law: first and the distinct family.

use async_trait::async_trait;
use rill_core::{
    BoxSource, Emission, EventSource, OpCx, Operator, Pulled, StreamError, TryPulled,
};
use std::fmt;
use std::sync::Arc;

// --- first ---

/// Emit the first value, then complete. Fails with "No elements in sequence"
/// if the source completes without producing one.
pub fn first<T>() -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
{
    first_matching(|_: &T| true)
}

/// Emit the first value matching `pred`, then complete. Fails with
/// "No elements in sequence" if the source completes without a match.
pub fn first_matching<T, P>(pred: P) -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    FirstOp { pred: Arc::new(pred) }
}

struct FirstOp<P> {
    pred: Arc<P>,
}

impl<T, P> Operator<T, T> for FirstOp<P>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "first"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        Box::new(FirstSource {
            source,
            pred: self.pred.clone(),
            done: false,
            failed: false,
            cx,
        })
    }
}

struct FirstSource<T, P> {
    source: BoxSource<T>,
    pred: Arc<P>,
    done: bool,
    failed: bool,
    cx: OpCx,
}

#[async_trait]
impl<T, P> EventSource<T> for FirstSource<T, P>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<T> {
        if self.done {
            return Ok(None);
        }
        if self.failed {
            return Err(StreamError::NoElements);
        }
        loop {
            match self.source.pull().await? {
                Some(e) => {
                    let id = e.value_id();
                    self.cx.enter(id, &e.value);
                    if (self.pred)(&e.value) {
                        self.cx.exit_transformed(id, &e.value);
                        self.done = true;
                        self.source.close().await;
                        let Emission { value, stamp, meta } = e;
                        return Ok(Some(Emission {
                            value,
                            stamp,
                            meta: self.cx.transform_meta(meta),
                        }));
                    }
                    self.cx.exit_filtered(id);
                }
                None => {
                    self.failed = true;
                    return Err(StreamError::NoElements);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.done = true;
        self.source.close().await;
    }
}

// --- distinct family ---

/// Emit only values that differ from the previous emission.
pub fn distinct_until_changed<T>() -> impl Operator<T, T>
where
    T: Clone + PartialEq + Send + Sync + fmt::Debug + 'static,
{
    distinct_until_changed_by(|a: &T, b: &T| a == b)
}

/// Emit only values the comparator does not consider equal to the previous
/// emission. The comparator returns `true` when two values are the same.
pub fn distinct_until_changed_by<T, C>(same: C) -> impl Operator<T, T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    C: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    DistinctOp {
        same: Arc::new(same),
    }
}

/// Emit only values whose key differs from the previous emission's key.
pub fn distinct_until_key_changed<T, K, KF>(key: KF) -> impl Operator<T, T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    K: PartialEq,
    KF: Fn(&T) -> K + Send + Sync + 'static,
{
    distinct_until_changed_by(move |a: &T, b: &T| key(a) == key(b))
}

struct DistinctOp<C> {
    same: Arc<C>,
}

impl<T, C> Operator<T, T> for DistinctOp<C>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    C: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "distinct_until_changed"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        Box::new(DistinctSource {
            source,
            same: self.same.clone(),
            last: None,
            cx,
        })
    }
}

struct DistinctSource<T, C> {
    source: BoxSource<T>,
    same: Arc<C>,
    last: Option<T>,
    cx: OpCx,
}

impl<T, C> DistinctSource<T, C>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    C: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    fn check(&mut self, e: Emission<T>) -> Option<Emission<T>> {
        let id = e.value_id();
        self.cx.enter(id, &e.value);
        let suppressed = self
            .last
            .as_ref()
            .is_some_and(|prev| (self.same)(prev, &e.value));
        if suppressed {
            self.cx.exit_filtered(id);
            return None;
        }
        self.last = Some(e.value.clone());
        self.cx.exit_transformed(id, &e.value);
        let Emission { value, stamp, meta } = e;
        Some(Emission {
            value,
            stamp,
            meta: self.cx.transform_meta(meta),
        })
    }
}

#[async_trait]
impl<T, C> EventSource<T> for DistinctSource<T, C>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    C: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<T> {
        loop {
            match self.source.pull().await? {
                Some(e) => {
                    if let Some(out) = self.check(e) {
                        return Ok(Some(out));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        loop {
            match self.source.try_pull() {
                TryPulled::Ready(e) => {
                    if let Some(out) = self.check(e) {
                        return TryPulled::Ready(out);
                    }
                }
                other => return other,
            }
        }
    }

    async fn close(&mut self) {
        self.source.close().await;
    }
}
