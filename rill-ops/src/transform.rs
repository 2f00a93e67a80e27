//! One-source transforms: map, try_map, filter, scan, reduce.

use async_trait::async_trait;
use rill_core::{
    BoxSource, Emission, EventSource, OpCx, Operator, Pulled, StreamError, TryPulled, ValueId,
};
use std::fmt;
use std::sync::Arc;

// --- map ---

/// Transform each value with `f`.
pub fn map<In, Out, F>(f: F) -> impl Operator<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    MapOp { f: Arc::new(f) }
}

struct MapOp<F> {
    f: Arc<F>,
}

impl<In, Out, F> Operator<In, Out> for MapOp<F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "map"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Out> {
        Box::new(MapSource {
            source,
            f: self.f.clone(),
            cx,
        })
    }
}

struct MapSource<In, F> {
    source: BoxSource<In>,
    f: Arc<F>,
    cx: OpCx,
}

impl<In, Out, F> MapSource<In, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    fn transform(&self, e: Emission<In>) -> Emission<Out> {
        let id = e.value_id();
        self.cx.enter(id, &e.value);
        let Emission { value, stamp, meta } = e;
        let out = (self.f)(value);
        self.cx.exit_transformed(id, &out);
        Emission {
            value: out,
            stamp,
            meta: self.cx.transform_meta(meta),
        }
    }
}

#[async_trait]
impl<In, Out, F> EventSource<Out> for MapSource<In, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Out> {
        match self.source.pull().await? {
            Some(e) => Ok(Some(self.transform(e))),
            None => Ok(None),
        }
    }

    fn try_pull(&mut self) -> TryPulled<Out> {
        match self.source.try_pull() {
            TryPulled::Ready(e) => TryPulled::Ready(self.transform(e)),
            TryPulled::Done => TryPulled::Done,
            TryPulled::Failed(err) => TryPulled::Failed(err),
            TryPulled::Pending => TryPulled::Pending,
        }
    }

    async fn close(&mut self) {
        self.source.close().await;
    }
}

// --- try_map ---

/// Transform each value with a fallible `f`; a failure terminates the
/// pipeline with that error.
pub fn try_map<In, Out, F>(f: F) -> impl Operator<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Result<Out, StreamError> + Send + Sync + 'static,
{
    TryMapOp { f: Arc::new(f) }
}

struct TryMapOp<F> {
    f: Arc<F>,
}

impl<In, Out, F> Operator<In, Out> for TryMapOp<F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Result<Out, StreamError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "try_map"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Out> {
        Box::new(TryMapSource {
            source,
            f: self.f.clone(),
            failed: None,
            cx,
        })
    }
}

struct TryMapSource<In, F> {
    source: BoxSource<In>,
    f: Arc<F>,
    failed: Option<StreamError>,
    cx: OpCx,
}

#[async_trait]
impl<In, Out, F> EventSource<Out> for TryMapSource<In, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Result<Out, StreamError> + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Out> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        match self.source.pull().await? {
            Some(e) => {
                let id = e.value_id();
                self.cx.enter(id, &e.value);
                let Emission { value, stamp, meta } = e;
                match (self.f)(value) {
                    Ok(out) => {
                        self.cx.exit_transformed(id, &out);
                        Ok(Some(Emission {
                            value: out,
                            stamp,
                            meta: self.cx.transform_meta(meta),
                        }))
                    }
                    Err(err) => {
                        self.cx.exit_errored(id, &err);
                        self.source.close().await;
                        self.failed = Some(err.clone());
                        Err(err)
                    }
                }
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.source.close().await;
    }
}

// --- filter ---

/// Keep only values for which `pred` holds.
pub fn filter<T, P>(pred: P) -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    FilterOp { pred: Arc::new(pred) }
}

struct FilterOp<P> {
    pred: Arc<P>,
}

impl<T, P> Operator<T, T> for FilterOp<P>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "filter"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        Box::new(FilterSource {
            source,
            pred: self.pred.clone(),
            cx,
        })
    }
}

struct FilterSource<T, P> {
    source: BoxSource<T>,
    pred: Arc<P>,
    cx: OpCx,
}

impl<T, P> FilterSource<T, P>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    /// `Some` when the value passes, `None` when it was filtered out.
    fn check(&self, e: Emission<T>) -> Option<Emission<T>> {
        let id = e.value_id();
        self.cx.enter(id, &e.value);
        if (self.pred)(&e.value) {
            self.cx.exit_transformed(id, &e.value);
            let Emission { value, stamp, meta } = e;
            Some(Emission {
                value,
                stamp,
                meta: self.cx.transform_meta(meta),
            })
        } else {
            self.cx.exit_filtered(id);
            None
        }
    }
}

#[async_trait]
impl<T, P> EventSource<T> for FilterSource<T, P>
where
    T: Send + fmt::Debug + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
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

// --- scan ---

/// Fold the source, emitting every intermediate accumulator.
pub fn scan<In, Acc, F>(seed: Acc, f: F) -> impl Operator<In, Acc>
where
    In: Send + fmt::Debug + 'static,
    Acc: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(Acc, In) -> Acc + Send + Sync + 'static,
{
    ScanOp {
        seed,
        f: Arc::new(f),
    }
}

struct ScanOp<Acc, F> {
    seed: Acc,
    f: Arc<F>,
}

impl<In, Acc, F> Operator<In, Acc> for ScanOp<Acc, F>
where
    In: Send + fmt::Debug + 'static,
    Acc: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(Acc, In) -> Acc + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "scan"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Acc> {
        Box::new(ScanSource {
            source,
            acc: self.seed.clone(),
            f: self.f.clone(),
            cx,
        })
    }
}

struct ScanSource<In, Acc, F> {
    source: BoxSource<In>,
    acc: Acc,
    f: Arc<F>,
    cx: OpCx,
}

#[async_trait]
impl<In, Acc, F> EventSource<Acc> for ScanSource<In, Acc, F>
where
    In: Send + fmt::Debug + 'static,
    Acc: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(Acc, In) -> Acc + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Acc> {
        match self.source.pull().await? {
            Some(e) => {
                let id = e.value_id();
                self.cx.enter(id, &e.value);
                let Emission { value, stamp, meta } = e;
                self.acc = (self.f)(self.acc.clone(), value);
                self.cx.exit_transformed(id, &self.acc);
                Ok(Some(Emission {
                    value: self.acc.clone(),
                    stamp,
                    meta: self.cx.transform_meta(meta),
                }))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.source.close().await;
    }
}

// --- reduce ---

/// Fold the source into one final value, emitted at completion.
///
/// This is a fan-in: the first input carries the folded output's lineage,
/// every later input is recorded as collapsed into it.
pub fn reduce<In, Acc, F>(seed: Acc, f: F) -> impl Operator<In, Acc>
where
    In: Send + fmt::Debug + 'static,
    Acc: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(Acc, In) -> Acc + Send + Sync + 'static,
{
    ReduceOp {
        seed,
        f: Arc::new(f),
    }
}

struct ReduceOp<Acc, F> {
    seed: Acc,
    f: Arc<F>,
}

impl<In, Acc, F> Operator<In, Acc> for ReduceOp<Acc, F>
where
    In: Send + fmt::Debug + 'static,
    Acc: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(Acc, In) -> Acc + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "reduce"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Acc> {
        Box::new(ReduceSource {
            source,
            acc: Some(self.seed.clone()),
            f: self.f.clone(),
            inputs: Vec::new(),
            cx,
        })
    }
}

struct ReduceSource<In, Acc, F> {
    source: BoxSource<In>,
    /// `None` once the final value has been emitted.
    acc: Option<Acc>,
    f: Arc<F>,
    inputs: Vec<ValueId>,
    cx: OpCx,
}

#[async_trait]
impl<In, Acc, F> EventSource<Acc> for ReduceSource<In, Acc, F>
where
    In: Send + fmt::Debug + 'static,
    Acc: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(Acc, In) -> Acc + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Acc> {
        if self.acc.is_none() {
            return Ok(None);
        }
        loop {
            match self.source.pull().await {
                Ok(Some(e)) => {
                    let id = e.value_id();
                    self.cx.enter(id, &e.value);
                    if let Some(id) = id {
                        self.inputs.push(id);
                    }
                    // The accumulator stays in `self` between pulls so a
                    // dropped pull future cannot lose fold state.
                    if let Some(acc) = self.acc.take() {
                        self.acc = Some((self.f)(acc, e.value));
                    }
                }
                Ok(None) => {
                    let Some(acc) = self.acc.take() else {
                        return Ok(None);
                    };
                    let carrier = self.inputs.first().copied().unwrap_or_else(ValueId::next);
                    for victim in self.inputs.iter().skip(1) {
                        self.cx.collapse_victim(*victim, carrier);
                    }
                    self.cx.exit_collapsed(Some(carrier), &acc);
                    let meta = self.cx.collapse_meta(carrier, self.inputs.clone());
                    return Ok(Some(Emission {
                        value: acc,
                        stamp: rill_core::EmissionStamp::next(),
                        meta: Some(meta),
                    }));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn close(&mut self) {
        self.source.close().await;
    }
}
