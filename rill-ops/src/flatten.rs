//! Fan-out operators: projection into inner sources.
//!
//! A projection may return a full [`Flow`], a plain value, an array of
//! values, or a future — the [`Inner`] sum covers all four. Inner chains are
//! instantiated untraced; the flattening operator re-tags their emissions
//! against the outer value's lineage (first emission continues it, later
//! ones become expansion children).

use crate::util::{
    InnerState, OnceFutureSource, PumpEvent, QueueSource, finish_inner, retag_inner, spawn_pump,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rill_core::{
    BoxSource, Emission, EventSource, Flow, OpCx, Operator, PipeCx, Pulled, StreamError, TryPulled,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a projection may produce for one outer value.
pub enum Inner<U> {
    /// A full inner flow.
    Flow(Flow<U>),
    /// A single ready value.
    Value(U),
    /// Several ready values, emitted in order.
    Values(Vec<U>),
    /// A one-shot future resolving to a value.
    Future(BoxFuture<'static, U>),
}

impl<U> Inner<U> {
    /// A single ready value.
    pub fn value(value: U) -> Self {
        Inner::Value(value)
    }

    /// Several ready values.
    pub fn many(values: Vec<U>) -> Self {
        Inner::Values(values)
    }

    /// A one-shot future.
    pub fn future<F>(future: F) -> Self
    where
        F: std::future::Future<Output = U> + Send + 'static,
    {
        Inner::Future(Box::pin(future))
    }
}

impl<U> From<Flow<U>> for Inner<U> {
    fn from(flow: Flow<U>) -> Self {
        Inner::Flow(flow)
    }
}

impl<U> From<Vec<U>> for Inner<U> {
    fn from(values: Vec<U>) -> Self {
        Inner::Values(values)
    }
}

impl<U> fmt::Debug for Inner<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inner::Flow(_) => f.write_str("Inner::Flow"),
            Inner::Value(_) => f.write_str("Inner::Value"),
            Inner::Values(v) => write!(f, "Inner::Values({})", v.len()),
            Inner::Future(_) => f.write_str("Inner::Future"),
        }
    }
}

fn instantiate<U>(inner: Inner<U>, pipe: &PipeCx) -> BoxSource<U>
where
    U: Send + fmt::Debug + 'static,
{
    match inner {
        Inner::Flow(flow) => flow.events_in(&pipe.untraced()),
        Inner::Value(value) => Box::new(QueueSource::new([Emission::traced(value)])),
        Inner::Values(values) => {
            Box::new(QueueSource::new(values.into_iter().map(Emission::traced)))
        }
        Inner::Future(future) => Box::new(OnceFutureSource::new(future)),
    }
}

// --- switch_map ---

/// Project each outer value into an inner source, keeping only the newest:
/// starting a new inner closes the previous one, and late emissions from a
/// closed inner are discarded silently.
pub fn switch_map<In, Out, F>(project: F) -> impl Operator<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    SwitchMapOp {
        project: Arc::new(project),
    }
}

struct SwitchMapOp<F> {
    project: Arc<F>,
}

impl<In, Out, F> Operator<In, Out> for SwitchMapOp<F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "switch_map"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Out> {
        Box::new(SwitchMapSource {
            outer: source,
            project: self.project.clone(),
            inner: None,
            current: None,
            stale: Vec::new(),
            outer_done: false,
            cx,
        })
    }
}

enum RacedStep<In, Out> {
    Outer(Pulled<In>),
    Inner(Pulled<Out>),
}

struct SwitchMapSource<In, Out, F> {
    outer: BoxSource<In>,
    project: Arc<F>,
    inner: Option<BoxSource<Out>>,
    current: Option<InnerState>,
    /// Inners displaced by a newer outer value, closed on the next pull.
    stale: Vec<BoxSource<Out>>,
    outer_done: bool,
    cx: OpCx,
}

impl<In, Out, F> SwitchMapSource<In, Out, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    /// Start the inner for an outer value. Synchronous, so a dropped pull
    /// cannot lose the consumed outer value. Bursts of outer values already
    /// buffered upstream collapse to the newest one.
    fn start_inner(&mut self, first: Emission<In>) -> Result<(), StreamError> {
        let mut current = first;
        loop {
            match self.outer.try_pull() {
                TryPulled::Ready(next) => {
                    // Overwritten before its inner ever started.
                    let id = current.value_id();
                    self.cx.enter(id, &current.value);
                    self.cx.exit_filtered(id);
                    current = next;
                }
                TryPulled::Done => {
                    self.outer_done = true;
                    break;
                }
                TryPulled::Failed(err) => return Err(err),
                TryPulled::Pending => break,
            }
        }
        if let Some(old) = self.inner.take() {
            self.stale.push(old);
            if let Some(prev) = self.current.take() {
                finish_inner(&self.cx, prev);
            }
        }
        let id = current.value_id();
        self.cx.enter(id, &current.value);
        let inner = instantiate((self.project)(current.value), &self.cx.pipe);
        self.inner = Some(inner);
        self.current = Some(InnerState { base: id, emitted: false });
        Ok(())
    }
}

#[async_trait]
impl<In, Out, F> EventSource<Out> for SwitchMapSource<In, Out, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Out> {
        loop {
            while let Some(mut old) = self.stale.pop() {
                old.close().await;
            }
            let step = if let Some(inner) = self.inner.as_mut() {
                if self.outer_done {
                    RacedStep::Inner(inner.pull().await)
                } else {
                    tokio::select! {
                        o = self.outer.pull() => RacedStep::Outer(o),
                        i = inner.pull() => RacedStep::Inner(i),
                    }
                }
            } else if self.outer_done {
                return Ok(None);
            } else {
                RacedStep::Outer(self.outer.pull().await)
            };
            match step {
                RacedStep::Outer(Ok(Some(e))) => self.start_inner(e)?,
                RacedStep::Outer(Ok(None)) => {
                    self.outer_done = true;
                    if self.inner.is_none() {
                        return Ok(None);
                    }
                }
                RacedStep::Outer(Err(err)) => {
                    if let Some(mut inner) = self.inner.take() {
                        inner.close().await;
                    }
                    return Err(err);
                }
                RacedStep::Inner(Ok(Some(e))) => {
                    if let Some(state) = self.current.as_mut() {
                        return Ok(Some(retag_inner(&self.cx, state, e)));
                    }
                    return Ok(Some(e));
                }
                RacedStep::Inner(Ok(None)) => {
                    self.inner = None;
                    if let Some(state) = self.current.take() {
                        finish_inner(&self.cx, state);
                    }
                    if self.outer_done {
                        return Ok(None);
                    }
                }
                RacedStep::Inner(Err(err)) => {
                    self.outer.close().await;
                    return Err(err);
                }
            }
        }
    }

    async fn close(&mut self) {
        while let Some(mut old) = self.stale.pop() {
            old.close().await;
        }
        if let Some(mut inner) = self.inner.take() {
            inner.close().await;
        }
        self.outer.close().await;
    }
}

// --- merge_map ---

/// Project each outer value into an inner source, running all inners
/// concurrently; downstream sees emissions in arrival order.
pub fn merge_map<In, Out, F>(project: F) -> impl Operator<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    MergeMapOp {
        project: Arc::new(project),
    }
}

struct MergeMapOp<F> {
    project: Arc<F>,
}

impl<In, Out, F> Operator<In, Out> for MergeMapOp<F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "merge_map"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Out> {
        let (tx, rx) = mpsc::unbounded_channel();
        Box::new(MergeMapSource {
            outer: source,
            project: self.project.clone(),
            tx,
            rx,
            slots: HashMap::new(),
            next_slot: 0,
            active: 0,
            outer_done: false,
            cancel: CancellationToken::new(),
            cx,
        })
    }
}

struct MergeMapSource<In, Out, F> {
    outer: BoxSource<In>,
    project: Arc<F>,
    tx: mpsc::UnboundedSender<PumpEvent<Out>>,
    rx: mpsc::UnboundedReceiver<PumpEvent<Out>>,
    slots: HashMap<u64, InnerState>,
    next_slot: u64,
    active: usize,
    outer_done: bool,
    cancel: CancellationToken,
    cx: OpCx,
}

#[async_trait]
impl<In, Out, F> EventSource<Out> for MergeMapSource<In, Out, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Out> {
        enum MergeStep<In, Out> {
            Outer(Pulled<In>),
            Event(Option<PumpEvent<Out>>),
        }
        loop {
            if self.outer_done && self.active == 0 {
                return Ok(None);
            }
            let step = if self.outer_done {
                MergeStep::Event(self.rx.recv().await)
            } else {
                tokio::select! {
                    o = self.outer.pull() => MergeStep::Outer(o),
                    ev = self.rx.recv() => MergeStep::Event(ev),
                }
            };
            match step {
                MergeStep::Outer(Ok(Some(e))) => {
                    let id = e.value_id();
                    self.cx.enter(id, &e.value);
                    let slot = self.next_slot;
                    self.next_slot += 1;
                    self.slots.insert(slot, InnerState { base: id, emitted: false });
                    self.active += 1;
                    let inner = instantiate((self.project)(e.value), &self.cx.pipe);
                    spawn_pump(slot, inner, self.tx.clone(), self.cancel.child_token());
                }
                MergeStep::Outer(Ok(None)) => self.outer_done = true,
                MergeStep::Outer(Err(err)) => {
                    self.cancel.cancel();
                    return Err(err);
                }
                MergeStep::Event(Some(PumpEvent::Value(slot, e, _))) => {
                    if let Some(state) = self.slots.get_mut(&slot) {
                        return Ok(Some(retag_inner(&self.cx, state, e)));
                    }
                    return Ok(Some(e));
                }
                MergeStep::Event(Some(PumpEvent::Done(slot))) => {
                    self.active = self.active.saturating_sub(1);
                    if let Some(state) = self.slots.remove(&slot) {
                        finish_inner(&self.cx, state);
                    }
                }
                MergeStep::Event(Some(PumpEvent::Failed(err))) => {
                    self.cancel.cancel();
                    self.outer.close().await;
                    return Err(err);
                }
                MergeStep::Event(None) => {
                    // Unreachable while we hold a sender; treat as drained.
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.outer.close().await;
    }
}

impl<In, Out, F> Drop for MergeMapSource<In, Out, F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// --- concat_map ---

/// Project each outer value into an inner source, running inners strictly
/// one after another in outer order.
pub fn concat_map<In, Out, F>(project: F) -> impl Operator<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    ConcatMapOp {
        project: Arc::new(project),
    }
}

struct ConcatMapOp<F> {
    project: Arc<F>,
}

impl<In, Out, F> Operator<In, Out> for ConcatMapOp<F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "concat_map"
    }

    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Out> {
        Box::new(ConcatMapSource {
            outer: source,
            project: self.project.clone(),
            queue: VecDeque::new(),
            inner: None,
            current: None,
            outer_done: false,
            cx,
        })
    }
}

struct ConcatMapSource<In, Out, F> {
    outer: BoxSource<In>,
    project: Arc<F>,
    queue: VecDeque<Emission<In>>,
    inner: Option<BoxSource<Out>>,
    current: Option<InnerState>,
    outer_done: bool,
    cx: OpCx,
}

impl<In, Out, F> ConcatMapSource<In, Out, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    fn activate_next(&mut self) {
        if self.inner.is_some() {
            return;
        }
        if let Some(e) = self.queue.pop_front() {
            let id = e.value_id();
            self.cx.enter(id, &e.value);
            self.inner = Some(instantiate((self.project)(e.value), &self.cx.pipe));
            self.current = Some(InnerState { base: id, emitted: false });
        }
    }
}

#[async_trait]
impl<In, Out, F> EventSource<Out> for ConcatMapSource<In, Out, F>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
    F: Fn(In) -> Inner<Out> + Send + Sync + 'static,
{
    async fn pull(&mut self) -> Pulled<Out> {
        loop {
            self.activate_next();
            let step = if let Some(inner) = self.inner.as_mut() {
                if self.outer_done {
                    RacedStep::Inner(inner.pull().await)
                } else {
                    tokio::select! {
                        o = self.outer.pull() => RacedStep::Outer(o),
                        i = inner.pull() => RacedStep::Inner(i),
                    }
                }
            } else if self.outer_done {
                return Ok(None);
            } else {
                RacedStep::Outer(self.outer.pull().await)
            };
            match step {
                RacedStep::Outer(Ok(Some(e))) => self.queue.push_back(e),
                RacedStep::Outer(Ok(None)) => self.outer_done = true,
                RacedStep::Outer(Err(err)) => {
                    if let Some(mut inner) = self.inner.take() {
                        inner.close().await;
                    }
                    return Err(err);
                }
                RacedStep::Inner(Ok(Some(e))) => {
                    if let Some(state) = self.current.as_mut() {
                        return Ok(Some(retag_inner(&self.cx, state, e)));
                    }
                    return Ok(Some(e));
                }
                RacedStep::Inner(Ok(None)) => {
                    self.inner = None;
                    if let Some(state) = self.current.take() {
                        finish_inner(&self.cx, state);
                    }
                }
                RacedStep::Inner(Err(err)) => {
                    self.outer.close().await;
                    return Err(err);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close().await;
        }
        self.queue.clear();
        self.outer.close().await;
    }
}
