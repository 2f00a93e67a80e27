//! Flows, operators, pipe composition, and subscriptions.
//!
//! A [`Flow`] is a named, restartable producer: it holds a factory that
//! re-instantiates the whole operator chain for every iteration, so each
//! subscription observes the source from the beginning (subjects make the
//! chain hot by attaching a fresh buffer reader instead).
//!
//! [`Flow::pipe`] composes operators left to right. Subscribing spawns a
//! driver task that pulls the chain in a loop and feeds an [`Observer`];
//! [`Subscription::unsubscribe`] cancels the driver and closes the chain.

use crate::error::StreamError;
use crate::id::{StreamId, SubscriptionId, ValueId};
use crate::meta::{Emission, ValueMeta};
use crate::source::{
    BoxSource, EmptySource, EventSource, FailSource, FutureSource, IterSource, NeverSource, Pulled,
    TryPulled,
};
use crate::sync::Notifier;
use crate::trace_hook::{self, StepOutcome, TraceHook};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// --- Pipeline context ---

/// Per-subscription context threaded through a chain as it is instantiated.
#[derive(Clone)]
pub struct PipeCx {
    /// The flow definition being iterated.
    pub stream: StreamId,
    /// Its display name.
    pub stream_name: Arc<str>,
    /// The subscription run this instantiation belongs to.
    pub subscription: SubscriptionId,
    /// The tracer observing this run, if any.
    pub trace: Option<Arc<dyn TraceHook>>,
}

impl PipeCx {
    /// A fresh context for a new iteration, picking up the global tracer.
    pub fn fresh(stream: StreamId, stream_name: Arc<str>) -> Self {
        Self {
            stream,
            stream_name,
            subscription: SubscriptionId::next(),
            trace: trace_hook::current_tracer(),
        }
    }

    /// This context with tracing stripped — used for inner chains whose
    /// emissions are re-tagged by the flattening operator.
    pub fn untraced(&self) -> Self {
        Self {
            trace: None,
            ..self.clone()
        }
    }
}

impl fmt::Debug for PipeCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeCx")
            .field("stream", &self.stream)
            .field("stream_name", &self.stream_name)
            .field("subscription", &self.subscription)
            .field("traced", &self.trace.is_some())
            .finish()
    }
}

/// Per-operator context handed to [`Operator::apply`].
///
/// The reporting helpers are no-ops when no tracer is installed, so
/// combinators call them unconditionally.
#[derive(Clone)]
pub struct OpCx {
    /// The pipeline context of this instantiation.
    pub pipe: PipeCx,
    /// Position of this operator in the chain, zero-based.
    pub operator_index: usize,
    /// The operator's name.
    pub operator_name: Arc<str>,
}

impl fmt::Debug for OpCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpCx")
            .field("operator_index", &self.operator_index)
            .field("operator_name", &self.operator_name)
            .finish_non_exhaustive()
    }
}

impl OpCx {
    /// The operator's name.
    pub fn name(&self) -> &str {
        &self.operator_name
    }

    /// A value entered this operator.
    pub fn enter(&self, value: Option<ValueId>, input: &dyn fmt::Debug) {
        if let (Some(t), Some(id)) = (self.pipe.trace.as_ref(), value) {
            t.enter_operator(
                id,
                self.operator_index,
                &self.operator_name,
                format!("{input:?}"),
            );
        }
    }

    /// A value left this operator transformed into `output`.
    pub fn exit_transformed(&self, value: Option<ValueId>, output: &dyn fmt::Debug) {
        self.exit(value, StepOutcome::Transformed, Some(output), None);
    }

    /// This operator dropped the value.
    pub fn exit_filtered(&self, value: Option<ValueId>) {
        self.exit(value, StepOutcome::Filtered, None, None);
    }

    /// This operator failed on the value.
    pub fn exit_errored(&self, value: Option<ValueId>, error: &StreamError) {
        if let (Some(t), Some(id)) = (self.pipe.trace.as_ref(), value) {
            t.exit_operator(
                id,
                self.operator_index,
                &self.operator_name,
                StepOutcome::Errored,
                None,
                Some(error.to_string()),
            );
        }
    }

    /// This operator fanned the value out; its trace stays active.
    pub fn exit_expanded(&self, value: Option<ValueId>, output: &dyn fmt::Debug) {
        self.exit(value, StepOutcome::Expanded, Some(output), None);
    }

    /// This value is the carrier of a fan-in output.
    pub fn exit_collapsed(&self, value: Option<ValueId>, output: &dyn fmt::Debug) {
        self.exit(value, StepOutcome::Collapsed, Some(output), None);
    }

    fn exit(
        &self,
        value: Option<ValueId>,
        outcome: StepOutcome,
        output: Option<&dyn fmt::Debug>,
        error: Option<String>,
    ) {
        if let (Some(t), Some(id)) = (self.pipe.trace.as_ref(), value) {
            t.exit_operator(
                id,
                self.operator_index,
                &self.operator_name,
                outcome,
                output.map(|o| format!("{o:?}")),
                error,
            );
        }
    }

    /// Register a fan-out child derived from `parent`.
    pub fn child(&self, child: ValueId, parent: ValueId, value: &dyn fmt::Debug) {
        if let Some(t) = self.pipe.trace.as_ref() {
            t.create_expanded_trace(
                child,
                parent,
                self.operator_index,
                &self.operator_name,
                format!("{value:?}"),
            );
        }
    }

    /// Register `victim` as folded into `target`'s output.
    pub fn collapse_victim(&self, victim: ValueId, target: ValueId) {
        if let Some(t) = self.pipe.trace.as_ref() {
            t.collapse_value(victim, target, self.operator_index, &self.operator_name);
        }
    }

    /// Rewrite lineage for a one-to-one transform, keeping the value id.
    pub fn transform_meta(&self, meta: Option<ValueMeta>) -> Option<ValueMeta> {
        meta.map(|m| ValueMeta::transformed(m.value_id, self.operator_index, &self.operator_name))
    }

    /// Lineage for a fan-in output carried by `carrier`.
    pub fn collapse_meta(&self, carrier: ValueId, inputs: Vec<ValueId>) -> ValueMeta {
        ValueMeta::collapsed(carrier, self.operator_index, &self.operator_name, inputs)
    }

    /// Lineage for a fan-out child of `base`.
    pub fn expand_meta(&self, child: ValueId, base: ValueId) -> ValueMeta {
        ValueMeta::expanded(child, self.operator_index, &self.operator_name, base)
    }
}

// --- Operators ---

/// A transform from one pipeline stage to the next.
///
/// Operators are instantiated once per subscription: `apply` receives the
/// freshly built upstream stage and returns the stage downstream pulls from.
/// Any per-run state lives in the returned source, so one operator value can
/// serve many concurrent subscriptions.
pub trait Operator<In, Out>: Send + Sync + 'static
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// The operator's display name, used in lineage and traces.
    fn name(&self) -> &str;

    /// Wrap the upstream stage.
    fn apply(&self, source: BoxSource<In>, cx: OpCx) -> BoxSource<Out>;
}

// --- Observers ---

/// Receives the values of one subscription.
///
/// At most one of `on_error` / `on_complete` is called, exactly once, after
/// which no further callbacks fire.
pub trait Observer<T>: Send {
    /// A value reached the subscriber.
    fn on_next(&mut self, value: T);

    /// The pipeline failed.
    fn on_error(&mut self, error: StreamError) {
        let _ = error;
    }

    /// The pipeline completed.
    fn on_complete(&mut self) {}
}

impl<T, F> Observer<T> for F
where
    F: FnMut(T) + Send,
{
    fn on_next(&mut self, value: T) {
        self(value);
    }
}

// --- Flow ---

type Factory<T> = Arc<dyn Fn(&PipeCx) -> BoxSource<T> + Send + Sync>;

/// A named, restartable producer of emissions.
pub struct Flow<T> {
    id: StreamId,
    name: Arc<str>,
    op_count: usize,
    factory: Factory<T>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            op_count: self.op_count,
            factory: self.factory.clone(),
        }
    }
}

impl<T> fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("operators", &self.op_count)
            .finish()
    }
}

impl<T: Send + fmt::Debug + 'static> Flow<T> {
    /// A flow built from a source factory. The factory runs once per
    /// iteration, making the flow cold and restartable.
    pub fn new(
        name: impl Into<Arc<str>>,
        make: impl Fn() -> BoxSource<T> + Send + Sync + 'static,
    ) -> Self {
        Self::with_cx_factory(name.into(), move |_cx| make())
    }

    pub(crate) fn with_cx_factory(
        name: Arc<str>,
        make: impl Fn(&PipeCx) -> BoxSource<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: StreamId::next(),
            name,
            op_count: 0,
            factory: Arc::new(move |cx: &PipeCx| {
                Box::new(Instrumented {
                    inner: make(cx),
                    cx: cx.clone(),
                }) as BoxSource<T>
            }),
        }
    }

    /// A finite flow over a cloneable iterator.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::new("from_iter", move || {
            Box::new(IterSource::new(iter.clone().into_iter())) as BoxSource<T>
        })
    }

    /// A single-value flow.
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter(std::iter::once(value))
    }

    /// A flow that completes immediately.
    pub fn empty() -> Self {
        Self::new("empty", || Box::new(EmptySource) as BoxSource<T>)
    }

    /// A flow that never produces and never completes.
    pub fn never() -> Self {
        Self::new("never", || Box::new(NeverSource::new()) as BoxSource<T>)
    }

    /// A flow that fails on the first pull.
    pub fn fail(error: StreamError) -> Self {
        Self::new("fail", move || {
            Box::new(FailSource::new(error.clone())) as BoxSource<T>
        })
    }

    /// A one-shot flow resolving a future built per iteration.
    pub fn from_future_fn<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::new("from_future", move || {
            Box::new(FutureSource::new(Box::pin(make()))) as BoxSource<T>
        })
    }

    /// Append one operator to the chain.
    ///
    /// Zero appended operators leave the flow observationally identical to
    /// the source. Each subscription re-instantiates the whole chain.
    pub fn pipe<U, O>(&self, op: O) -> Flow<U>
    where
        U: Send + fmt::Debug + 'static,
        O: Operator<T, U>,
    {
        let upstream = self.factory.clone();
        let index = self.op_count;
        let name: Arc<str> = op.name().into();
        let op = Arc::new(op);
        Flow {
            id: self.id,
            name: self.name.clone(),
            op_count: index + 1,
            factory: Arc::new(move |cx: &PipeCx| {
                let source = (upstream)(cx);
                let opcx = OpCx {
                    pipe: cx.clone(),
                    operator_index: index,
                    operator_name: name.clone(),
                };
                op.apply(source, opcx)
            }),
        }
    }

    /// A cold iteration of this flow under a fresh context.
    pub fn events(&self) -> BoxSource<T> {
        self.events_in(&PipeCx::fresh(self.id, self.name.clone()))
    }

    /// Instantiate this flow's chain under an existing pipeline context.
    /// Used by flattening operators to run inner flows inside the same
    /// subscription.
    pub fn events_in(&self, cx: &PipeCx) -> BoxSource<T> {
        (self.factory)(cx)
    }

    /// Start a new iteration feeding `observer`; returns the handle that
    /// stops it.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        let cx = PipeCx::fresh(self.id, self.name.clone());
        let source = (self.factory)(&cx);
        let token = CancellationToken::new();
        let id = cx.subscription;
        tracing::debug!(
            stream = %self.name,
            subscription = id.get(),
            "subscription started"
        );
        let handle = tokio::spawn(drive(source, observer, cx.trace.clone(), id, token.clone()));
        Subscription { id, token, handle }
    }

    /// The flow's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The flow's id.
    pub fn id(&self) -> StreamId {
        self.id
    }
}

async fn drive<T, O>(
    mut source: BoxSource<T>,
    mut observer: O,
    trace: Option<Arc<dyn TraceHook>>,
    subscription: SubscriptionId,
    token: CancellationToken,
) where
    T: Send + 'static,
    O: Observer<T>,
{
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                source.close().await;
                break;
            }
            pulled = source.pull() => match pulled {
                Ok(Some(emission)) => {
                    if let (Some(t), Some(id)) = (trace.as_ref(), emission.value_id()) {
                        t.mark_delivered(id, subscription);
                    }
                    observer.on_next(emission.value);
                }
                Ok(None) => {
                    observer.on_complete();
                    break;
                }
                Err(error) => {
                    observer.on_error(error);
                    break;
                }
            }
        }
    }
    if let Some(t) = trace.as_ref() {
        t.complete_subscription(subscription);
    }
    tracing::debug!(subscription = subscription.get(), "subscription finished");
}

/// Handle to one running iteration.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// The subscription's id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop the iteration and close the chain upstream. Idempotent.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    /// Whether the driver is still running.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Wait for the driver to finish (after completion, error, or
    /// unsubscribe).
    pub async fn completed(self) {
        let _ = self.handle.await;
    }
}

// --- Root instrumentation ---

/// Wraps the root source of a chain to open a trace per produced value.
struct Instrumented<T> {
    inner: BoxSource<T>,
    cx: PipeCx,
}

impl<T: Send + fmt::Debug + 'static> Instrumented<T> {
    fn observe(&self, emission: &Emission<T>) {
        if let (Some(t), Some(meta)) = (self.cx.trace.as_ref(), emission.meta.as_ref()) {
            t.start_trace(
                meta.value_id,
                self.cx.stream,
                &self.cx.stream_name,
                self.cx.subscription,
                format!("{:?}", emission.value),
            );
        }
    }
}

#[async_trait]
impl<T: Send + fmt::Debug + 'static> EventSource<T> for Instrumented<T> {
    async fn pull(&mut self) -> Pulled<T> {
        let pulled = self.inner.pull().await;
        if let Ok(Some(e)) = &pulled {
            self.observe(e);
        }
        pulled
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        let pulled = self.inner.try_pull();
        if let TryPulled::Ready(e) = &pulled {
            self.observe(e);
        }
        pulled
    }

    fn push_signal(&self) -> Option<Arc<Notifier>> {
        self.inner.push_signal()
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}
