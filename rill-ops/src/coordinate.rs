//! Cross-stream coordination: buffer_until, with_latest_from, skip_until.
//!
//! These operators merge two (or more) sources. Arrival order of racing
//! pulls is non-deterministic across cooperative steps, so "which happened
//! first" is always decided by emission stamps, with the tie-break "source
//! before notifier of the same stamp".

use crate::util::{PumpEvent, QueueSource, spawn_pump};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rill_core::{
    BoxSource, Emission, EmissionStamp, EventSource, Flow, OpCx, Operator, PipeCx, Pulled,
    StreamError, TryPulled, ValueId,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// --- buffer_until ---

/// Accumulate source values; each notifier emission flushes the buffer
/// downstream as one collapsed array.
///
/// The flush boundary is chronological, not arrival-ordered: when the
/// notifier ticks with stamp `s`, every source value stamped `<= s` that is
/// already buffered upstream is drained into the batch first. The residual
/// buffer flushes once more when the source completes.
pub fn buffer_until<T, N>(notifier: Flow<N>) -> impl Operator<T, Vec<T>>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    BufferUntilOp { notifier }
}

struct BufferUntilOp<N> {
    notifier: Flow<N>,
}

impl<T, N> Operator<T, Vec<T>> for BufferUntilOp<N>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    fn name(&self) -> &str {
        "buffer_until"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<Vec<T>> {
        let notifier = self.notifier.events_in(&cx.pipe.untraced());
        Box::new(BufferUntilSource {
            source,
            notifier,
            buf: Vec::new(),
            carry: None,
            pending_tick: None,
            source_done: false,
            notifier_done: false,
            cx,
        })
    }
}

enum CoordStep<T, N> {
    Source(Pulled<T>),
    Notifier(Pulled<N>),
}

struct BufferUntilSource<T, N> {
    source: BoxSource<T>,
    notifier: BoxSource<N>,
    buf: Vec<Emission<T>>,
    /// A source value drained during catch-up that belongs to the next
    /// window (stamped after the tick).
    carry: Option<Emission<T>>,
    /// A notifier tick received but not yet flushed against.
    pending_tick: Option<EmissionStamp>,
    source_done: bool,
    notifier_done: bool,
    cx: OpCx,
}

impl<T, N> BufferUntilSource<T, N>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    fn buffer_value(&mut self, e: Emission<T>) {
        self.cx.enter(e.value_id(), &e.value);
        self.buf.push(e);
    }

    /// Flush buffered values into one collapsed array. With a cutoff, only
    /// values stamped at or before it flush; later ones stay for the next
    /// window.
    fn flush(&mut self, cutoff: Option<EmissionStamp>) -> Emission<Vec<T>> {
        let split = match cutoff {
            Some(cutoff) => self
                .buf
                .iter()
                .position(|e| e.stamp > cutoff)
                .unwrap_or(self.buf.len()),
            None => self.buf.len(),
        };
        let drained: Vec<Emission<T>> = self.buf.drain(..split).collect();
        let ids: Vec<ValueId> = drained.iter().filter_map(|e| e.value_id()).collect();
        let values: Vec<T> = drained.into_iter().map(|e| e.value).collect();
        let carrier = ids.first().copied().unwrap_or_else(ValueId::next);
        for victim in ids.iter().skip(1) {
            self.cx.collapse_victim(*victim, carrier);
        }
        if !ids.is_empty() {
            self.cx.exit_collapsed(Some(carrier), &values);
        }
        Emission {
            value: values,
            stamp: EmissionStamp::next(),
            meta: Some(self.cx.collapse_meta(carrier, ids)),
        }
    }

    /// Drain source values stamped at or before the tick into the batch.
    fn catch_up(&mut self, cutoff: EmissionStamp) -> Result<(), StreamError> {
        loop {
            match self.source.try_pull() {
                TryPulled::Ready(e) if e.stamp <= cutoff => self.buffer_value(e),
                TryPulled::Ready(e) => {
                    self.carry = Some(e);
                    return Ok(());
                }
                TryPulled::Done => {
                    self.source_done = true;
                    return Ok(());
                }
                TryPulled::Failed(err) => return Err(err),
                TryPulled::Pending => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl<T, N> EventSource<Vec<T>> for BufferUntilSource<T, N>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    async fn pull(&mut self) -> Pulled<Vec<T>> {
        loop {
            if let Some(e) = self.carry.take() {
                self.buffer_value(e);
            }
            if self.source_done {
                self.notifier.close().await;
                if !self.buf.is_empty() {
                    return Ok(Some(self.flush(None)));
                }
                return Ok(None);
            }
            // A tick already produced must flush before source values
            // stamped after it, so probe the notifier before draining.
            if !self.notifier_done && self.pending_tick.is_none() {
                match self.notifier.try_pull() {
                    TryPulled::Ready(tick) => self.pending_tick = Some(tick.stamp),
                    TryPulled::Done => self.notifier_done = true,
                    TryPulled::Failed(err) => {
                        self.source.close().await;
                        return Err(StreamError::Aux(err.to_string()));
                    }
                    TryPulled::Pending => {}
                }
            }
            if let Some(cutoff) = self.pending_tick.take() {
                self.catch_up(cutoff)?;
                return Ok(Some(self.flush(Some(cutoff))));
            }
            // No tick is available: any future tick will be stamped after
            // the values already buffered upstream, so they are this
            // window's.
            loop {
                match self.source.try_pull() {
                    TryPulled::Ready(e) => self.buffer_value(e),
                    TryPulled::Done => {
                        self.source_done = true;
                        break;
                    }
                    TryPulled::Failed(err) => return Err(err),
                    TryPulled::Pending => break,
                }
            }
            if self.source_done {
                continue;
            }
            let step = if self.notifier_done {
                CoordStep::Source(self.source.pull().await)
            } else {
                tokio::select! {
                    s = self.source.pull() => CoordStep::Source(s),
                    n = self.notifier.pull() => CoordStep::Notifier(n),
                }
            };
            match step {
                CoordStep::Source(Ok(Some(e))) => self.buffer_value(e),
                CoordStep::Source(Ok(None)) => self.source_done = true,
                CoordStep::Source(Err(err)) => {
                    self.notifier.close().await;
                    return Err(err);
                }
                CoordStep::Notifier(Ok(Some(tick))) => {
                    // Catch-up and flush happen at the top of the loop.
                    self.pending_tick = Some(tick.stamp);
                }
                CoordStep::Notifier(Ok(None)) => self.notifier_done = true,
                CoordStep::Notifier(Err(err)) => {
                    self.source.close().await;
                    return Err(StreamError::Aux(err.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        self.buf.clear();
        self.notifier.close().await;
        self.source.close().await;
    }
}

// --- with_latest_from ---

/// An auxiliary input: a flow, a ready value, or a one-shot future.
pub enum Aux<U> {
    /// A full auxiliary flow.
    Flow(Flow<U>),
    /// A single ready value — an auxiliary that has already produced.
    Value(U),
    /// A one-shot future, rebuilt per subscription.
    Future(Arc<dyn Fn() -> BoxFuture<'static, U> + Send + Sync>),
}

impl<U> Aux<U> {
    /// A ready value.
    pub fn value(value: U) -> Self {
        Aux::Value(value)
    }

    /// A one-shot future auxiliary.
    pub fn future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = U> + Send + 'static,
    {
        Aux::Future(Arc::new(move || Box::pin(make())))
    }
}

impl<U: Clone> Clone for Aux<U> {
    fn clone(&self) -> Self {
        match self {
            Aux::Flow(f) => Aux::Flow(f.clone()),
            Aux::Value(v) => Aux::Value(v.clone()),
            Aux::Future(make) => Aux::Future(make.clone()),
        }
    }
}

impl<U> From<Flow<U>> for Aux<U> {
    fn from(flow: Flow<U>) -> Self {
        Aux::Flow(flow)
    }
}

fn instantiate_aux<U>(aux: Aux<U>, pipe: &PipeCx) -> BoxSource<U>
where
    U: Send + fmt::Debug + 'static,
{
    match aux {
        Aux::Flow(flow) => flow.events_in(&pipe.untraced()),
        Aux::Value(value) => Box::new(QueueSource::new([Emission::traced(value)])),
        Aux::Future(make) => Box::new(crate::util::OnceFutureSource::new(make())),
    }
}

/// Pair each source value with the latest value of one auxiliary.
///
/// Emits nothing until the auxiliary has produced; "latest" means the last
/// auxiliary value stamped at or before the source value. Auxiliary errors
/// terminate the output, coerced into a stream error.
pub fn with_latest_from<T, U>(aux: impl Into<Aux<U>>) -> impl Operator<T, (T, U)>
where
    T: Send + fmt::Debug + 'static,
    U: Clone + Send + Sync + fmt::Debug + 'static,
{
    WithLatestOp {
        auxes: vec![aux.into()],
        combine: Arc::new(|value: T, mut latest: Vec<U>| {
            let aux = latest.pop().expect("with_latest_from pairs one auxiliary");
            (value, aux)
        }),
    }
}

/// Pair each source value with the latest value of every auxiliary.
pub fn with_latest_from_all<T, U>(auxes: Vec<Aux<U>>) -> impl Operator<T, (T, Vec<U>)>
where
    T: Send + fmt::Debug + 'static,
    U: Clone + Send + Sync + fmt::Debug + 'static,
{
    WithLatestOp {
        auxes,
        combine: Arc::new(|value: T, latest: Vec<U>| (value, latest)),
    }
}

struct WithLatestOp<T, U, Out> {
    auxes: Vec<Aux<U>>,
    combine: Arc<dyn Fn(T, Vec<U>) -> Out + Send + Sync>,
}

impl<T, U, Out> Operator<T, Out> for WithLatestOp<T, U, Out>
where
    T: Send + fmt::Debug + 'static,
    U: Clone + Send + Sync + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
{
    fn name(&self) -> &str {
        "with_latest_from"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<Out> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        for (idx, aux) in self.auxes.iter().cloned().enumerate() {
            let aux_source = instantiate_aux(aux, &cx.pipe);
            spawn_pump(idx as u64, aux_source, tx.clone(), cancel.child_token());
        }
        Box::new(WithLatestSource {
            source,
            rx,
            histories: self.auxes.iter().map(|_| AuxSlot::default()).collect(),
            combine: self.combine.clone(),
            aux_channel_closed: false,
            cancel,
            cx,
        })
    }
}

struct AuxSlot<U> {
    /// Auxiliary emissions not yet superseded relative to the last paired
    /// source stamp, oldest first.
    history: VecDeque<Emission<U>>,
    done: bool,
}

impl<U> Default for AuxSlot<U> {
    fn default() -> Self {
        Self {
            history: VecDeque::new(),
            done: false,
        }
    }
}

struct WithLatestSource<T, U, Out> {
    source: BoxSource<T>,
    rx: mpsc::UnboundedReceiver<PumpEvent<U>>,
    histories: Vec<AuxSlot<U>>,
    combine: Arc<dyn Fn(T, Vec<U>) -> Out + Send + Sync>,
    aux_channel_closed: bool,
    cancel: CancellationToken,
    cx: OpCx,
}

impl<T, U, Out> WithLatestSource<T, U, Out>
where
    T: Send + fmt::Debug + 'static,
    U: Clone + Send + Sync + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
{
    fn absorb(&mut self, event: PumpEvent<U>) -> Result<(), StreamError> {
        match event {
            PumpEvent::Value(idx, e, _) => {
                if let Some(slot) = self.histories.get_mut(idx as usize) {
                    slot.history.push_back(e);
                }
                Ok(())
            }
            PumpEvent::Done(idx) => {
                if let Some(slot) = self.histories.get_mut(idx as usize) {
                    slot.done = true;
                }
                Ok(())
            }
            PumpEvent::Failed(err) => {
                self.cancel.cancel();
                Err(StreamError::Aux(err.to_string()))
            }
        }
    }

    /// The latest value of every auxiliary as of `cutoff`, or `None` while
    /// some auxiliary has not produced a value stamped at or before it.
    fn latest_at(&mut self, cutoff: EmissionStamp) -> Option<Vec<U>> {
        let mut out = Vec::with_capacity(self.histories.len());
        for slot in self.histories.iter_mut() {
            let idx = slot.history.iter().rposition(|e| e.stamp <= cutoff)?;
            // Entries before the chosen one can never be "latest" again:
            // later source values only raise the cutoff.
            slot.history.drain(..idx);
            out.push(slot.history.front()?.value.clone());
        }
        Some(out)
    }
}

#[async_trait]
impl<T, U, Out> EventSource<Out> for WithLatestSource<T, U, Out>
where
    T: Send + fmt::Debug + 'static,
    U: Clone + Send + Sync + fmt::Debug + 'static,
    Out: Send + fmt::Debug + 'static,
{
    async fn pull(&mut self) -> Pulled<Out> {
        enum LatestStep<T, U> {
            Source(Pulled<T>),
            Event(Option<PumpEvent<U>>),
        }
        loop {
            let step = if self.aux_channel_closed {
                LatestStep::Source(self.source.pull().await)
            } else {
                tokio::select! {
                    s = self.source.pull() => LatestStep::Source(s),
                    ev = self.rx.recv() => LatestStep::Event(ev),
                }
            };
            match step {
                LatestStep::Source(Ok(Some(e))) => {
                    // Absorb auxiliary events already in flight before
                    // deciding what "latest" means for this value.
                    while let Ok(ev) = self.rx.try_recv() {
                        self.absorb(ev)?;
                    }
                    let id = e.value_id();
                    self.cx.enter(id, &e.value);
                    match self.latest_at(e.stamp) {
                        Some(latest) => {
                            let Emission { value, stamp, meta } = e;
                            let out = (self.combine)(value, latest);
                            self.cx.exit_transformed(id, &out);
                            return Ok(Some(Emission {
                                value: out,
                                stamp,
                                meta: self.cx.transform_meta(meta),
                            }));
                        }
                        None => self.cx.exit_filtered(id),
                    }
                }
                LatestStep::Source(Ok(None)) => {
                    self.cancel.cancel();
                    return Ok(None);
                }
                LatestStep::Source(Err(err)) => {
                    self.cancel.cancel();
                    return Err(err);
                }
                LatestStep::Event(Some(event)) => self.absorb(event)?,
                LatestStep::Event(None) => self.aux_channel_closed = true,
            }
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.source.close().await;
    }
}

impl<T, U, Out> Drop for WithLatestSource<T, U, Out> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// --- skip_until ---

/// Drop source values until the notifier emits once; pass through after.
///
/// The notifier subscription is torn down immediately on its first
/// emission, error, or completion.
pub fn skip_until<T, N>(notifier: Flow<N>) -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    SkipUntilOp { notifier }
}

struct SkipUntilOp<N> {
    notifier: Flow<N>,
}

impl<T, N> Operator<T, T> for SkipUntilOp<N>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    fn name(&self) -> &str {
        "skip_until"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        let notifier = self.notifier.events_in(&cx.pipe.untraced());
        Box::new(SkipUntilSource {
            source,
            notifier,
            open: false,
            notifier_torn_down: false,
            cx,
        })
    }
}

struct SkipUntilSource<T, N> {
    source: BoxSource<T>,
    notifier: BoxSource<N>,
    open: bool,
    notifier_torn_down: bool,
    cx: OpCx,
}

impl<T, N> SkipUntilSource<T, N>
where
    T: Send + 'static,
    N: Send + 'static,
{
    async fn teardown_notifier(&mut self) {
        if !self.notifier_torn_down {
            self.notifier_torn_down = true;
            self.notifier.close().await;
        }
    }
}

#[async_trait]
impl<T, N> EventSource<T> for SkipUntilSource<T, N>
where
    T: Send + fmt::Debug + 'static,
    N: Send + fmt::Debug + 'static,
{
    async fn pull(&mut self) -> Pulled<T> {
        loop {
            if self.open {
                return match self.source.pull().await? {
                    Some(e) => {
                        let id = e.value_id();
                        self.cx.enter(id, &e.value);
                        self.cx.exit_transformed(id, &e.value);
                        let Emission { value, stamp, meta } = e;
                        Ok(Some(Emission {
                            value,
                            stamp,
                            meta: self.cx.transform_meta(meta),
                        }))
                    }
                    None => Ok(None),
                };
            }
            let step = if self.notifier_torn_down {
                // The notifier completed without emitting: the gate never
                // opens and every source value is dropped.
                CoordStep::Source(self.source.pull().await)
            } else {
                tokio::select! {
                    s = self.source.pull() => CoordStep::Source(s),
                    n = self.notifier.pull() => CoordStep::Notifier(n),
                }
            };
            match step {
                CoordStep::Source(Ok(Some(e))) => {
                    let id = e.value_id();
                    self.cx.enter(id, &e.value);
                    self.cx.exit_filtered(id);
                }
                CoordStep::Source(Ok(None)) => {
                    self.teardown_notifier().await;
                    return Ok(None);
                }
                CoordStep::Source(Err(err)) => {
                    self.teardown_notifier().await;
                    return Err(err);
                }
                CoordStep::Notifier(Ok(Some(_))) => {
                    self.open = true;
                    self.teardown_notifier().await;
                }
                CoordStep::Notifier(Ok(None)) => {
                    self.teardown_notifier().await;
                }
                CoordStep::Notifier(Err(err)) => {
                    self.teardown_notifier().await;
                    self.source.close().await;
                    return Err(StreamError::Aux(err.to_string()));
                }
            }
        }
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        if !self.open {
            return TryPulled::Pending;
        }
        match self.source.try_pull() {
            TryPulled::Ready(e) => {
                let id = e.value_id();
                self.cx.enter(id, &e.value);
                self.cx.exit_transformed(id, &e.value);
                let Emission { value, stamp, meta } = e;
                TryPulled::Ready(Emission {
                    value,
                    stamp,
                    meta: self.cx.transform_meta(meta),
                })
            }
            other => other,
        }
    }

    async fn close(&mut self) {
        self.teardown_notifier().await;
        self.source.close().await;
    }
}
