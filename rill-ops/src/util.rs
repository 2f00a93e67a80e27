//! Small leaf sources and shared lineage helpers for the combinators.

use async_trait::async_trait;
use futures::future::BoxFuture;
use rill_core::{
    BoxSource, Emission, EventSource, OpCx, Pulled, StreamError, TryPulled, ValueId, ValueMeta,
};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Event sent by a pump task driving one source into a shared channel.
pub(crate) enum PumpEvent<T> {
    /// An emission, tagged with its pump slot and arrival instant.
    Value(u64, Emission<T>, tokio::time::Instant),
    /// The pumped source completed.
    Done(u64),
    /// The pumped source failed.
    Failed(StreamError),
}

/// Spawn a task driving `source` into `tx` until it finishes, the channel
/// closes, or `cancel` fires. Cancellation closes the source.
pub(crate) fn spawn_pump<T: Send + 'static>(
    slot: u64,
    mut source: BoxSource<T>,
    tx: mpsc::UnboundedSender<PumpEvent<T>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    source.close().await;
                    return;
                }
                pulled = source.pull() => match pulled {
                    Ok(Some(e)) => {
                        let event = PumpEvent::Value(slot, e, tokio::time::Instant::now());
                        if tx.send(event).is_err() {
                            source.close().await;
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(PumpEvent::Done(slot));
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(slot, %err, "pumped source failed");
                        let _ = tx.send(PumpEvent::Failed(err));
                        return;
                    }
                }
            }
        }
    });
}

/// A finite source over pre-built emissions. Backs projected values and
/// arrays in the flattening operators.
pub(crate) struct QueueSource<T> {
    items: VecDeque<Emission<T>>,
    done: bool,
}

impl<T> QueueSource<T> {
    pub(crate) fn new(items: impl IntoIterator<Item = Emission<T>>) -> Self {
        Self {
            items: items.into_iter().collect(),
            done: false,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for QueueSource<T> {
    async fn pull(&mut self) -> Pulled<T> {
        if self.done {
            return Ok(None);
        }
        Ok(self.items.pop_front())
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        if self.done {
            return TryPulled::Done;
        }
        match self.items.pop_front() {
            Some(e) => TryPulled::Ready(e),
            None => TryPulled::Done,
        }
    }

    async fn close(&mut self) {
        self.done = true;
        self.items.clear();
    }
}

/// A one-shot source resolving a boxed future into a single emission.
pub(crate) struct OnceFutureSource<T> {
    future: Option<BoxFuture<'static, T>>,
    done: bool,
}

impl<T> OnceFutureSource<T> {
    pub(crate) fn new(future: BoxFuture<'static, T>) -> Self {
        Self {
            future: Some(future),
            done: false,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for OnceFutureSource<T> {
    async fn pull(&mut self) -> Pulled<T> {
        if self.done {
            return Ok(None);
        }
        match self.future.take() {
            Some(fut) => Ok(Some(Emission::traced(fut.await))),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.done = true;
        self.future = None;
    }
}

/// Lineage of one outer value while an inner source runs for it.
pub(crate) struct InnerState {
    pub(crate) base: Option<ValueId>,
    pub(crate) emitted: bool,
}

/// Re-tag an inner emission against its outer value: the first emission
/// continues the outer value's lineage, later ones become expansion
/// children of it.
pub(crate) fn retag_inner<Out: fmt::Debug>(
    cx: &OpCx,
    state: &mut InnerState,
    e: Emission<Out>,
) -> Emission<Out> {
    if !state.emitted {
        state.emitted = true;
        if let Some(base) = state.base {
            cx.exit_expanded(Some(base), &e.value);
            return Emission {
                meta: Some(ValueMeta::transformed(
                    base,
                    cx.operator_index,
                    &cx.operator_name,
                )),
                ..e
            };
        }
        return e;
    }
    if let Some(base) = state.base {
        let child = ValueId::next();
        cx.child(child, base, &e.value);
        return Emission {
            meta: Some(cx.expand_meta(child, base)),
            ..e
        };
    }
    e
}

/// Close an inner's lineage when it finished: an outer value whose inner
/// produced nothing was effectively dropped.
pub(crate) fn finish_inner(cx: &OpCx, state: InnerState) {
    if !state.emitted {
        cx.exit_filtered(state.base);
    }
}
