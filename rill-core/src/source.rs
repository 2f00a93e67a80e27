//! The pull protocol every pipeline stage speaks.

use crate::error::StreamError;
use crate::meta::Emission;
use crate::sync::Notifier;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of one `pull`: the next emission, completion (`Ok(None)`), or a
/// pipeline failure.
pub type Pulled<T> = Result<Option<Emission<T>>, StreamError>;

/// Result of the synchronous fast path.
#[derive(Debug)]
pub enum TryPulled<T> {
    /// A value was already buffered for this reader.
    Ready(Emission<T>),
    /// The source has completed and drained.
    Done,
    /// The source has failed.
    Failed(StreamError),
    /// Nothing buffered right now — fall back to `pull`.
    Pending,
}

/// One stage of a pipeline: a source of emissions that can be pulled,
/// probed synchronously, and closed.
///
/// ## Contract
///
/// - `close` forwards termination upstream and is idempotent; after it,
///   `pull` returns `Ok(None)`.
/// - An error is terminal: buffer readers keep returning the in-band error
///   on every later pull, and the shipped drivers stop a subscription at
///   the first error — a stage is never pulled past one.
/// - **Cancel safety**: a `pull` future dropped before completion must not
///   lose an emission. This is what lets combinators race two sources with
///   `select` and re-pull the loser. Buffer readers uphold it by consuming
///   only in the synchronous step after wakeup; wrappers uphold it by doing
///   all post-`await` work synchronously.
/// - `try_pull` is the fast path push-driven sources implement: it hands out
///   a value that is already buffered without a suspension round-trip.
///   `push_signal` exposes the notifier such a source fires when a value
///   becomes synchronously available. Both default to "not supported";
///   falling back to `pull` costs a round-trip, never correctness.
#[async_trait]
pub trait EventSource<T: Send + 'static>: Send {
    /// Produce the next emission, suspending until one is available.
    async fn pull(&mut self) -> Pulled<T>;

    /// Hand out an already-buffered emission without suspending.
    fn try_pull(&mut self) -> TryPulled<T> {
        TryPulled::Pending
    }

    /// The notifier fired when a value becomes synchronously available.
    fn push_signal(&self) -> Option<Arc<Notifier>> {
        None
    }

    /// Close this stage and everything upstream of it. Idempotent.
    async fn close(&mut self);
}

/// Boxed stage — the form operators consume and produce.
pub type BoxSource<T> = Box<dyn EventSource<T>>;

// --- Leaf sources ---

/// A finite source over a synchronous iterator.
pub(crate) struct IterSource<I> {
    iter: I,
    done: bool,
}

impl<I> IterSource<I> {
    pub(crate) fn new(iter: I) -> Self {
        Self { iter, done: false }
    }
}

#[async_trait]
impl<T, I> EventSource<T> for IterSource<I>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send,
{
    async fn pull(&mut self) -> Pulled<T> {
        match self.try_pull() {
            TryPulled::Ready(e) => Ok(Some(e)),
            TryPulled::Done => Ok(None),
            TryPulled::Failed(e) => Err(e),
            TryPulled::Pending => Ok(None),
        }
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        if self.done {
            return TryPulled::Done;
        }
        match self.iter.next() {
            Some(value) => TryPulled::Ready(Emission::traced(value)),
            None => {
                self.done = true;
                TryPulled::Done
            }
        }
    }

    async fn close(&mut self) {
        self.done = true;
    }
}

/// A source that completes immediately.
pub(crate) struct EmptySource;

#[async_trait]
impl<T: Send + 'static> EventSource<T> for EmptySource {
    async fn pull(&mut self) -> Pulled<T> {
        Ok(None)
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        TryPulled::Done
    }

    async fn close(&mut self) {}
}

/// A source that never produces and never completes.
pub(crate) struct NeverSource {
    closed: bool,
}

impl NeverSource {
    pub(crate) fn new() -> Self {
        Self { closed: false }
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for NeverSource {
    async fn pull(&mut self) -> Pulled<T> {
        if self.closed {
            return Ok(None);
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// A source that fails on the first pull.
pub(crate) struct FailSource {
    error: StreamError,
}

impl FailSource {
    pub(crate) fn new(error: StreamError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for FailSource {
    async fn pull(&mut self) -> Pulled<T> {
        Err(self.error.clone())
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        TryPulled::Failed(self.error.clone())
    }

    async fn close(&mut self) {}
}

/// A one-shot source resolving a future into a single emission.
pub(crate) struct FutureSource<T> {
    future: Option<futures::future::BoxFuture<'static, T>>,
    done: bool,
}

impl<T> FutureSource<T> {
    pub(crate) fn new(future: futures::future::BoxFuture<'static, T>) -> Self {
        Self {
            future: Some(future),
            done: false,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for FutureSource<T> {
    async fn pull(&mut self) -> Pulled<T> {
        if self.done {
            return Ok(None);
        }
        match self.future.take() {
            Some(fut) => {
                let value = fut.await;
                Ok(Some(Emission::traced(value)))
            }
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
