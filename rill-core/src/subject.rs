//! Subjects — hot, buffered flows.
//!
//! A subject couples a write surface (`next` / `error` / `complete`) with a
//! [`Flow`] surface. The flow is hot: every subscription attaches a fresh
//! reader to the shared buffer, so what a late subscriber sees is exactly
//! the attach-time snapshot its buffer kind defines (nothing, the latest
//! value, or the replay window).

use crate::buffer::CyclicBuffer;
use crate::error::{BufferError, StreamError};
use crate::flow::{Flow, Observer, Operator, Subscription};
use crate::id::ReaderId;
use crate::meta::Emission;
use crate::source::{BoxSource, EventSource, Pulled, TryPulled};
use crate::sync::Notifier;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

// --- Buffer-backed event source ---

/// One attached reader exposed through the pull protocol. Implements the
/// synchronous fast path: subjects are push-driven, so a value is often
/// already buffered when a combinator probes.
pub(crate) struct BufferReader<T> {
    buffer: Arc<CyclicBuffer<T>>,
    id: ReaderId,
    closed: bool,
}

impl<T: Clone + Send + 'static> BufferReader<T> {
    pub(crate) fn attach(buffer: Arc<CyclicBuffer<T>>) -> Self {
        let id = buffer.attach_reader();
        Self {
            buffer,
            id,
            closed: false,
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> EventSource<T> for BufferReader<T> {
    async fn pull(&mut self) -> Pulled<T> {
        if self.closed {
            return Ok(None);
        }
        match self.buffer.read(self.id).await {
            Ok(next) => Ok(next),
            Err(e) => Err(e.into()),
        }
    }

    fn try_pull(&mut self) -> TryPulled<T> {
        if self.closed {
            return TryPulled::Done;
        }
        self.buffer.try_read(self.id)
    }

    fn push_signal(&self) -> Option<Arc<Notifier>> {
        Some(self.buffer.write_signal())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer.detach_reader(self.id);
        }
    }
}

impl<T> Drop for BufferReader<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.buffer.detach_reader(self.id);
        }
    }
}

fn reader_flow<T: Clone + Send + fmt::Debug + 'static>(
    name: &'static str,
    buffer: &Arc<CyclicBuffer<T>>,
) -> Flow<T> {
    let buffer = buffer.clone();
    Flow::new(name, move || {
        Box::new(BufferReader::attach(buffer.clone())) as BoxSource<T>
    })
}

// --- Subject ---

/// A multicast flow with no replay: subscribers see only values written
/// after they attach.
pub struct Subject<T> {
    buffer: Arc<CyclicBuffer<T>>,
    flow: Flow<T>,
}

impl<T: Clone + Send + fmt::Debug + 'static> Subject<T> {
    /// Create an empty subject.
    pub fn new() -> Self {
        let buffer = Arc::new(CyclicBuffer::subject());
        let flow = reader_flow("subject", &buffer);
        Self { buffer, flow }
    }

    /// Push a value to every attached subscriber. A no-op when none is
    /// attached.
    pub fn next(&self, value: T) -> Result<(), BufferError> {
        self.buffer.write_now(Emission::traced(value))
    }

    /// Push a value that crossed a pipeline boundary, keeping the lineage
    /// it carried instead of starting a fresh one.
    pub fn next_tagged(&self, tagged: crate::meta::Tagged<T>) -> Result<(), BufferError> {
        self.buffer.write_now(tagged.into_emission())
    }

    /// Terminate all subscribers with an error.
    pub fn error(&self, error: StreamError) -> Result<(), BufferError> {
        self.buffer.error(error)
    }

    /// Complete all subscribers. Idempotent; a no-op after an error.
    pub fn complete(&self) -> Result<(), BufferError> {
        self.buffer.complete()
    }

    /// The subject's flow surface.
    pub fn flow(&self) -> Flow<T> {
        self.flow.clone()
    }

    /// Pipe an operator off the subject's flow surface.
    pub fn pipe<U, O>(&self, op: O) -> Flow<U>
    where
        U: Send + fmt::Debug + 'static,
        O: Operator<T, U>,
    {
        self.flow.pipe(op)
    }

    /// Subscribe directly to the subject.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        self.flow.subscribe(observer)
    }
}

impl<T: Clone + Send + fmt::Debug + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject").finish_non_exhaustive()
    }
}

// --- BehaviorSubject ---

/// A subject that serves its current value to every new subscriber first.
pub struct BehaviorSubject<T> {
    buffer: Arc<CyclicBuffer<T>>,
    flow: Flow<T>,
}

impl<T: Clone + Send + fmt::Debug + 'static> BehaviorSubject<T> {
    /// Create a behavior subject with an initial value.
    pub fn new(initial: T) -> Self {
        let buffer = Arc::new(CyclicBuffer::behavior(Some(initial)));
        let flow = reader_flow("behavior_subject", &buffer);
        Self { buffer, flow }
    }

    /// Create a behavior subject whose initial value resolves later.
    ///
    /// Subscribers that arrive before resolution suspend on their first read
    /// unless a `next` supersedes the seed. Must be called within a tokio
    /// runtime.
    pub fn with_seed<F>(seed: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let buffer = Arc::new(CyclicBuffer::behavior_pending());
        let resolver = buffer.clone();
        tokio::spawn(async move {
            let value = seed.await;
            resolver.resolve_seed(value);
        });
        let flow = reader_flow("behavior_subject", &buffer);
        Self { buffer, flow }
    }

    /// The current value, if the seed has resolved and no error superseded
    /// it.
    pub fn value(&self) -> Option<T> {
        self.buffer.latest_value()
    }

    /// Push a value; it becomes the new current value.
    pub fn next(&self, value: T) -> Result<(), BufferError> {
        self.buffer.write_now(Emission::traced(value))
    }

    /// Terminate with an error; the error becomes the current value.
    pub fn error(&self, error: StreamError) -> Result<(), BufferError> {
        self.buffer.error(error)
    }

    /// Complete all subscribers. Idempotent; a no-op after an error.
    pub fn complete(&self) -> Result<(), BufferError> {
        self.buffer.complete()
    }

    /// The subject's flow surface.
    pub fn flow(&self) -> Flow<T> {
        self.flow.clone()
    }

    /// Pipe an operator off the subject's flow surface.
    pub fn pipe<U, O>(&self, op: O) -> Flow<U>
    where
        U: Send + fmt::Debug + 'static,
        O: Operator<T, U>,
    {
        self.flow.pipe(op)
    }

    /// Subscribe directly to the subject.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        self.flow.subscribe(observer)
    }
}

impl<T> fmt::Debug for BehaviorSubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorSubject").finish_non_exhaustive()
    }
}

// --- ReplaySubject ---

/// A subject that replays up to `cap` retained values to new subscribers.
///
/// Bounded replay applies backpressure, so `next` is async: it suspends
/// while every retained slot is still needed by some subscriber.
pub struct ReplaySubject<T> {
    buffer: Arc<CyclicBuffer<T>>,
    flow: Flow<T>,
}

impl<T: Clone + Send + fmt::Debug + 'static> ReplaySubject<T> {
    /// Create a replay subject retaining the last `cap` values.
    pub fn new(cap: usize) -> Self {
        let buffer = Arc::new(CyclicBuffer::replay(Some(cap)));
        let flow = reader_flow("replay_subject", &buffer);
        Self { buffer, flow }
    }

    /// Create a replay subject retaining everything. Never blocks.
    pub fn unbounded() -> Self {
        let buffer = Arc::new(CyclicBuffer::replay(None));
        let flow = reader_flow("replay_subject", &buffer);
        Self { buffer, flow }
    }

    /// Push a value, suspending under backpressure.
    pub async fn next(&self, value: T) -> Result<(), BufferError> {
        self.buffer.write(Emission::traced(value)).await
    }

    /// Terminate all subscribers with an error and release stalled writers.
    pub fn error(&self, error: StreamError) -> Result<(), BufferError> {
        self.buffer.error(error)
    }

    /// Complete all subscribers and release stalled writers. Idempotent; a
    /// no-op after an error.
    pub fn complete(&self) -> Result<(), BufferError> {
        self.buffer.complete()
    }

    /// The subject's flow surface.
    pub fn flow(&self) -> Flow<T> {
        self.flow.clone()
    }

    /// Pipe an operator off the subject's flow surface.
    pub fn pipe<U, O>(&self, op: O) -> Flow<U>
    where
        U: Send + fmt::Debug + 'static,
        O: Operator<T, U>,
    {
        self.flow.pipe(op)
    }

    /// Subscribe directly to the subject.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        self.flow.subscribe(observer)
    }
}

impl<T> fmt::Debug for ReplaySubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaySubject").finish_non_exhaustive()
    }
}
