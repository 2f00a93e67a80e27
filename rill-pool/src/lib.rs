#![deny(missing_docs)]
//! # rill-pool — worker-pool leases as a flow
//!
//! The pool itself is an external collaborator; this crate specifies its
//! interface ([`WorkerPool`]) and builds the lease surface on top: [`hire`]
//! checks out one worker, yields a single dedicated [`HiredWorker`] handle,
//! forwards pool events scoped to that worker, and completes once the handle
//! is released (or the subscription is cancelled), returning the worker.
//!
//! [`LocalWorkerPool`] is an in-process implementation for tests and demos:
//! a fixed set of workers behind a capacity gate, executing tasks with a
//! caller-supplied handler.

use async_trait::async_trait;
use futures::future::BoxFuture;
use rill_core::sync::Gate;
use rill_core::{BoxSource, Emission, EventSource, Flow, Pulled, StreamError, WorkerId};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Worker-pool errors.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is shut down or has no workers.
    #[error("pool closed")]
    Closed,

    /// Operation referenced a worker this pool does not own.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The lease was already released.
    #[error("lease released")]
    LeaseReleased,

    /// The worker failed the task.
    #[error("task failed: {0}")]
    Task(String),
}

impl From<PoolError> for StreamError {
    fn from(err: PoolError) -> Self {
        StreamError::Pool(err.to_string())
    }
}

/// What kind of event a worker surfaced.
#[derive(Debug, Clone)]
pub enum WorkerEventKind {
    /// A message payload from the worker.
    Message(serde_json::Value),
    /// A worker-side failure.
    Error(String),
}

/// An event surfaced by the pool, tagged with the worker it came from.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    /// The worker this event belongs to.
    pub worker: WorkerId,
    /// The payload.
    pub kind: WorkerEventKind,
}

/// The external collaborator's interface.
///
/// `checkout` hands out an idle worker (suspending until one frees up),
/// `assign` runs a task on a specific worker, `checkin` returns it. Pool
/// events are broadcast; consumers filter by worker id.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Acquire an idle worker, suspending until one is available.
    async fn checkout(&self) -> Result<WorkerId, PoolError>;

    /// Run one task on a checked-out worker.
    async fn assign(&self, worker: WorkerId, task: serde_json::Value)
    -> Result<serde_json::Value, PoolError>;

    /// Return a worker to the idle set. Returning an idle worker is a no-op.
    async fn checkin(&self, worker: WorkerId) -> Result<(), PoolError>;

    /// Subscribe to the pool's event stream.
    fn events(&self) -> broadcast::Receiver<WorkerEvent>;
}

// --- HiredWorker ---

/// An exclusive lease on one pool worker.
///
/// At most one handle is live per worker at a time; [`release`] is
/// idempotent, and after it every [`send_task`] fails with
/// [`PoolError::LeaseReleased`].
///
/// [`release`]: HiredWorker::release
/// [`send_task`]: HiredWorker::send_task
pub struct HiredWorker {
    worker: WorkerId,
    pool: Arc<dyn WorkerPool>,
    released: Arc<AtomicBool>,
    release_signal: CancellationToken,
}

impl Clone for HiredWorker {
    fn clone(&self) -> Self {
        Self {
            worker: self.worker,
            pool: self.pool.clone(),
            released: self.released.clone(),
            release_signal: self.release_signal.clone(),
        }
    }
}

impl fmt::Debug for HiredWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiredWorker")
            .field("worker", &self.worker)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl HiredWorker {
    /// The leased worker's id.
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Run one task on the leased worker.
    pub async fn send_task(&self, task: serde_json::Value) -> Result<serde_json::Value, PoolError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(PoolError::LeaseReleased);
        }
        self.pool.assign(self.worker, task).await
    }

    /// End the lease. Idempotent; the backing flow completes and the worker
    /// goes back to the pool.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.release_signal.cancel();
        }
    }

    /// Whether the lease has ended.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

// --- hire ---

type MessageCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Lease one worker as a flow.
///
/// Each subscription checks out its own worker and yields exactly one
/// [`HiredWorker`]. Pool events for that worker are forwarded to the
/// callbacks (events for other workers are filtered out); a worker error
/// auto-releases the lease without double-returning the worker. The flow
/// completes after release or unsubscribe, at which point the listeners are
/// detached and the worker is checked back in.
pub fn hire(
    pool: Arc<dyn WorkerPool>,
    on_message: impl Fn(serde_json::Value) + Send + Sync + 'static,
    on_error: impl Fn(String) + Send + Sync + 'static,
) -> Flow<HiredWorker> {
    let on_message: MessageCallback = Arc::new(on_message);
    let on_error: ErrorCallback = Arc::new(on_error);
    Flow::new("hire", move || {
        Box::new(HireSource {
            pool: pool.clone(),
            on_message: on_message.clone(),
            on_error: on_error.clone(),
            lease: None,
            done: false,
        }) as BoxSource<HiredWorker>
    })
}

struct Lease {
    worker: WorkerId,
    token: CancellationToken,
    released: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

struct HireSource {
    pool: Arc<dyn WorkerPool>,
    on_message: MessageCallback,
    on_error: ErrorCallback,
    lease: Option<Lease>,
    done: bool,
}

impl HireSource {
    async fn finish(&mut self) {
        self.done = true;
        if let Some(lease) = self.lease.take() {
            lease.released.store(true, Ordering::SeqCst);
            lease.token.cancel();
            if let Err(err) = self.pool.checkin(lease.worker).await {
                tracing::warn!(worker = lease.worker.get(), %err, "worker checkin failed");
            }
            let _ = lease.listener.await;
            tracing::debug!(worker = lease.worker.get(), "lease finished");
        }
    }
}

#[async_trait]
impl EventSource<HiredWorker> for HireSource {
    async fn pull(&mut self) -> Pulled<HiredWorker> {
        if self.done {
            return Ok(None);
        }
        let Some(lease) = self.lease.as_ref() else {
            let worker = self
                .pool
                .checkout()
                .await
                .map_err(StreamError::from)?;
            let released = Arc::new(AtomicBool::new(false));
            let token = CancellationToken::new();
            let handle = HiredWorker {
                worker,
                pool: self.pool.clone(),
                released: released.clone(),
                release_signal: token.clone(),
            };
            let listener = tokio::spawn(listen(
                self.pool.events(),
                handle.clone(),
                self.on_message.clone(),
                self.on_error.clone(),
                token.clone(),
            ));
            tracing::debug!(worker = worker.get(), "worker hired");
            self.lease = Some(Lease {
                worker,
                token,
                released,
                listener,
            });
            return Ok(Some(Emission::traced(handle)));
        };
        // The single handle is out; the flow completes at release.
        let release = lease.token.clone();
        release.cancelled().await;
        self.finish().await;
        Ok(None)
    }

    async fn close(&mut self) {
        self.finish().await;
    }
}

/// Forward pool events scoped to one worker into the hire callbacks.
async fn listen(
    mut events: broadcast::Receiver<WorkerEvent>,
    handle: HiredWorker,
    on_message: MessageCallback,
    on_error: ErrorCallback,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            event = events.recv() => match event {
                Ok(event) if event.worker == handle.worker_id() => match event.kind {
                    WorkerEventKind::Message(payload) => on_message(payload),
                    WorkerEventKind::Error(message) => {
                        on_error(message);
                        // A worker error aborts the lease; release() is
                        // idempotent so this cannot double-return it.
                        handle.release();
                    }
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "hire listener lagged behind pool events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

// --- LocalWorkerPool ---

type TaskHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, String>> + Send + Sync>;

/// In-process pool: a fixed set of workers behind a capacity gate, running
/// every task through one handler.
pub struct LocalWorkerPool {
    all: HashSet<WorkerId>,
    idle: Mutex<VecDeque<WorkerId>>,
    gate: Gate,
    handler: TaskHandler,
    events_tx: broadcast::Sender<WorkerEvent>,
}

impl LocalWorkerPool {
    /// A pool of `workers` workers executing tasks with `handler`.
    pub fn new<F, Fut>(workers: usize, handler: F) -> Arc<Self>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let ids: Vec<WorkerId> = (0..workers).map(|_| WorkerId::next()).collect();
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            all: ids.iter().copied().collect(),
            idle: Mutex::new(ids.into_iter().collect()),
            gate: Gate::new(workers),
            handler: Arc::new(move |task| Box::pin(handler(task))),
            events_tx,
        })
    }

    fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<WorkerId>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn checkout(&self) -> Result<WorkerId, PoolError> {
        let permit = self.gate.acquire().await.map_err(|_| PoolError::Closed)?;
        // The permit's slot is returned explicitly at checkin.
        permit.forget();
        self.idle_queue().pop_front().ok_or(PoolError::Closed)
    }

    async fn assign(
        &self,
        worker: WorkerId,
        task: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError> {
        if !self.all.contains(&worker) {
            return Err(PoolError::UnknownWorker(worker));
        }
        match (self.handler)(task).await {
            Ok(result) => {
                let _ = self.events_tx.send(WorkerEvent {
                    worker,
                    kind: WorkerEventKind::Message(result.clone()),
                });
                Ok(result)
            }
            Err(message) => {
                let _ = self.events_tx.send(WorkerEvent {
                    worker,
                    kind: WorkerEventKind::Error(message.clone()),
                });
                Err(PoolError::Task(message))
            }
        }
    }

    async fn checkin(&self, worker: WorkerId) -> Result<(), PoolError> {
        if !self.all.contains(&worker) {
            return Err(PoolError::UnknownWorker(worker));
        }
        let mut idle = self.idle_queue();
        if idle.contains(&worker) {
            return Ok(());
        }
        idle.push_back(worker);
        self.gate.add_permits(1);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events_tx.subscribe()
    }
}
