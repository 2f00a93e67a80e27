//! Synchronisation primitives for the cooperative loop.
//!
//! Thin, contract-carrying wrappers over `tokio::sync`. The wrappers exist to
//! pin down the exact semantics the buffer layer depends on rather than to
//! reimplement anything: tokio's mutex queues waiters FIFO, and its semaphore
//! wakes the next waiter through its stored waker — on the next cooperative
//! step, never synchronously inside the releasing call. That deferred wakeup
//! is what keeps backpressure handoff fair.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, MutexGuard, Notify, OwnedSemaphorePermit, Semaphore};

/// FIFO-fair mutual exclusion.
///
/// `lock()` suspends under contention and resolves to a guard; dropping the
/// guard releases the mutex to the longest-waiting contender.
#[derive(Debug, Default)]
pub struct FairMutex<T>(Mutex<T>);

impl<T> FairMutex<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    /// Acquire the mutex, suspending until it is free.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().await
    }
}

/// The gate was closed while a caller was waiting for a permit.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("gate closed")]
pub struct GateClosed;

/// Counting semaphore with owned permits.
///
/// `close()` wakes every waiter with [`GateClosed`]; the buffer layer uses
/// this to release stalled writers when a buffer terminates.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    /// Create a gate holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self(Arc::new(Semaphore::new(permits)))
    }

    /// Acquire one permit, suspending until one is available.
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        match self.0.clone().acquire_owned().await {
            Ok(permit) => Ok(GatePermit(permit)),
            Err(_) => Err(GateClosed),
        }
    }

    /// Acquire one permit without suspending, if one is available right now.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.0.clone().try_acquire_owned().ok().map(GatePermit)
    }

    /// Return `n` permits to the gate.
    pub fn add_permits(&self, n: usize) {
        self.0.add_permits(n);
    }

    /// Close the gate, waking all waiters with [`GateClosed`].
    pub fn close(&self) {
        self.0.close();
    }
}

/// One permit held out of a [`Gate`]. Dropping it returns the permit.
#[derive(Debug)]
pub struct GatePermit(OwnedSemaphorePermit);

impl GatePermit {
    /// Consume the permit without returning it to the gate.
    ///
    /// Used when a permit's ownership transfers to a buffer slot whose
    /// release is accounted for explicitly via `add_permits`.
    pub fn forget(self) {
        self.0.forget();
    }
}

/// Wait/signal coordination point.
///
/// `wait()` returns a future; callers that must not miss a signal fired
/// between checking state and suspending should pin the future and call
/// `enable()` on it before the check.
#[derive(Debug, Default)]
pub struct Notifier(Notify);

impl Notifier {
    /// Create a notifier with no queued signals.
    pub fn new() -> Self {
        Self(Notify::new())
    }

    /// A future resolving at the next signal.
    pub fn wait(&self) -> Notified<'_> {
        self.0.notified()
    }

    /// Wake one waiter. If none is waiting, the signal is stored for the
    /// next `wait`.
    pub fn signal(&self) {
        self.0.notify_one();
    }

    /// Wake all current waiters and clear the queue. Not stored for future
    /// waiters.
    pub fn signal_all(&self) {
        self.0.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fair_mutex_releases_on_guard_drop() {
        let mutex = Arc::new(FairMutex::new(0u32));
        {
            let mut guard = mutex.lock().await;
            *guard += 1;
        }
        let m = mutex.clone();
        let contender = tokio::spawn(async move {
            let mut guard = m.lock().await;
            *guard += 1;
            *guard
        });
        assert_eq!(contender.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn notifier_signal_wakes_one_waiter() {
        let notifier = Arc::new(Notifier::new());
        let n = notifier.clone();
        let waiter = tokio::spawn(async move {
            n.wait().await;
            1u32
        });
        tokio::task::yield_now().await;
        notifier.signal();
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gate_blocks_at_zero_permits() {
        let gate = Gate::new(1);
        let permit = gate.acquire().await.unwrap();
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn gate_close_wakes_waiters() {
        let gate = Gate::new(0);
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.acquire().await });
        tokio::task::yield_now().await;
        gate.close();
        assert_eq!(waiter.await.unwrap(), Err(GateClosed));
    }

    #[tokio::test]
    async fn notifier_signal_all_wakes_every_waiter() {
        let notifier = Arc::new(Notifier::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let n = notifier.clone();
            let w = woken.clone();
            handles.push(tokio::spawn(async move {
                n.wait().await;
                w.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // Let every waiter register before signalling.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        notifier.signal_all();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
    }
}
