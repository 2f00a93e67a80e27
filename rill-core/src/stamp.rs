//! Emission stamps and the cooperative flush point.
//!
//! Stamps are the ordering truth of the whole runtime. Wall-clock time and
//! future-resolution order are both unusable for deciding which of two
//! emissions happened first — resolution order is non-deterministic across
//! cooperative steps — so every source draws an integer from one process-wide
//! clock at the moment it produces a value. Combinators that merge streams
//! (`buffer_until`, `with_latest_from`) compare stamps, never arrival.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static CLOCK: AtomicU64 = AtomicU64::new(1);

/// A strictly monotonic logical clock value, comparable across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmissionStamp(pub u64);

impl EmissionStamp {
    /// Draw the next stamp from the process-wide clock.
    pub fn next() -> Self {
        Self(CLOCK.fetch_add(1, Ordering::SeqCst))
    }

    /// The raw clock value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EmissionStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// How many yield rounds [`flush`] performs.
const FLUSH_ROUNDS: usize = 64;

/// Cooperative quiescence point.
///
/// Yields to the runtime repeatedly so that every task already woken gets a
/// chance to run. Tests and the tracer use this to observe a pipeline after
/// all immediately scheduled work has happened. Only ordering is guaranteed;
/// a task that suspends on a timer or an empty buffer stays suspended.
pub async fn flush() {
    for _ in 0..FLUSH_ROUNDS {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_strictly_monotonic() {
        let a = EmissionStamp::next();
        let b = EmissionStamp::next();
        let c = EmissionStamp::next();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn flush_lets_ready_tasks_run() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(7u32);
        });
        flush().await;
        assert_eq!(rx.await.unwrap(), 7);
    }
}
