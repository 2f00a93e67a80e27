//! Temporal operators: debounce, throttle, delay.
//!
//! Each operator owns its timers and cancels them when closed. Upstream is
//! driven by a pump task so values keep arriving (and get arrival-stamped)
//! while the operator sleeps; only ordering relative to emission stamps is
//! guaranteed, never wall-clock placement.

use crate::util::{PumpEvent, spawn_pump};
use async_trait::async_trait;
use rill_core::{BoxSource, Emission, EventSource, OpCx, Operator, Pulled};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn pumped<T: Send + 'static>(
    source: BoxSource<T>,
) -> (mpsc::UnboundedReceiver<PumpEvent<T>>, CancellationToken) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    spawn_pump(0, source, tx, cancel.clone());
    (rx, cancel)
}

// --- debounce ---

/// Coalesce bursts into their latest value: a value is emitted once `window`
/// elapses without a newer one arriving. A pending value flushes immediately
/// on completion.
pub fn debounce<T>(window: Duration) -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
{
    DebounceOp { window }
}

struct DebounceOp {
    window: Duration,
}

impl<T> Operator<T, T> for DebounceOp
where
    T: Send + fmt::Debug + 'static,
{
    fn name(&self) -> &str {
        "debounce"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        let (rx, cancel) = pumped(source);
        Box::new(DebounceSource {
            rx,
            cancel,
            window: self.window,
            pending: None,
            deadline: Instant::now(),
            done: false,
            cx,
        })
    }
}

struct DebounceSource<T> {
    rx: mpsc::UnboundedReceiver<PumpEvent<T>>,
    cancel: CancellationToken,
    window: Duration,
    pending: Option<Emission<T>>,
    deadline: Instant,
    done: bool,
    cx: OpCx,
}

impl<T: Send + fmt::Debug + 'static> DebounceSource<T> {
    fn emit(&mut self) -> Option<Emission<T>> {
        let e = self.pending.take()?;
        let id = e.value_id();
        self.cx.exit_transformed(id, &e.value);
        let Emission { value, stamp, meta } = e;
        Some(Emission {
            value,
            stamp,
            meta: self.cx.transform_meta(meta),
        })
    }

    fn replace_pending(&mut self, e: Emission<T>, arrived: Instant) {
        if let Some(old) = self.pending.take() {
            // Superseded within the window.
            self.cx.exit_filtered(old.value_id());
        }
        self.cx.enter(e.value_id(), &e.value);
        self.pending = Some(e);
        self.deadline = arrived + self.window;
    }
}

#[async_trait]
impl<T> EventSource<T> for DebounceSource<T>
where
    T: Send + fmt::Debug + 'static,
{
    async fn pull(&mut self) -> Pulled<T> {
        loop {
            if self.done {
                return match self.emit() {
                    Some(e) => Ok(Some(e)),
                    None => Ok(None),
                };
            }
            if self.pending.is_some() {
                tokio::select! {
                    _ = tokio::time::sleep_until(self.deadline) => {
                        if let Some(e) = self.emit() {
                            return Ok(Some(e));
                        }
                    }
                    event = self.rx.recv() => match event {
                        Some(PumpEvent::Value(_, e, arrived)) => self.replace_pending(e, arrived),
                        Some(PumpEvent::Done(_)) | None => self.done = true,
                        Some(PumpEvent::Failed(err)) => return Err(err),
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(PumpEvent::Value(_, e, arrived)) => self.replace_pending(e, arrived),
                    Some(PumpEvent::Done(_)) | None => self.done = true,
                    Some(PumpEvent::Failed(err)) => return Err(err),
                }
            }
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.done = true;
        self.pending = None;
    }
}

impl<T> Drop for DebounceSource<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// --- throttle ---

/// Emit at most one value per window, leading edge: the first value opens
/// the window and passes; values arriving inside it are dropped.
pub fn throttle<T>(window: Duration) -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
{
    ThrottleOp { window }
}

struct ThrottleOp {
    window: Duration,
}

impl<T> Operator<T, T> for ThrottleOp
where
    T: Send + fmt::Debug + 'static,
{
    fn name(&self) -> &str {
        "throttle"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        let (rx, cancel) = pumped(source);
        Box::new(ThrottleSource {
            rx,
            cancel,
            window: self.window,
            window_ends: None,
            cx,
        })
    }
}

struct ThrottleSource<T> {
    rx: mpsc::UnboundedReceiver<PumpEvent<T>>,
    cancel: CancellationToken,
    window: Duration,
    window_ends: Option<Instant>,
    cx: OpCx,
}

#[async_trait]
impl<T> EventSource<T> for ThrottleSource<T>
where
    T: Send + fmt::Debug + 'static,
{
    async fn pull(&mut self) -> Pulled<T> {
        loop {
            match self.rx.recv().await {
                Some(PumpEvent::Value(_, e, arrived)) => {
                    let id = e.value_id();
                    self.cx.enter(id, &e.value);
                    let open = self.window_ends.is_none_or(|ends| arrived >= ends);
                    if open {
                        self.window_ends = Some(arrived + self.window);
                        self.cx.exit_transformed(id, &e.value);
                        let Emission { value, stamp, meta } = e;
                        return Ok(Some(Emission {
                            value,
                            stamp,
                            meta: self.cx.transform_meta(meta),
                        }));
                    }
                    self.cx.exit_filtered(id);
                }
                Some(PumpEvent::Done(_)) | None => return Ok(None),
                Some(PumpEvent::Failed(err)) => return Err(err),
            }
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for ThrottleSource<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// --- delay ---

/// Shift each emission by a fixed duration from its arrival.
pub fn delay<T>(by: Duration) -> impl Operator<T, T>
where
    T: Send + fmt::Debug + 'static,
{
    DelayOp { by }
}

struct DelayOp {
    by: Duration,
}

impl<T> Operator<T, T> for DelayOp
where
    T: Send + fmt::Debug + 'static,
{
    fn name(&self) -> &str {
        "delay"
    }

    fn apply(&self, source: BoxSource<T>, cx: OpCx) -> BoxSource<T> {
        let (rx, cancel) = pumped(source);
        Box::new(DelaySource {
            rx,
            cancel,
            by: self.by,
            held: None,
            cx,
        })
    }
}

struct DelaySource<T> {
    rx: mpsc::UnboundedReceiver<PumpEvent<T>>,
    cancel: CancellationToken,
    by: Duration,
    /// A value received but not yet released; survives a dropped pull.
    held: Option<(Emission<T>, Instant)>,
    cx: OpCx,
}

#[async_trait]
impl<T> EventSource<T> for DelaySource<T>
where
    T: Send + fmt::Debug + 'static,
{
    async fn pull(&mut self) -> Pulled<T> {
        if self.held.is_none() {
            match self.rx.recv().await {
                Some(PumpEvent::Value(_, e, arrived)) => {
                    self.cx.enter(e.value_id(), &e.value);
                    self.held = Some((e, arrived + self.by));
                }
                Some(PumpEvent::Done(_)) | None => return Ok(None),
                Some(PumpEvent::Failed(err)) => return Err(err),
            }
        }
        if let Some((_, release_at)) = self.held.as_ref() {
            tokio::time::sleep_until(*release_at).await;
        }
        match self.held.take() {
            Some((e, _)) => {
                let id = e.value_id();
                self.cx.exit_transformed(id, &e.value);
                let Emission { value, stamp, meta } = e;
                Ok(Some(Emission {
                    value,
                    stamp,
                    meta: self.cx.transform_meta(meta),
                }))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.held = None;
    }
}

impl<T> Drop for DelaySource<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
