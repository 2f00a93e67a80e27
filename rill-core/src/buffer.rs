//! Multi-reader fan-out buffers.
//!
//! [`CyclicBuffer`] is the primitive subjects are built on: one writer side,
//! any number of independently positioned readers. The three constructors
//! differ only in what a freshly attached reader sees:
//!
//! - [`CyclicBuffer::subject`] — nothing; only values written after attach.
//! - [`CyclicBuffer::behavior`] — the current latest value first, then the
//!   live sequence.
//! - [`CyclicBuffer::replay`] — the retained window (up to `cap` values, or
//!   everything when unbounded), then the live sequence.
//!
//! Errors and completion are in-band markers: a reader drains every value
//! written before the marker, then observes it. Writes after a marker are
//! rejected synchronously; `complete` after `error` is a no-op.
//!
//! A bounded replay buffer applies backpressure: each retained slot that at
//! least one attached reader has not consumed holds one [`Gate`] permit, so
//! `write` suspends exactly when all `cap` slots are still needed by someone.
//! When the last reader consumes a slot its permit returns to the gate; the
//! value itself stays in the window (for future attaches) until capacity
//! evicts it. Terminating the buffer closes the gate, releasing any stalled
//! writer.

use crate::error::{BufferError, StreamError};
use crate::id::ReaderId;
use crate::meta::Emission;
use crate::sync::{Gate, GateClosed, Notifier};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Result of a non-consuming [`CyclicBuffer::peek`].
#[derive(Debug)]
pub enum Peeked<T> {
    /// The next emission this reader would read.
    Value(Emission<T>),
    /// The reader has caught up but the buffer is still live.
    NotReady,
    /// The reader has drained a completed buffer.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    Subject,
    Behavior,
    Replay,
}

enum Latest<T> {
    Empty,
    Pending,
    Value(Emission<T>),
    Failed(StreamError),
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(StreamError),
}

struct Slot<T> {
    emission: Emission<T>,
    /// Attached readers that still need this slot.
    outstanding: usize,
    /// Whether this slot's backpressure permit has been returned.
    permit_released: bool,
}

#[derive(Debug, Clone, Copy)]
struct ReaderState {
    /// Absolute index of the next slot this reader consumes.
    pos: u64,
    /// Behavior readers serve the latest value before touching the window.
    needs_current: bool,
}

struct Window<T> {
    slots: VecDeque<Slot<T>>,
    /// Absolute index of `slots[0]`.
    base: u64,
    /// Total values written.
    written: u64,
    readers: HashMap<ReaderId, ReaderState>,
    terminal: Option<Terminal>,
    latest: Latest<T>,
    /// Permits owed to the gate by in-flight writers after an attach had to
    /// re-claim a released slot while no permit was free.
    permit_debt: usize,
}

enum Step<T> {
    Value(Emission<T>),
    Done,
    Fault(StreamError),
    NotReady,
}

/// The multi-reader fan-out buffer. See the module docs for semantics.
pub struct CyclicBuffer<T> {
    kind: BufferKind,
    cap: Option<usize>,
    gate: Option<Gate>,
    window: Mutex<Window<T>>,
    on_write: Arc<Notifier>,
}

impl<T> CyclicBuffer<T> {
    fn with_kind(kind: BufferKind, cap: Option<usize>, latest: Latest<T>) -> Self {
        Self {
            kind,
            cap,
            gate: cap.map(Gate::new),
            window: Mutex::new(Window {
                slots: VecDeque::new(),
                base: 0,
                written: 0,
                readers: HashMap::new(),
                terminal: None,
                latest,
                permit_debt: 0,
            }),
            on_write: Arc::new(Notifier::new()),
        }
    }

    /// A plain subject buffer: writes with no attached readers are dropped.
    pub fn subject() -> Self {
        Self::with_kind(BufferKind::Subject, None, Latest::Empty)
    }

    /// A behavior buffer with an optional initial value.
    pub fn behavior(initial: Option<T>) -> Self {
        let latest = match initial {
            Some(v) => Latest::Value(Emission::traced(v)),
            None => Latest::Empty,
        };
        Self::with_kind(BufferKind::Behavior, None, latest)
    }

    /// A behavior buffer whose initial value is still resolving; feed it via
    /// [`CyclicBuffer::resolve_seed`].
    pub fn behavior_pending() -> Self {
        Self::with_kind(BufferKind::Behavior, None, Latest::Pending)
    }

    /// A replay buffer retaining the last `cap` values (`None` = unbounded,
    /// never blocks).
    pub fn replay(cap: Option<usize>) -> Self {
        Self::with_kind(BufferKind::Replay, cap, Latest::Empty)
    }

    fn window(&self) -> MutexGuard<'_, Window<T>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The notifier fired on every write and terminal transition.
    pub fn write_signal(&self) -> Arc<Notifier> {
        self.on_write.clone()
    }

    /// Install a late-resolving initial value, unless a write or terminal
    /// superseded it.
    pub fn resolve_seed(&self, value: T) {
        {
            let mut w = self.window();
            if matches!(w.latest, Latest::Pending) {
                w.latest = Latest::Value(Emission::traced(value));
            }
        }
        self.on_write.signal_all();
    }

    /// The current latest value of a behavior buffer, if resolved.
    pub fn latest_value(&self) -> Option<T>
    where
        T: Clone,
    {
        match &self.window().latest {
            Latest::Value(e) => Some(e.value.clone()),
            _ => None,
        }
    }

    fn terminal_error(terminal: &Terminal) -> BufferError {
        match terminal {
            Terminal::Failed(_) => BufferError::WriteAfterError,
            Terminal::Completed => BufferError::WriteAfterComplete,
        }
    }

    /// Write without suspending. Panics in debug builds if called on a
    /// bounded replay buffer, which may need to block; use [`write`].
    ///
    /// [`write`]: CyclicBuffer::write
    pub fn write_now(&self, emission: Emission<T>) -> Result<(), BufferError>
    where
        T: Clone,
    {
        debug_assert!(self.gate.is_none(), "bounded replay writes must go through write()");
        {
            let mut w = self.window();
            if let Some(t) = &w.terminal {
                return Err(Self::terminal_error(t));
            }
            if self.kind == BufferKind::Behavior {
                w.latest = Latest::Value(emission.clone());
            }
            if self.kind != BufferKind::Replay && w.readers.is_empty() {
                // Subject semantics: nothing is accumulated for nobody.
                return Ok(());
            }
            let outstanding = w.readers.len();
            w.slots.push_back(Slot {
                emission,
                outstanding,
                permit_released: true,
            });
            w.written += 1;
        }
        self.on_write.signal_all();
        Ok(())
    }

    /// Write one emission, suspending under bounded-replay backpressure.
    pub async fn write(&self, emission: Emission<T>) -> Result<(), BufferError>
    where
        T: Clone,
    {
        let Some(gate) = self.gate.clone() else {
            return self.write_now(emission);
        };
        loop {
            let permit = match gate.acquire().await {
                Ok(p) => p,
                Err(GateClosed) => {
                    let w = self.window();
                    let terminal = w.terminal.clone();
                    return Err(match terminal {
                        Some(t) => Self::terminal_error(&t),
                        // The gate only closes on terminal transitions.
                        None => BufferError::WriteAfterComplete,
                    });
                }
            };
            let mut w = self.window();
            if let Some(t) = &w.terminal {
                return Err(Self::terminal_error(t));
            }
            if w.permit_debt > 0 {
                // An attach re-claimed a released slot while this writer held
                // the permit; settle the debt and go around.
                w.permit_debt -= 1;
                permit.forget();
                drop(w);
                continue;
            }
            let cap = self.cap.unwrap_or(usize::MAX);
            if w.slots.len() >= cap {
                let evicted = w.slots.pop_front();
                debug_assert!(evicted.map(|s| s.outstanding == 0).unwrap_or(true));
                w.base += 1;
            }
            let outstanding = w.readers.len();
            if outstanding == 0 {
                // Nobody needs this slot; its permit goes straight back.
                drop(permit);
            } else {
                permit.forget();
            }
            w.slots.push_back(Slot {
                emission,
                outstanding,
                permit_released: outstanding == 0,
            });
            w.written += 1;
            drop(w);
            self.on_write.signal_all();
            return Ok(());
        }
    }

    /// Terminate with an in-band error marker.
    pub fn error(&self, error: StreamError) -> Result<(), BufferError> {
        {
            let mut w = self.window();
            if let Some(t) = &w.terminal {
                return Err(Self::terminal_error(t));
            }
            if self.kind == BufferKind::Behavior {
                w.latest = Latest::Failed(error.clone());
            }
            w.terminal = Some(Terminal::Failed(error));
        }
        if let Some(gate) = &self.gate {
            gate.close();
        }
        self.on_write.signal_all();
        Ok(())
    }

    /// Terminate with an in-band completion marker. Idempotent; a no-op
    /// after an error.
    pub fn complete(&self) -> Result<(), BufferError> {
        {
            let mut w = self.window();
            if w.terminal.is_some() {
                return Ok(());
            }
            w.terminal = Some(Terminal::Completed);
        }
        if let Some(gate) = &self.gate {
            gate.close();
        }
        self.on_write.signal_all();
        Ok(())
    }

    /// Attach a new reader and return its id.
    pub fn attach_reader(&self) -> ReaderId {
        let id = ReaderId::next();
        let mut w = self.window();
        let state = match self.kind {
            BufferKind::Subject => ReaderState {
                pos: w.written,
                needs_current: false,
            },
            BufferKind::Behavior => ReaderState {
                pos: w.written,
                needs_current: true,
            },
            BufferKind::Replay => {
                // The new reader needs every retained slot, including slots
                // whose permit already went back to the gate.
                let mut debt = 0usize;
                for slot in w.slots.iter_mut() {
                    let was_released = slot.permit_released;
                    slot.outstanding += 1;
                    if was_released {
                        slot.permit_released = false;
                        if let Some(gate) = &self.gate {
                            match gate.try_acquire() {
                                Some(p) => p.forget(),
                                None => debt += 1,
                            }
                        }
                    }
                }
                w.permit_debt += debt;
                ReaderState {
                    pos: w.base,
                    needs_current: false,
                }
            }
        };
        w.readers.insert(id, state);
        id
    }

    /// Detach a reader, releasing every slot it had yet to consume.
    pub fn detach_reader(&self, id: ReaderId) {
        let mut w = self.window();
        let Some(state) = w.readers.remove(&id) else {
            return;
        };
        let base = w.base;
        let start = state.pos.saturating_sub(base) as usize;
        let mut freed = 0usize;
        for slot in w.slots.iter_mut().skip(start) {
            slot.outstanding = slot.outstanding.saturating_sub(1);
            if slot.outstanding == 0 && !slot.permit_released {
                slot.permit_released = true;
                freed += 1;
            }
        }
        if freed > 0 {
            if let Some(gate) = &self.gate {
                gate.add_permits(freed);
            }
        }
        self.prune(&mut w);
    }

    fn prune(&self, w: &mut Window<T>) {
        if self.kind == BufferKind::Replay {
            // Replay retains consumed slots for future attaches; eviction
            // happens at write time against the capacity.
            return;
        }
        while w.slots.front().is_some_and(|s| s.outstanding == 0) {
            w.slots.pop_front();
            w.base += 1;
        }
    }

    fn consume_slot(&self, w: &mut Window<T>, idx: usize) {
        let mut freed = false;
        {
            let slot = &mut w.slots[idx];
            slot.outstanding = slot.outstanding.saturating_sub(1);
            if slot.outstanding == 0 && !slot.permit_released {
                slot.permit_released = true;
                freed = true;
            }
        }
        if freed {
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
        }
        self.prune(w);
    }

    fn step(&self, id: ReaderId, consume: bool) -> Result<Step<T>, BufferError>
    where
        T: Clone,
    {
        let mut w = self.window();
        let (pos, needs_current) = {
            let s = w.readers.get(&id).ok_or(BufferError::UnknownReader(id))?;
            (s.pos, s.needs_current)
        };
        if needs_current {
            match &w.latest {
                Latest::Value(e) => {
                    let out = e.clone();
                    if consume {
                        let written = w.written;
                        let s = w.readers.get_mut(&id).ok_or(BufferError::UnknownReader(id))?;
                        s.needs_current = false;
                        // Everything currently in the window is superseded by
                        // the latest value this reader just took.
                        s.pos = written;
                    }
                    return Ok(Step::Value(out));
                }
                Latest::Failed(e) => {
                    let out = e.clone();
                    if consume {
                        let written = w.written;
                        let s = w.readers.get_mut(&id).ok_or(BufferError::UnknownReader(id))?;
                        s.needs_current = false;
                        s.pos = written;
                    }
                    return Ok(Step::Fault(out));
                }
                Latest::Pending => return Ok(Step::NotReady),
                Latest::Empty => {}
            }
        }
        if pos < w.written {
            let idx = (pos - w.base) as usize;
            let emission = w.slots[idx].emission.clone();
            if consume {
                let s = w.readers.get_mut(&id).ok_or(BufferError::UnknownReader(id))?;
                s.pos += 1;
                self.consume_slot(&mut w, idx);
            }
            return Ok(Step::Value(emission));
        }
        match &w.terminal {
            Some(Terminal::Failed(e)) => Ok(Step::Fault(e.clone())),
            Some(Terminal::Completed) => Ok(Step::Done),
            None => Ok(Step::NotReady),
        }
    }

    /// Consume the next emission for `id`, suspending while caught up.
    ///
    /// Returns `Ok(None)` when the buffer completed and this reader drained
    /// it; returns the in-band error once the reader reaches the marker, and
    /// keeps returning it on subsequent reads.
    pub async fn read(&self, id: ReaderId) -> Result<Option<Emission<T>>, BufferError>
    where
        T: Clone,
    {
        loop {
            let wait = self.on_write.wait();
            tokio::pin!(wait);
            wait.as_mut().enable();
            match self.step(id, true)? {
                Step::Value(e) => return Ok(Some(e)),
                Step::Done => return Ok(None),
                Step::Fault(e) => return Err(BufferError::Faulted(e)),
                Step::NotReady => {}
            }
            wait.await;
        }
    }

    /// Consume the next emission if one is buffered right now.
    pub fn try_read(&self, id: ReaderId) -> crate::source::TryPulled<T>
    where
        T: Clone,
    {
        use crate::source::TryPulled;
        match self.step(id, true) {
            Ok(Step::Value(e)) => TryPulled::Ready(e),
            Ok(Step::Done) => TryPulled::Done,
            Ok(Step::Fault(e)) => TryPulled::Failed(e),
            Ok(Step::NotReady) => TryPulled::Pending,
            Err(e) => TryPulled::Failed(e.into()),
        }
    }

    /// Look at the next emission without consuming it.
    pub fn peek(&self, id: ReaderId) -> Result<Peeked<T>, BufferError>
    where
        T: Clone,
    {
        match self.step(id, false)? {
            Step::Value(e) => Ok(Peeked::Value(e)),
            Step::Done => Ok(Peeked::Done),
            Step::Fault(e) => Err(BufferError::Faulted(e)),
            Step::NotReady => Ok(Peeked::NotReady),
        }
    }

    /// Whether `id` has drained a completed buffer.
    pub fn completed(&self, id: ReaderId) -> Result<bool, BufferError> {
        let w = self.window();
        let s = w.readers.get(&id).ok_or(BufferError::UnknownReader(id))?;
        let latest_pending = s.needs_current && !matches!(w.latest, Latest::Empty);
        Ok(matches!(w.terminal, Some(Terminal::Completed)) && s.pos >= w.written && !latest_pending)
    }

    /// Number of currently attached readers.
    pub fn reader_count(&self) -> usize {
        self.window().readers.len()
    }

    /// Number of values currently retained.
    pub fn len(&self) -> usize {
        self.window().slots.len()
    }

    /// Whether the retained window is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::flush;

    fn e(v: i32) -> Emission<i32> {
        Emission::traced(v)
    }

    #[tokio::test]
    async fn subject_write_without_readers_is_a_no_op() {
        let buf = CyclicBuffer::subject();
        buf.write_now(e(1)).unwrap();
        assert_eq!(buf.len(), 0);
        let r = buf.attach_reader();
        buf.write_now(e(2)).unwrap();
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 2);
    }

    #[tokio::test]
    async fn subject_prunes_consumed_slots() {
        let buf = CyclicBuffer::subject();
        let r = buf.attach_reader();
        buf.write_now(e(1)).unwrap();
        buf.write_now(e(2)).unwrap();
        assert_eq!(buf.len(), 2);
        buf.read(r).await.unwrap();
        assert_eq!(buf.len(), 1);
        buf.detach_reader(r);
        assert_eq!(buf.len(), 0);
    }

    #[tokio::test]
    async fn readers_drain_values_written_before_an_error() {
        let buf = CyclicBuffer::subject();
        let r = buf.attach_reader();
        buf.write_now(e(1)).unwrap();
        buf.error(StreamError::coerce("boom")).unwrap();
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 1);
        assert!(matches!(
            buf.read(r).await,
            Err(BufferError::Faulted(StreamError::Coerced(_)))
        ));
        // The error is sticky.
        assert!(buf.read(r).await.is_err());
        assert!(matches!(
            buf.write_now(e(2)),
            Err(BufferError::WriteAfterError)
        ));
        // Complete after error is a no-op.
        assert!(buf.complete().is_ok());
    }

    #[tokio::test]
    async fn behavior_serves_latest_on_attach() {
        let buf = CyclicBuffer::behavior(Some(0));
        let a = buf.attach_reader();
        assert_eq!(buf.read(a).await.unwrap().unwrap().value, 0);
        buf.write_now(e(1)).unwrap();
        let b = buf.attach_reader();
        assert_eq!(buf.read(b).await.unwrap().unwrap().value, 1);
        assert_eq!(buf.read(a).await.unwrap().unwrap().value, 1);
        buf.write_now(e(2)).unwrap();
        buf.complete().unwrap();
        assert_eq!(buf.read(a).await.unwrap().unwrap().value, 2);
        assert_eq!(buf.read(b).await.unwrap().unwrap().value, 2);
        assert!(buf.read(a).await.unwrap().is_none());
        assert!(buf.completed(a).unwrap());
    }

    #[tokio::test]
    async fn behavior_error_becomes_the_current_value() {
        let buf = CyclicBuffer::behavior(Some(0));
        buf.error(StreamError::coerce("down")).unwrap();
        let r = buf.attach_reader();
        assert!(matches!(buf.read(r).await, Err(BufferError::Faulted(_))));
    }

    #[tokio::test]
    async fn replay_attach_sees_retained_window() {
        let buf = CyclicBuffer::replay(Some(2));
        buf.write(e(1)).await.unwrap();
        buf.write(e(2)).await.unwrap();
        buf.write(e(3)).await.unwrap();
        let r = buf.attach_reader();
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 2);
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 3);
    }

    #[tokio::test]
    async fn bounded_replay_write_blocks_until_a_reader_advances() {
        let buf = Arc::new(CyclicBuffer::replay(Some(2)));
        let r = buf.attach_reader();
        buf.write(e(1)).await.unwrap();
        buf.write(e(2)).await.unwrap();
        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.write(Emission::traced(3)).await })
        };
        flush().await;
        assert!(!writer.is_finished());
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 1);
        writer.await.unwrap().unwrap();
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 2);
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 3);
    }

    #[tokio::test]
    async fn replay_without_readers_never_blocks() {
        let buf = CyclicBuffer::replay(Some(2));
        for i in 0..16 {
            buf.write(e(i)).await.unwrap();
        }
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn complete_releases_a_stalled_writer() {
        let buf = Arc::new(CyclicBuffer::replay(Some(1)));
        let _r = buf.attach_reader();
        buf.write(e(1)).await.unwrap();
        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.write(Emission::traced(2)).await })
        };
        flush().await;
        assert!(!writer.is_finished());
        buf.complete().unwrap();
        assert!(matches!(
            writer.await.unwrap(),
            Err(BufferError::WriteAfterComplete)
        ));
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let buf = CyclicBuffer::subject();
        let r = buf.attach_reader();
        buf.write_now(e(5)).unwrap();
        assert!(matches!(buf.peek(r).unwrap(), Peeked::Value(ref em) if em.value == 5));
        assert!(matches!(buf.peek(r).unwrap(), Peeked::Value(ref em) if em.value == 5));
        assert_eq!(buf.read(r).await.unwrap().unwrap().value, 5);
        assert!(matches!(buf.peek(r).unwrap(), Peeked::NotReady));
    }
}
