#![deny(missing_docs)]
//! # rill-core — the streaming substrate
//!
//! This crate is the foundation the rest of the rill workspace builds on.
//! It defines the pull protocol every pipeline stage speaks, the multi-reader
//! buffer family behind subjects, and flow/pipe composition.
//!
//! ## Layers
//!
//! | Module | What it provides |
//! |--------|------------------|
//! | [`sync`] | FIFO mutex, counting gate, notifier |
//! | [`buffer`] | [`CyclicBuffer`] — plain, behavior, and replay fan-out |
//! | [`stamp`] | monotonic emission stamps and the cooperative [`flush`] point |
//! | [`source`] | the [`EventSource`] pull protocol |
//! | [`meta`] | sideband lineage: [`Emission`], [`ValueMeta`], [`Tagged`] |
//! | [`flow`] | [`Flow`], [`Operator`], pipe composition, subscriptions |
//! | [`subject`] | [`Subject`], [`BehaviorSubject`], [`ReplaySubject`] |
//! | [`trace_hook`] | the [`TraceHook`] observation seam and its global slot |
//!
//! ## Design Principle
//!
//! Every seam is operation-defined, not mechanism-defined. `EventSource::pull`
//! means "produce the next emission of this stage" — not "read a channel" or
//! "await a timer". That is what lets a subject reader, an operator wrapper,
//! and a worker-pool lease all compose behind the same boxed trait.

pub mod buffer;
pub mod error;
pub mod flow;
pub mod id;
pub mod meta;
pub mod source;
pub mod stamp;
pub mod subject;
pub mod sync;
pub mod trace_hook;

#[cfg(feature = "test-utils")]
pub mod test_utils;

// Re-exports for convenience
pub use buffer::{CyclicBuffer, Peeked};
pub use error::{BufferError, StreamError};
pub use flow::{Flow, Observer, OpCx, Operator, PipeCx, Subscription};
pub use id::{ReaderId, StreamId, SubscriptionId, ValueId, WorkerId};
pub use meta::{Emission, MetaKind, Tagged, ValueMeta};
pub use source::{BoxSource, EventSource, Pulled, TryPulled};
pub use stamp::{EmissionStamp, flush};
pub use subject::{BehaviorSubject, ReplaySubject, Subject};
pub use sync::{FairMutex, Gate, GateClosed, GatePermit, Notifier};
pub use trace_hook::{StepOutcome, TraceHook, clear_tracer, current_tracer, install_tracer};
