#![deny(missing_docs)]
//! # rill-trace — the value tracer
//!
//! Records, for every value a traced pipeline produces, its operator-step
//! history and final fate: delivered to a subscriber, filtered away,
//! collapsed into another value, errored, or dropped late. The visualiser
//! consumes the exported [`ValueTrace`] records; pipelines feed the tracer
//! through the `TraceHook` seam in `rill-core`.
//!
//! The tracer is bounded: traces are kept in insertion order and the oldest
//! is evicted once `max_traces` is reached. A terminal-only detail level
//! skips step and duration bookkeeping for low-overhead production use while
//! preserving all terminal and delivery semantics.

mod record;
mod reducer;
mod tracer;

pub use record::{
    CollapsedInto, ExpandedFrom, OperatorStep, TerminalReason, TimestampMs, TraceRecord,
    TraceState, TraceStatus, ValueTrace, now_ms,
};
pub use reducer::{Reduced, TraceEvent, TraceUpdateKind, reduce};
pub use tracer::{
    TraceDetail, TraceObserver, TraceUpdate, TracerOptions, ValueTracer, create_value_tracer,
    disable_tracing, enable_tracing, global_tracer,
};
