#![deny(missing_docs)]
//! # rill — umbrella crate
//!
//! Provides a single import surface for the rill workspace: the streaming
//! substrate (`rill-core`), the combinator library (`rill-ops`), worker-pool
//! leases (`rill-pool`), and the value tracer (`rill-trace`), plus a
//! `prelude` for the happy path.

pub use rill_core;
pub use rill_ops;
pub use rill_pool;
pub use rill_trace;

/// Happy-path imports for composing rill pipelines.
pub mod prelude {
    pub use rill_core::{
        BehaviorSubject, BoxSource, CyclicBuffer, Emission, EmissionStamp, EventSource, Flow,
        MetaKind, Observer, OpCx, Operator, Peeked, PipeCx, Pulled, ReplaySubject, StreamError,
        Subject, Subscription, Tagged, TryPulled, ValueId, ValueMeta, flush,
    };

    pub use rill_ops::{
        Aux, Inner, buffer_until, concat_map, debounce, delay, distinct_until_changed,
        distinct_until_changed_by, distinct_until_key_changed, filter, first, first_matching, map,
        merge_map, reduce, scan, skip_until, switch_map, throttle, try_map, with_latest_from,
        with_latest_from_all,
    };

    pub use rill_pool::{HiredWorker, LocalWorkerPool, PoolError, WorkerPool, hire};

    pub use rill_trace::{
        TraceDetail, TraceState, TracerOptions, ValueTrace, ValueTracer, create_value_tracer,
        disable_tracing, enable_tracing, global_tracer,
    };
}
