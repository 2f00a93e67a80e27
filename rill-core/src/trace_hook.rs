//! The observation seam between pipelines and the value tracer.
//!
//! This crate owns the trait; the tracer crate implements it. Pipelines fire
//! these hooks as values move through operators. The hooks record and never
//! fail — a tracer must not be able to break a pipeline.
//!
//! The process-wide slot ([`install_tracer`] / [`clear_tracer`]) exists for
//! the observability cut where threading a handle through every subscription
//! would be invasive; freshly instantiated pipelines read it once at
//! subscribe time.

use crate::id::{StreamId, SubscriptionId, ValueId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, RwLock};

/// Outcome of one operator step, as reported by combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The operator produced one output from this input.
    Transformed,
    /// The operator dropped this input.
    Filtered,
    /// This input was folded into another value's output.
    Collapsed,
    /// The operator fanned this input out into several outputs.
    Expanded,
    /// The operator failed on this input.
    Errored,
}

/// Observation hooks fired by pipelines. Implemented by the tracer.
///
/// Values cross this boundary pre-rendered as `Debug` strings: the hooks are
/// dyn seams and the tracer stores display forms, not live values.
pub trait TraceHook: Send + Sync {
    /// A source produced a value.
    fn start_trace(
        &self,
        value: ValueId,
        stream: StreamId,
        stream_name: &str,
        subscription: SubscriptionId,
        source_value: String,
    );

    /// A fan-out operator derived a child value from `parent`.
    fn create_expanded_trace(
        &self,
        child: ValueId,
        parent: ValueId,
        operator_index: usize,
        operator_name: &str,
        value: String,
    );

    /// A value entered an operator.
    fn enter_operator(
        &self,
        value: ValueId,
        operator_index: usize,
        operator_name: &str,
        input: String,
    );

    /// A value left an operator with the given outcome.
    fn exit_operator(
        &self,
        value: ValueId,
        operator_index: usize,
        operator_name: &str,
        outcome: StepOutcome,
        output: Option<String>,
        error: Option<String>,
    );

    /// A fan-in operator folded `victim` into `target`'s output.
    fn collapse_value(
        &self,
        victim: ValueId,
        target: ValueId,
        operator_index: usize,
        operator_name: &str,
    );

    /// A value reached a subscriber's `on_next`.
    fn mark_delivered(&self, value: ValueId, subscription: SubscriptionId);

    /// A subscription finished; later operations on its traces are late.
    fn complete_subscription(&self, subscription: SubscriptionId);
}

fn slot() -> &'static RwLock<Option<Arc<dyn TraceHook>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<dyn TraceHook>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Install a tracer into the process-wide slot.
pub fn install_tracer(hook: Arc<dyn TraceHook>) {
    if let Ok(mut slot) = slot().write() {
        *slot = Some(hook);
    }
}

/// Clear the process-wide slot.
pub fn clear_tracer() {
    if let Ok(mut slot) = slot().write() {
        *slot = None;
    }
}

/// The currently installed tracer, if any.
pub fn current_tracer() -> Option<Arc<dyn TraceHook>> {
    slot().read().ok().and_then(|s| s.clone())
}
