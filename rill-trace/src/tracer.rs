//! The tracer: trace map, observers, LRU bound, and the global slot.

use crate::record::{
    CollapsedInto, ExpandedFrom, OperatorStep, TerminalReason, TraceRecord, ValueTrace, now_ms,
};
use crate::reducer::{Reduced, TraceEvent, TraceUpdateKind, reduce};
use rill_core::{StepOutcome, StreamId, SubscriptionId, TraceHook, ValueId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

/// How much a tracer records per trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceDetail {
    /// Full operator-step history and durations.
    #[default]
    Full,
    /// Terminal and delivery transitions only; no steps, no durations.
    /// The low-overhead variant for production use.
    TerminalOnly,
}

/// Callback invoked on every trace update, with the exported view.
pub type OnTraceUpdate = Arc<dyn Fn(&ValueTrace, Option<&OperatorStep>) + Send + Sync>;

/// Tracer configuration.
#[derive(Clone, Default)]
pub struct TracerOptions {
    /// Bound on retained traces; the oldest is evicted past it.
    /// `None` uses the default of 5000.
    pub max_traces: Option<usize>,
    /// Recording detail.
    pub detail: TraceDetail,
    /// Whether expansion children may reach `delivered` state.
    /// Defaults to true.
    pub deliver_expanded_children: Option<bool>,
    /// Direct per-update callback, next to the observer registry.
    pub on_trace_update: Option<OnTraceUpdate>,
}

impl std::fmt::Debug for TracerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerOptions")
            .field("max_traces", &self.max_traces)
            .field("detail", &self.detail)
            .field("deliver_expanded_children", &self.deliver_expanded_children)
            .finish_non_exhaustive()
    }
}

const DEFAULT_MAX_TRACES: usize = 5000;

/// One announced change to a trace.
#[derive(Debug, Clone)]
pub struct TraceUpdate {
    /// What happened.
    pub kind: TraceUpdateKind,
    /// The trace after the transition.
    pub trace: ValueTrace,
    /// The operator step the transition touched, when steps are tracked.
    pub last_step: Option<OperatorStep>,
}

/// Receives trace updates. Callbacks run synchronously on the pipeline's
/// cooperative step; keep them fast.
pub trait TraceObserver: Send + Sync {
    /// A trace changed.
    fn on_trace(&self, update: &TraceUpdate);
}

impl<F> TraceObserver for F
where
    F: Fn(&TraceUpdate) + Send + Sync,
{
    fn on_trace(&self, update: &TraceUpdate) {
        self(update)
    }
}

struct TracerInner {
    traces: HashMap<ValueId, TraceRecord>,
    /// Insertion order, oldest first, for the LRU bound.
    order: VecDeque<ValueId>,
    completed_subscriptions: HashSet<SubscriptionId>,
}

/// Records the life of every value a traced pipeline produces.
pub struct ValueTracer {
    max_traces: usize,
    detail: TraceDetail,
    deliver_expanded_children: bool,
    on_trace_update: Option<OnTraceUpdate>,
    inner: Mutex<TracerInner>,
    observers: Mutex<Vec<Arc<dyn TraceObserver>>>,
    subscription_observers: Mutex<HashMap<SubscriptionId, Vec<Arc<dyn TraceObserver>>>>,
}

impl std::fmt::Debug for ValueTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueTracer")
            .field("max_traces", &self.max_traces)
            .field("detail", &self.detail)
            .finish_non_exhaustive()
    }
}

/// Create a tracer. Convenience over [`ValueTracer::new`] mirroring the
/// factory-function surface of the rest of the workspace.
pub fn create_value_tracer(options: TracerOptions) -> Arc<ValueTracer> {
    Arc::new(ValueTracer::new(options))
}

impl ValueTracer {
    /// Create a tracer from options.
    pub fn new(options: TracerOptions) -> Self {
        Self {
            max_traces: options.max_traces.unwrap_or(DEFAULT_MAX_TRACES),
            detail: options.detail,
            deliver_expanded_children: options.deliver_expanded_children.unwrap_or(true),
            on_trace_update: options.on_trace_update,
            inner: Mutex::new(TracerInner {
                traces: HashMap::new(),
                order: VecDeque::new(),
                completed_subscriptions: HashSet::new(),
            }),
            observers: Mutex::new(Vec::new()),
            subscription_observers: Mutex::new(HashMap::new()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, TracerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer for every subscription.
    pub fn subscribe(&self, observer: Arc<dyn TraceObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Register an observer scoped to one subscription.
    pub fn observe_subscription(
        &self,
        subscription: SubscriptionId,
        observer: Arc<dyn TraceObserver>,
    ) {
        self.subscription_observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subscription)
            .or_default()
            .push(observer);
    }

    /// Every retained trace, oldest first, as exported views.
    pub fn get_all_traces(&self) -> Vec<ValueTrace> {
        let inner = self.inner();
        inner
            .order
            .iter()
            .filter_map(|id| inner.traces.get(id))
            .map(ValueTrace::export)
            .collect()
    }

    /// One trace by value id.
    pub fn get_trace(&self, value: ValueId) -> Option<ValueTrace> {
        self.inner().traces.get(&value).map(ValueTrace::export)
    }

    /// Record an operator failure on a trace. Shorthand for an errored
    /// operator exit.
    pub fn error_in_operator(
        &self,
        value: ValueId,
        operator_index: usize,
        operator_name: &str,
        error: &str,
    ) {
        self.exit_operator(
            value,
            operator_index,
            operator_name,
            StepOutcome::Errored,
            None,
            Some(error.to_owned()),
        );
    }

    /// Drop every retained trace and completed-subscription marker.
    pub fn clear(&self) {
        let mut inner = self.inner();
        inner.traces.clear();
        inner.order.clear();
        inner.completed_subscriptions.clear();
    }

    fn insert(&self, record: TraceRecord) {
        let mut inner = self.inner();
        if inner.traces.len() >= self.max_traces {
            if let Some(oldest) = inner.order.pop_front() {
                inner.traces.remove(&oldest);
                tracing::debug!(evicted = oldest.get(), "trace evicted at capacity");
            }
        }
        inner.order.push_back(record.value_id);
        inner.traces.insert(record.value_id, record);
    }

    /// Apply an event to a trace, converting it to a late terminalisation
    /// when the trace's subscription has already completed.
    fn apply(&self, value: ValueId, event: TraceEvent) {
        let (update, subscription) = {
            let mut inner = self.inner();
            let late = inner
                .traces
                .get(&value)
                .is_some_and(|t| inner.completed_subscriptions.contains(&t.subscription_id));
            let event = if late {
                TraceEvent::Terminalize {
                    reason: TerminalReason::Late,
                    collapsed_into: None,
                    at: now_ms(),
                }
            } else {
                event
            };
            let track_steps = self.detail == TraceDetail::Full;
            let Some(record) = inner.traces.get_mut(&value) else {
                return;
            };
            let Reduced { emits, last_step } = reduce(record, event, track_steps);
            match emits.into_iter().next() {
                Some(kind) => (
                    TraceUpdate {
                        kind,
                        trace: ValueTrace::export(record),
                        last_step,
                    },
                    record.subscription_id,
                ),
                None => return,
            }
        };
        self.announce(&update, subscription);
    }

    fn announce(&self, update: &TraceUpdate, subscription: SubscriptionId) {
        if let Some(callback) = &self.on_trace_update {
            callback(&update.trace, update.last_step.as_ref());
        }
        for observer in self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            observer.on_trace(update);
        }
        let scoped = self
            .subscription_observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(observers) = scoped.get(&subscription) {
            for observer in observers {
                observer.on_trace(update);
            }
        }
    }
}

impl TraceHook for ValueTracer {
    fn start_trace(
        &self,
        value: ValueId,
        stream: StreamId,
        stream_name: &str,
        subscription: SubscriptionId,
        source_value: String,
    ) {
        if self.inner().completed_subscriptions.contains(&subscription) {
            return;
        }
        self.insert(TraceRecord::new(
            value,
            stream,
            stream_name.to_owned(),
            subscription,
            source_value,
            now_ms(),
        ));
    }

    fn create_expanded_trace(
        &self,
        child: ValueId,
        parent: ValueId,
        operator_index: usize,
        operator_name: &str,
        value: String,
    ) {
        let (stream, stream_name, subscription) = {
            let inner = self.inner();
            match inner.traces.get(&parent) {
                Some(p) => (p.stream_id, p.stream_name.clone(), p.subscription_id),
                None => return,
            }
        };
        let mut record = TraceRecord::new(
            child,
            stream,
            stream_name,
            subscription,
            value,
            now_ms(),
        );
        record.parent_trace_id = Some(parent);
        record.expanded_from = Some(ExpandedFrom {
            operator_index,
            operator_name: operator_name.to_owned(),
            base_value_id: parent,
        });
        self.insert(record);
    }

    fn enter_operator(
        &self,
        value: ValueId,
        operator_index: usize,
        operator_name: &str,
        input: String,
    ) {
        self.apply(
            value,
            TraceEvent::EnterOp {
                operator_index,
                operator_name: operator_name.to_owned(),
                input,
                at: now_ms(),
            },
        );
    }

    fn exit_operator(
        &self,
        value: ValueId,
        operator_index: usize,
        operator_name: &str,
        outcome: StepOutcome,
        output: Option<String>,
        error: Option<String>,
    ) {
        self.apply(
            value,
            TraceEvent::ExitOp {
                operator_index,
                operator_name: operator_name.to_owned(),
                outcome,
                output,
                error,
                at: now_ms(),
            },
        );
    }

    fn collapse_value(
        &self,
        victim: ValueId,
        target: ValueId,
        operator_index: usize,
        operator_name: &str,
    ) {
        self.apply(
            victim,
            TraceEvent::Terminalize {
                reason: TerminalReason::Collapsed,
                collapsed_into: Some(CollapsedInto {
                    operator_index,
                    operator_name: operator_name.to_owned(),
                    target_value_id: target,
                }),
                at: now_ms(),
            },
        );
    }

    fn mark_delivered(&self, value: ValueId, _subscription: SubscriptionId) {
        if !self.deliver_expanded_children {
            let is_child = self
                .inner()
                .traces
                .get(&value)
                .is_some_and(|t| t.parent_trace_id.is_some());
            if is_child {
                return;
            }
        }
        self.apply(value, TraceEvent::Deliver { at: now_ms() });
    }

    fn complete_subscription(&self, subscription: SubscriptionId) {
        self.inner().completed_subscriptions.insert(subscription);
    }
}

// --- Global slot ---

fn global_slot() -> &'static RwLock<Option<Arc<ValueTracer>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<ValueTracer>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Install `tracer` as the process-wide tracer; freshly subscribed pipelines
/// pick it up.
pub fn enable_tracing(tracer: Arc<ValueTracer>) {
    if let Ok(mut slot) = global_slot().write() {
        *slot = Some(tracer.clone());
    }
    rill_core::install_tracer(tracer);
}

/// Remove the process-wide tracer. Running subscriptions keep the handle
/// they started with.
pub fn disable_tracing() {
    if let Ok(mut slot) = global_slot().write() {
        *slot = None;
    }
    rill_core::clear_tracer();
}

/// The process-wide tracer, if one is installed.
pub fn global_tracer() -> Option<Arc<ValueTracer>> {
    global_slot().read().ok().and_then(|slot| slot.clone())
}
