//! Trace records and their exported views.

use rill_core::{StepOutcome, StreamId, SubscriptionId, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch — the tracer's stable wire format for
/// points in time.
pub type TimestampMs = u64;

/// The current wall clock as [`TimestampMs`].
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle phase of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Still moving through the pipeline.
    Active,
    /// Reached a subscriber's `on_next`.
    Delivered,
    /// Will receive no further operator transitions.
    Terminal,
}

/// Why a trace became terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// An operator dropped the value.
    Filtered,
    /// The value was folded into another value's output.
    Collapsed,
    /// An operator failed on the value.
    Errored,
    /// An operation arrived after the subscription completed.
    Late,
}

/// One operator transition in a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorStep {
    /// Position of the operator in the chain.
    pub operator_index: usize,
    /// The operator's name.
    pub operator_name: String,
    /// When the value entered the operator.
    pub entered_at: TimestampMs,
    /// When the value left, once it did.
    pub exited_at: Option<TimestampMs>,
    /// The value as it entered, rendered for display.
    pub input_value: String,
    /// The value as it left, when the operator produced one.
    pub output_value: Option<String>,
    /// How the step ended.
    pub outcome: Option<StepOutcome>,
    /// The failure, for errored steps.
    pub error: Option<String>,
}

impl OperatorStep {
    pub(crate) fn open(
        operator_index: usize,
        operator_name: &str,
        input_value: String,
        at: TimestampMs,
    ) -> Self {
        Self {
            operator_index,
            operator_name: operator_name.to_owned(),
            entered_at: at,
            exited_at: None,
            input_value,
            output_value: None,
            outcome: None,
            error: None,
        }
    }
}

/// Fan-out provenance: which operator expanded which base value into this
/// child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandedFrom {
    /// The expanding operator's position.
    pub operator_index: usize,
    /// The expanding operator's name.
    pub operator_name: String,
    /// The outer value this child derives from.
    pub base_value_id: ValueId,
}

/// Fan-in destination: which operator folded this value into which target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollapsedInto {
    /// The collapsing operator's position.
    pub operator_index: usize,
    /// The collapsing operator's name.
    pub operator_name: String,
    /// The value that carries the folded output.
    pub target_value_id: ValueId,
}

/// Everything the tracer knows about one value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// The value's identity.
    pub value_id: ValueId,
    /// The flow that produced it.
    pub stream_id: StreamId,
    /// The flow's display name.
    pub stream_name: String,
    /// The subscription run it belongs to.
    pub subscription_id: SubscriptionId,
    /// When the source produced the value.
    pub emitted_at: TimestampMs,
    /// When it reached the subscriber, if it did.
    pub delivered_at: Option<TimestampMs>,
    /// Lifecycle phase.
    pub status: TraceStatus,
    /// Set exactly when `status` is terminal.
    pub terminal_reason: Option<TerminalReason>,
    /// The value as produced, rendered for display.
    pub source_value: String,
    /// The value as last output by an operator.
    pub final_value: Option<String>,
    /// The parent trace for expansion children.
    pub parent_trace_id: Option<ValueId>,
    /// Fan-out provenance for expansion children.
    pub expanded_from: Option<ExpandedFrom>,
    /// Fan-in destination for collapsed values.
    pub collapsed_into: Option<CollapsedInto>,
    /// Ordered operator transitions.
    pub operator_steps: Vec<OperatorStep>,
    /// Per-operator durations, keyed `"index:name"`, in milliseconds.
    pub operator_durations: HashMap<String, u64>,
    /// Human-readable reason the value never reached the subscriber.
    pub dropped_reason: Option<String>,
    /// Emission-to-delivery duration in milliseconds.
    pub total_duration: Option<u64>,
}

impl TraceRecord {
    pub(crate) fn new(
        value_id: ValueId,
        stream_id: StreamId,
        stream_name: String,
        subscription_id: SubscriptionId,
        source_value: String,
        at: TimestampMs,
    ) -> Self {
        Self {
            value_id,
            stream_id,
            stream_name,
            subscription_id,
            emitted_at: at,
            delivered_at: None,
            status: TraceStatus::Active,
            terminal_reason: None,
            source_value,
            final_value: None,
            parent_trace_id: None,
            expanded_from: None,
            collapsed_into: None,
            operator_steps: Vec::new(),
            operator_durations: HashMap::new(),
            dropped_reason: None,
            total_duration: None,
        }
    }
}

/// Exported state, derived from a record for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    /// Produced, not yet transformed.
    Emitted,
    /// At least one operator transition, still active.
    Transformed,
    /// Terminally dropped by an operator.
    Filtered,
    /// Terminally folded into another value.
    Collapsed,
    /// An active expansion child.
    Expanded,
    /// Terminally failed in an operator.
    Errored,
    /// Reached the subscriber.
    Delivered,
    /// Terminalised after its subscription completed.
    Dropped,
}

/// The exported view of a trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueTrace {
    /// The derived display state.
    pub state: TraceState,
    /// The full record.
    #[serde(flatten)]
    pub record: TraceRecord,
}

impl ValueTrace {
    /// Derive the exported view from a record.
    pub fn export(record: &TraceRecord) -> Self {
        let state = match (record.status, record.terminal_reason) {
            (TraceStatus::Delivered, _) => TraceState::Delivered,
            (TraceStatus::Terminal, Some(TerminalReason::Filtered)) => TraceState::Filtered,
            (TraceStatus::Terminal, Some(TerminalReason::Collapsed)) => TraceState::Collapsed,
            (TraceStatus::Terminal, Some(TerminalReason::Errored)) => TraceState::Errored,
            (TraceStatus::Terminal, Some(TerminalReason::Late)) | (TraceStatus::Terminal, None) => {
                TraceState::Dropped
            }
            (TraceStatus::Active, _) if record.parent_trace_id.is_some() => TraceState::Expanded,
            (TraceStatus::Active, _) if !record.operator_steps.is_empty() => {
                TraceState::Transformed
            }
            (TraceStatus::Active, _) => TraceState::Emitted,
        };
        Self {
            state,
            record: record.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TraceRecord {
        TraceRecord::new(
            ValueId::next(),
            StreamId::next(),
            "test".into(),
            SubscriptionId::next(),
            "1".into(),
            now_ms(),
        )
    }

    #[test]
    fn fresh_records_export_as_emitted() {
        assert_eq!(ValueTrace::export(&record()).state, TraceState::Emitted);
    }

    #[test]
    fn delivery_wins_over_everything_in_the_export() {
        let mut r = record();
        r.status = TraceStatus::Delivered;
        r.operator_steps
            .push(OperatorStep::open(0, "map", "1".into(), now_ms()));
        assert_eq!(ValueTrace::export(&r).state, TraceState::Delivered);
    }

    #[test]
    fn terminal_reasons_map_onto_states() {
        for (reason, state) in [
            (TerminalReason::Filtered, TraceState::Filtered),
            (TerminalReason::Collapsed, TraceState::Collapsed),
            (TerminalReason::Errored, TraceState::Errored),
            (TerminalReason::Late, TraceState::Dropped),
        ] {
            let mut r = record();
            r.status = TraceStatus::Terminal;
            r.terminal_reason = Some(reason);
            assert_eq!(ValueTrace::export(&r).state, state);
        }
    }

    #[test]
    fn active_children_export_as_expanded() {
        let mut r = record();
        r.parent_trace_id = Some(ValueId::next());
        assert_eq!(ValueTrace::export(&r).state, TraceState::Expanded);
    }
}
