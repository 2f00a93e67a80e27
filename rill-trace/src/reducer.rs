//! The pure transition function of the tracer's state machine.
//!
//! Every mutation of a trace record is expressed as `reduce(record, event)`,
//! which applies the transition and reports which observer events it
//! produced. The tracer owns the map and the lateness check; this module
//! owns the rules.

use crate::record::{
    CollapsedInto, OperatorStep, TerminalReason, TimestampMs, TraceRecord, TraceStatus,
};
use rill_core::StepOutcome;

/// A transition applied to one trace.
#[derive(Debug)]
pub enum TraceEvent {
    /// The value entered an operator.
    EnterOp {
        /// Position of the operator in the chain.
        operator_index: usize,
        /// The operator's name.
        operator_name: String,
        /// The value as it entered, rendered for display.
        input: String,
        /// Transition time.
        at: TimestampMs,
    },
    /// The value left an operator.
    ExitOp {
        /// Position of the operator in the chain.
        operator_index: usize,
        /// The operator's name.
        operator_name: String,
        /// How the step ended.
        outcome: StepOutcome,
        /// The produced output, when there is one.
        output: Option<String>,
        /// The failure, for errored steps.
        error: Option<String>,
        /// Transition time.
        at: TimestampMs,
    },
    /// The trace will receive no further operator transitions.
    Terminalize {
        /// Why.
        reason: TerminalReason,
        /// Fan-in destination, for collapse victims.
        collapsed_into: Option<CollapsedInto>,
        /// Transition time.
        at: TimestampMs,
    },
    /// The value reached the subscriber.
    Deliver {
        /// Transition time.
        at: TimestampMs,
    },
}

/// What a reduction tells the surrounding tracer to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceUpdateKind {
    /// The trace changed without settling its fate.
    Updated,
    /// The value was terminally filtered.
    Filtered,
    /// The value was terminally collapsed.
    Collapsed,
    /// The value was dropped (errored or late).
    Dropped,
    /// The value was delivered.
    Delivered,
}

/// Result of one reduction.
#[derive(Debug)]
pub struct Reduced {
    /// Observer events to announce, in order.
    pub emits: Vec<TraceUpdateKind>,
    /// The step this transition touched, if step tracking is on.
    pub last_step: Option<OperatorStep>,
}

impl Reduced {
    fn none() -> Self {
        Self {
            emits: Vec::new(),
            last_step: None,
        }
    }

    fn one(kind: TraceUpdateKind, last_step: Option<OperatorStep>) -> Self {
        Self {
            emits: vec![kind],
            last_step,
        }
    }
}

fn close_open_steps(record: &mut TraceRecord, at: TimestampMs) {
    for step in record.operator_steps.iter_mut() {
        if step.exited_at.is_none() {
            step.exited_at = Some(at);
        }
    }
}

fn record_duration(record: &mut TraceRecord, step: &OperatorStep) {
    if let Some(exited) = step.exited_at {
        let key = format!("{}:{}", step.operator_index, step.operator_name);
        let elapsed = exited.saturating_sub(step.entered_at);
        *record.operator_durations.entry(key).or_insert(0) += elapsed;
    }
}

/// Apply one event to one record.
///
/// `track_steps` is false for the terminal-only tracer variant: step and
/// duration bookkeeping is skipped while terminal and delivery transitions
/// apply unchanged.
pub fn reduce(record: &mut TraceRecord, event: TraceEvent, track_steps: bool) -> Reduced {
    match event {
        TraceEvent::EnterOp {
            operator_index,
            operator_name,
            input,
            at,
        } => {
            if record.status != TraceStatus::Active || !track_steps {
                return Reduced::none();
            }
            let step = OperatorStep::open(operator_index, &operator_name, input, at);
            record.operator_steps.push(step.clone());
            Reduced::one(TraceUpdateKind::Updated, Some(step))
        }

        TraceEvent::ExitOp {
            operator_index,
            operator_name,
            outcome,
            output,
            error,
            at,
        } => {
            if record.status != TraceStatus::Active {
                return Reduced::none();
            }
            let last_step = if track_steps {
                // Close the matching open step; synthesize one when the
                // operator reported an exit without an enter.
                let idx = record
                    .operator_steps
                    .iter()
                    .rposition(|s| s.exited_at.is_none() && s.operator_index == operator_index);
                let idx = match idx {
                    Some(idx) => idx,
                    None => {
                        let input = output.clone().unwrap_or_default();
                        record.operator_steps.push(OperatorStep::open(
                            operator_index,
                            &operator_name,
                            input,
                            at,
                        ));
                        record.operator_steps.len() - 1
                    }
                };
                let step = &mut record.operator_steps[idx];
                step.exited_at = Some(at);
                step.outcome = Some(outcome);
                step.output_value = output.clone();
                step.error = error.clone();
                let step = step.clone();
                record_duration(record, &step);
                Some(step)
            } else {
                None
            };
            if let Some(out) = output {
                record.final_value = Some(out);
            }
            match outcome {
                StepOutcome::Filtered => {
                    close_open_steps(record, at);
                    record.status = TraceStatus::Terminal;
                    record.terminal_reason = Some(TerminalReason::Filtered);
                    record.dropped_reason = Some(format!("filtered by {operator_name}"));
                    Reduced::one(TraceUpdateKind::Filtered, last_step)
                }
                StepOutcome::Errored => {
                    close_open_steps(record, at);
                    record.status = TraceStatus::Terminal;
                    record.terminal_reason = Some(TerminalReason::Errored);
                    record.dropped_reason =
                        error.or_else(|| Some(format!("errored in {operator_name}")));
                    Reduced::one(TraceUpdateKind::Dropped, last_step)
                }
                // Transformed output, an expansion origin, or a collapse
                // carrier: the trace stays active.
                StepOutcome::Transformed | StepOutcome::Expanded | StepOutcome::Collapsed => {
                    Reduced::one(TraceUpdateKind::Updated, last_step)
                }
            }
        }

        TraceEvent::Terminalize {
            reason,
            collapsed_into,
            at,
        } => {
            if record.status != TraceStatus::Active {
                return Reduced::none();
            }
            close_open_steps(record, at);
            record.status = TraceStatus::Terminal;
            record.terminal_reason = Some(reason);
            if let Some(target) = collapsed_into {
                record.dropped_reason = Some(format!(
                    "collapsed into {} by {}",
                    target.target_value_id, target.operator_name
                ));
                record.collapsed_into = Some(target);
            } else if reason == TerminalReason::Late {
                record.dropped_reason = Some("subscription already completed".into());
            }
            let kind = match reason {
                TerminalReason::Filtered => TraceUpdateKind::Filtered,
                TerminalReason::Collapsed => TraceUpdateKind::Collapsed,
                TerminalReason::Errored | TerminalReason::Late => TraceUpdateKind::Dropped,
            };
            Reduced::one(kind, None)
        }

        TraceEvent::Deliver { at } => {
            if record.status == TraceStatus::Delivered {
                return Reduced::none();
            }
            close_open_steps(record, at);
            record.status = TraceStatus::Delivered;
            record.delivered_at = Some(at);
            record.total_duration = Some(at.saturating_sub(record.emitted_at));
            // A delivery beats an earlier terminal marker: the value did
            // reach the subscriber.
            record.terminal_reason = None;
            record.dropped_reason = None;
            Reduced::one(TraceUpdateKind::Delivered, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{StreamId, SubscriptionId, ValueId};

    fn record() -> TraceRecord {
        TraceRecord::new(
            ValueId::next(),
            StreamId::next(),
            "test".into(),
            SubscriptionId::next(),
            "1".into(),
            10,
        )
    }

    fn enter(at: TimestampMs) -> TraceEvent {
        TraceEvent::EnterOp {
            operator_index: 0,
            operator_name: "map".into(),
            input: "1".into(),
            at,
        }
    }

    fn exit(outcome: StepOutcome, at: TimestampMs) -> TraceEvent {
        TraceEvent::ExitOp {
            operator_index: 0,
            operator_name: "map".into(),
            outcome,
            output: Some("2".into()),
            error: None,
            at,
        }
    }

    #[test]
    fn enter_then_exit_records_a_closed_step_and_duration() {
        let mut r = record();
        reduce(&mut r, enter(10), true);
        let reduced = reduce(&mut r, exit(StepOutcome::Transformed, 25), true);
        assert_eq!(reduced.emits, vec![TraceUpdateKind::Updated]);
        assert_eq!(r.operator_steps.len(), 1);
        assert_eq!(r.operator_steps[0].exited_at, Some(25));
        assert_eq!(r.operator_durations.get("0:map"), Some(&15));
        assert_eq!(r.final_value.as_deref(), Some("2"));
        assert_eq!(r.status, TraceStatus::Active);
    }

    #[test]
    fn filtered_exit_terminalises_the_trace() {
        let mut r = record();
        reduce(&mut r, enter(10), true);
        let reduced = reduce(&mut r, exit(StepOutcome::Filtered, 12), true);
        assert_eq!(reduced.emits, vec![TraceUpdateKind::Filtered]);
        assert_eq!(r.status, TraceStatus::Terminal);
        assert_eq!(r.terminal_reason, Some(TerminalReason::Filtered));
        assert!(r.dropped_reason.is_some());
    }

    #[test]
    fn delivery_beats_an_earlier_filtered_marker() {
        let mut r = record();
        reduce(&mut r, enter(10), true);
        reduce(&mut r, exit(StepOutcome::Filtered, 12), true);
        let reduced = reduce(&mut r, TraceEvent::Deliver { at: 20 }, true);
        assert_eq!(reduced.emits, vec![TraceUpdateKind::Delivered]);
        assert_eq!(r.status, TraceStatus::Delivered);
        assert_eq!(r.terminal_reason, None);
        assert_eq!(r.total_duration, Some(10));
    }

    #[test]
    fn operations_on_terminal_traces_are_ignored() {
        let mut r = record();
        reduce(
            &mut r,
            TraceEvent::Terminalize {
                reason: TerminalReason::Late,
                collapsed_into: None,
                at: 11,
            },
            true,
        );
        let reduced = reduce(&mut r, enter(12), true);
        assert!(reduced.emits.is_empty());
        assert!(r.operator_steps.is_empty());
    }

    #[test]
    fn terminal_only_mode_keeps_fate_but_not_steps() {
        let mut r = record();
        reduce(&mut r, enter(10), false);
        let reduced = reduce(&mut r, exit(StepOutcome::Filtered, 12), false);
        assert_eq!(reduced.emits, vec![TraceUpdateKind::Filtered]);
        assert!(r.operator_steps.is_empty());
        assert!(r.operator_durations.is_empty());
        assert_eq!(r.status, TraceStatus::Terminal);
    }

    #[test]
    fn double_delivery_is_a_no_op() {
        let mut r = record();
        reduce(&mut r, TraceEvent::Deliver { at: 20 }, true);
        let reduced = reduce(&mut r, TraceEvent::Deliver { at: 30 }, true);
        assert!(reduced.emits.is_empty());
        assert_eq!(r.delivered_at, Some(20));
    }
}
