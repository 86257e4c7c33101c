//! Typed event emitters for the produced stream.
//!
//! Each decision artifact gets exactly one structured record on the shared
//! envelope. Emission is append-only and fire-and-forget: the decision path
//! never blocks on, or fails because of, the event stream.

use serde_json::json;

use crate::displace::DisplacementEvaluation;
use crate::logging::{log, obj, v_num, v_str, Level, Subsystem};
use crate::positions::{ClosedPosition, Position};
use crate::shadow::ShadowScoreboard;
use crate::trace::{DecisionTrace, Outcome};

/// One per candidate per cycle, entered or blocked.
pub fn trade_intent(trace: &DecisionTrace) {
    log(
        Level::Info,
        Subsystem::Trace,
        "trade_intent",
        obj(&[
            ("intent_id", v_str(&trace.intent_id)),
            ("cycle_id", json!(trace.cycle_id)),
            ("symbol", v_str(&trace.symbol)),
            ("side", trace.side.map(|s| v_str(s.as_str())).unwrap_or(serde_json::Value::Null)),
            ("composite_score", v_num(trace.composite_score)),
            ("outcome", v_str(trace.final_decision.outcome.as_str())),
            ("primary_reason", v_str(&trace.final_decision.primary_reason)),
            (
                "secondary_reasons",
                json!(trace.final_decision.secondary_reasons),
            ),
            ("gates", serde_json::to_value(&trace.gates).unwrap_or_default()),
            (
                "aggregation",
                serde_json::to_value(&trace.aggregation).unwrap_or_default(),
            ),
            (
                "signal_layers",
                serde_json::to_value(&trace.signal_layers).unwrap_or_default(),
            ),
            ("opposing_signals", json!(trace.opposing_signals)),
            ("config_version", v_str(&trace.config_version)),
            ("error", json!(trace.error)),
        ]),
    );
}

/// One per blocked candidate, keyed by the gate that blocked it.
pub fn gate_blocked(trace: &DecisionTrace, displaced_target: Option<&str>) {
    if trace.final_decision.outcome != Outcome::Blocked {
        return;
    }
    let gate = trace
        .first_failing_gate()
        .map(|g| g.gate.as_str())
        .unwrap_or("unknown");
    log(
        Level::Info,
        Subsystem::Gates,
        "gate_blocked",
        obj(&[
            ("intent_id", v_str(&trace.intent_id)),
            ("cycle_id", json!(trace.cycle_id)),
            ("symbol", v_str(&trace.symbol)),
            ("gate", v_str(gate)),
            ("reason", v_str(&trace.final_decision.primary_reason)),
            ("composite_score", v_num(trace.composite_score)),
            ("direction_confidence", v_num(trace.direction_confidence)),
            (
                "displaced_incumbent",
                displaced_target.map(v_str).unwrap_or(serde_json::Value::Null),
            ),
        ]),
    );
}

/// One per (incumbent, challenger) pair evaluated, allowed or blocked.
pub fn displacement_evaluated(eval: &DisplacementEvaluation, cycle_id: u64) {
    log(
        Level::Info,
        Subsystem::Displace,
        "displacement_evaluated",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("symbol", v_str(&eval.challenger_symbol)),
            ("incumbent_symbol", v_str(&eval.incumbent_symbol)),
            ("incumbent_score", v_num(eval.incumbent_score)),
            ("challenger_score", v_num(eval.challenger_score)),
            ("delta_score", v_num(eval.delta_score)),
            ("incumbent_age_secs", json!(eval.incumbent_age_secs)),
            ("thesis_dominance", json!(eval.thesis_dominance)),
            ("allowed", json!(eval.allowed)),
            ("block_reason", v_str(eval.block_reason.as_str())),
            (
                "dominant_factor",
                eval.dominant_factor.as_deref().map(v_str).unwrap_or(serde_json::Value::Null),
            ),
        ]),
    );
}

pub fn position_opened(position: &Position, intent_id: &str, cycle_id: u64) {
    log(
        Level::Info,
        Subsystem::Positions,
        "position_opened",
        obj(&[
            ("intent_id", v_str(intent_id)),
            ("cycle_id", json!(cycle_id)),
            ("symbol", v_str(&position.symbol)),
            ("side", v_str(position.side.as_str())),
            ("entry_score", v_num(position.entry_score)),
            ("thesis_tags", json!(position.thesis_tags)),
        ]),
    );
}

pub fn position_closed(closed: &ClosedPosition, cycle_id: u64) {
    log(
        Level::Info,
        Subsystem::Positions,
        "position_closed",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("symbol", v_str(&closed.position.symbol)),
            ("reason", v_str(&closed.reason)),
            ("entry_score", v_num(closed.position.entry_score)),
            ("held_secs", json!(closed.closed_ts.saturating_sub(closed.position.entry_ts))),
        ]),
    );
}

pub fn shadow_scoreboard(board: &ShadowScoreboard) {
    log(
        Level::Info,
        Subsystem::Shadow,
        "shadow_scoreboard",
        obj(&[
            ("variant_id", v_str(&board.variant_id)),
            ("window_start_cycle", json!(board.window_start_cycle)),
            ("cycles", json!(board.cycles)),
            ("would_enter_count", json!(board.would_enter_count)),
            ("would_exit_count", json!(board.would_exit_count)),
            (
                "blocked_reason_histogram",
                serde_json::to_value(&board.blocked_reason_histogram).unwrap_or_default(),
            ),
        ]),
    );
}

/// A shadow variant blew up; the others and the live path keep going.
pub fn variant_error(variant_id: &str, cycle_id: u64, err: &str) {
    log(
        Level::Error,
        Subsystem::Shadow,
        "variant_error",
        obj(&[
            ("variant_id", v_str(variant_id)),
            ("cycle_id", json!(cycle_id)),
            ("msg", v_str(err)),
        ]),
    );
}

/// Stale or missing inputs degraded a symbol's scoring this cycle.
pub fn stale_inputs(symbol: &str, cycle_id: u64, omitted: usize, stale_signals: &[String]) {
    log(
        Level::Warn,
        Subsystem::Aggregate,
        "stale_inputs",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("symbol", v_str(symbol)),
            ("omitted_layers", json!(omitted)),
            ("stale_signals", json!(stale_signals)),
        ]),
    );
}

pub fn cycle_summary(
    cycle_id: u64,
    candidates: usize,
    entered: usize,
    blocked: usize,
    displacements: usize,
    open_positions: usize,
) {
    log(
        Level::Info,
        Subsystem::System,
        "cycle_summary",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("candidates", json!(candidates)),
            ("entered", json!(entered)),
            ("blocked", json!(blocked)),
            ("displacements", json!(displacements)),
            ("open_positions", json!(open_positions)),
        ]),
    );
}
