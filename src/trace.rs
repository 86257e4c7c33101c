//! Decision trace: the per-candidate audit record.
//!
//! One trace per candidate per cycle, no exceptions. A candidate whose
//! evaluation blew up still gets a minimal error-marked trace defaulting to
//! blocked — silent drops are the defect class this module exists to prevent.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationSummary, Candidate, Layer, LayerSignal, Side};
use crate::gates::{reason, GateResult, PipelineOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Entered,
    Blocked,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Entered => "entered",
            Outcome::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalDecision {
    pub outcome: Outcome,
    pub primary_reason: String,
    pub secondary_reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub intent_id: String,
    pub symbol: String,
    pub ts: u64,
    pub cycle_id: u64,
    pub config_version: String,
    pub side: Option<Side>,
    pub signal_layers: BTreeMap<Layer, Vec<LayerSignal>>,
    pub opposing_signals: Vec<String>,
    pub composite_score: f64,
    pub direction_confidence: f64,
    pub aggregation: Option<AggregationSummary>,
    pub gates: Vec<GateResult>,
    pub final_decision: FinalDecision,
    /// Set when the candidate's evaluation failed upstream of a decision.
    pub error: Option<String>,
}

/// Stable id correlating a trace with its events: `I-<cycle>-<symbol>-<rand>`.
pub fn new_intent_id(cycle_id: u64, symbol: &str) -> String {
    let salt: u16 = rand::thread_rng().gen();
    format!("I-{}-{}-{:04x}", cycle_id, symbol, salt)
}

impl DecisionTrace {
    /// Full trace for a candidate that went through the pipeline.
    pub fn from_evaluation(
        candidate: &Candidate,
        pipeline: &PipelineOutcome,
        cycle_id: u64,
        now_ts: u64,
        config_version: &str,
    ) -> Self {
        let outcome = if pipeline.entered { Outcome::Entered } else { Outcome::Blocked };
        Self {
            intent_id: new_intent_id(cycle_id, &candidate.symbol),
            symbol: candidate.symbol.clone(),
            ts: now_ts,
            cycle_id,
            config_version: config_version.to_string(),
            side: Some(candidate.side),
            signal_layers: candidate.signal_layers.clone(),
            opposing_signals: candidate.opposing_signals.clone(),
            composite_score: candidate.composite_score,
            direction_confidence: candidate.direction_confidence,
            aggregation: Some(candidate.aggregation.clone()),
            gates: pipeline.gates.clone(),
            final_decision: FinalDecision {
                outcome,
                primary_reason: pipeline.primary_reason.clone(),
                secondary_reasons: pipeline.secondary_reasons.clone(),
            },
            error: None,
        }
    }

    /// Minimal trace for a candidate whose evaluation failed. Fails closed:
    /// outcome is blocked, never entered.
    pub fn error_trace(
        symbol: &str,
        cycle_id: u64,
        now_ts: u64,
        config_version: &str,
        err: &str,
    ) -> Self {
        Self {
            intent_id: new_intent_id(cycle_id, symbol),
            symbol: symbol.to_string(),
            ts: now_ts,
            cycle_id,
            config_version: config_version.to_string(),
            side: None,
            signal_layers: BTreeMap::new(),
            opposing_signals: Vec::new(),
            composite_score: 0.0,
            direction_confidence: 0.0,
            aggregation: None,
            gates: Vec::new(),
            final_decision: FinalDecision {
                outcome: Outcome::Blocked,
                primary_reason: reason::EVALUATION_ERROR.to_string(),
                secondary_reasons: Vec::new(),
            },
            error: Some(err.to_string()),
        }
    }

    pub fn first_failing_gate(&self) -> Option<&GateResult> {
        self.gates.iter().find(|g| !g.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::GateName;

    fn blocked_pipeline() -> PipelineOutcome {
        PipelineOutcome {
            gates: vec![GateResult {
                gate: GateName::Score,
                passed: false,
                reason: reason::SCORE_BELOW_THRESHOLD.to_string(),
            }],
            entered: false,
            primary_reason: reason::SCORE_BELOW_THRESHOLD.to_string(),
            secondary_reasons: Vec::new(),
            displacement: None,
            displaced_incumbent: None,
        }
    }

    fn candidate(symbol: &str) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            side: Side::Long,
            signal_layers: BTreeMap::new(),
            opposing_signals: Vec::new(),
            composite_score: 1.2,
            direction_confidence: 0.7,
            aggregation: AggregationSummary {
                weight_version: "w0".into(),
                layer_scores: BTreeMap::new(),
                omitted: Vec::new(),
                stale_signals: Vec::new(),
            },
        }
    }

    #[test]
    fn test_intent_ids_unique_per_call() {
        let a = new_intent_id(7, "BTCUSDT");
        let b = new_intent_id(7, "BTCUSDT");
        assert!(a.starts_with("I-7-BTCUSDT-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_trace_carries_single_primary_reason() {
        let trace = DecisionTrace::from_evaluation(&candidate("BTCUSDT"), &blocked_pipeline(), 3, 1000, "cfg0");
        assert_eq!(trace.final_decision.outcome, Outcome::Blocked);
        assert_eq!(trace.final_decision.primary_reason, reason::SCORE_BELOW_THRESHOLD);
        assert!(!trace.gates.is_empty());
    }

    #[test]
    fn test_error_trace_fails_closed() {
        let trace = DecisionTrace::error_trace("BTCUSDT", 3, 1000, "cfg0", "aggregation panicked");
        assert_eq!(trace.final_decision.outcome, Outcome::Blocked);
        assert_eq!(trace.final_decision.primary_reason, reason::EVALUATION_ERROR);
        assert_eq!(trace.error.as_deref(), Some("aggregation panicked"));
        assert_eq!(trace.cycle_id, 3);
    }

    #[test]
    fn test_first_failing_gate() {
        let trace = DecisionTrace::from_evaluation(&candidate("BTCUSDT"), &blocked_pipeline(), 3, 1000, "cfg0");
        assert_eq!(trace.first_failing_gate().unwrap().gate, GateName::Score);
    }

    #[test]
    fn test_trace_serializes_roundtrip() {
        let trace = DecisionTrace::error_trace("BTCUSDT", 3, 1000, "cfg0", "boom");
        let json = serde_json::to_string(&trace).unwrap();
        let back: DecisionTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbol, "BTCUSDT");
        assert_eq!(back.final_decision.outcome, Outcome::Blocked);
    }
}
