//! Gate pipeline: a fixed, ordered set of independent pass/fail predicates.
//!
//! Order is score → capacity → risk → momentum → directional → displacement,
//! encoded as a typed list rather than runtime registration so ordering and
//! short-circuit behavior stay auditable. A hard gate failing skips the rest;
//! every gate actually evaluated is recorded, so partial gate lists in a
//! trace are expected. The capacity gate is the one soft failure: at capacity
//! the pipeline keeps going, because the displacement gate may still rescue
//! the candidate by evicting the weakest incumbent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::{Candidate, Layer};
use crate::config::{Config, SignalWeights};
use crate::displace::{DisplacementEvaluation, DisplacementPolicy, IncumbentView};
use crate::positions::PositionBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    Score,
    Capacity,
    Risk,
    Momentum,
    Directional,
    Displacement,
}

impl GateName {
    pub const ORDER: [GateName; 6] = [
        GateName::Score,
        GateName::Capacity,
        GateName::Risk,
        GateName::Momentum,
        GateName::Directional,
        GateName::Displacement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateName::Score => "score_gate",
            GateName::Capacity => "capacity_gate",
            GateName::Risk => "risk_gate",
            GateName::Momentum => "momentum_gate",
            GateName::Directional => "directional_gate",
            GateName::Displacement => "displacement_gate",
        }
    }
}

pub mod reason {
    pub const SCORE_ABOVE_THRESHOLD: &str = "score_above_threshold";
    pub const SCORE_BELOW_THRESHOLD: &str = "score_below_threshold";
    pub const SLOT_AVAILABLE: &str = "slot_available";
    pub const AT_CAPACITY: &str = "at_capacity";
    pub const WITHIN_LIMITS: &str = "within_limits";
    pub const HALTED: &str = "halted";
    pub const VOLATILITY_EXTREME: &str = "volatility_extreme";
    pub const MOMENTUM_INTACT: &str = "momentum_intact";
    pub const MOMENTUM_FADING: &str = "momentum_fading";
    pub const MOMENTUM_UNAVAILABLE: &str = "momentum_unavailable";
    pub const DIRECTION_ALIGNED: &str = "direction_aligned";
    pub const DIRECTION_CONFLICTED: &str = "direction_conflicted";
    pub const DISPLACEMENT_ALLOWED: &str = "displacement_allowed";
    pub const ALL_GATES_PASSED: &str = "all_gates_passed";
    pub const EVALUATION_ERROR: &str = "evaluation_error";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateName,
    pub passed: bool,
    pub reason: String,
}

impl GateResult {
    fn new(gate: GateName, passed: bool, reason: &str) -> Self {
        Self { gate, passed, reason: reason.to_string() }
    }
}

/// Everything the pipeline reads besides the book itself. Built once per
/// cycle by the engine.
pub struct PipelineContext<'a> {
    pub cfg: &'a Config,
    pub weights: &'a SignalWeights,
    pub policy: &'a DisplacementPolicy,
    /// This cycle's fresh composites, keyed by symbol (incumbents included).
    pub fresh_scores: &'a HashMap<String, f64>,
    /// This cycle's opposing-signal lists for incumbents scored this cycle.
    pub fresh_opposing: &'a HashMap<String, Vec<String>>,
    pub now_ts: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub gates: Vec<GateResult>,
    pub entered: bool,
    pub primary_reason: String,
    pub secondary_reasons: Vec<String>,
    pub displacement: Option<DisplacementEvaluation>,
    /// Incumbent to close before opening, set only on an allowed displacement.
    pub displaced_incumbent: Option<String>,
}

/// Run the full pipeline for one challenger. Mutates only the book's
/// per-cycle claim set; open/close stay with the engine.
pub fn run_pipeline(
    candidate: &Candidate,
    book: &mut PositionBook,
    ctx: &PipelineContext,
) -> PipelineOutcome {
    let cfg = ctx.cfg;
    let mut gates: Vec<GateResult> = Vec::new();

    // 1. score_gate (hard)
    let score_pass = candidate.composite_score >= cfg.min_composite_score;
    gates.push(GateResult::new(
        GateName::Score,
        score_pass,
        if score_pass { reason::SCORE_ABOVE_THRESHOLD } else { reason::SCORE_BELOW_THRESHOLD },
    ));
    if !score_pass {
        return finish(gates, None, None);
    }

    // 2. capacity_gate (soft: displacement may still rescue)
    let capacity_pass = !book.at_capacity();
    gates.push(GateResult::new(
        GateName::Capacity,
        capacity_pass,
        if capacity_pass { reason::SLOT_AVAILABLE } else { reason::AT_CAPACITY },
    ));

    // 3. risk_gate (hard)
    let risk_reason = if std::path::Path::new(&cfg.kill_file).exists() {
        reason::HALTED
    } else if candidate
        .aggregation
        .layer_scores
        .get(&Layer::Volatility)
        .map(|s| s.abs() > cfg.max_volatility_score)
        .unwrap_or(false)
    {
        reason::VOLATILITY_EXTREME
    } else {
        reason::WITHIN_LIMITS
    };
    let risk_pass = risk_reason == reason::WITHIN_LIMITS;
    gates.push(GateResult::new(GateName::Risk, risk_pass, risk_reason));
    if !risk_pass {
        return finish(gates, None, None);
    }

    // 4. momentum_gate (hard; omitted alpha data fails closed)
    let momentum_reason = match candidate.aggregation.layer_scores.get(&Layer::Alpha) {
        None => reason::MOMENTUM_UNAVAILABLE,
        Some(s) if s.abs() < cfg.momentum_floor => reason::MOMENTUM_FADING,
        Some(_) => reason::MOMENTUM_INTACT,
    };
    let momentum_pass = momentum_reason == reason::MOMENTUM_INTACT;
    gates.push(GateResult::new(GateName::Momentum, momentum_pass, momentum_reason));
    if !momentum_pass {
        return finish(gates, None, None);
    }

    // 5. directional_gate (hard)
    let directional_pass = candidate.direction_confidence >= cfg.min_direction_confidence;
    gates.push(GateResult::new(
        GateName::Directional,
        directional_pass,
        if directional_pass { reason::DIRECTION_ALIGNED } else { reason::DIRECTION_CONFLICTED },
    ));
    if !directional_pass {
        return finish(gates, None, None);
    }

    if capacity_pass {
        return finish(gates, None, None);
    }

    // 6. displacement_gate: at capacity, everything else passed. Runs only
    // against the single weakest incumbent, only for a strictly stronger
    // challenger, and only if the slot claim is still free this cycle.
    let weakest = book.weakest(ctx.fresh_scores).map(|(p, s)| (p.clone(), s));
    let (weak, weak_score) = match weakest {
        Some(w) => w,
        None => return finish(gates, None, None),
    };
    if candidate.composite_score <= weak_score {
        return finish(gates, None, None);
    }
    if !book.claim(&weak.symbol) {
        // Slot already claimed this cycle: ordinary capacity block.
        return finish(gates, None, None);
    }

    let incumbent = IncumbentView {
        symbol: weak.symbol.clone(),
        score: weak_score,
        entry_ts: weak.entry_ts,
        thesis_tags: weak.thesis_tags.clone(),
        opposing_signals: ctx.fresh_opposing.get(&weak.symbol).cloned().unwrap_or_default(),
    };
    let eval = ctx.policy.evaluate(&incumbent, candidate, ctx.weights, ctx.now_ts);
    gates.push(GateResult::new(
        GateName::Displacement,
        eval.allowed,
        if eval.allowed { reason::DISPLACEMENT_ALLOWED } else { eval.block_reason.as_str() },
    ));
    let displaced = if eval.allowed { Some(weak.symbol.clone()) } else { None };
    finish(gates, Some(eval), displaced)
}

fn finish(
    gates: Vec<GateResult>,
    displacement: Option<DisplacementEvaluation>,
    displaced_incumbent: Option<String>,
) -> PipelineOutcome {
    let failed: Vec<&GateResult> = gates.iter().filter(|g| !g.passed).collect();
    let entered = failed.is_empty()
        || (failed.len() == 1
            && failed[0].gate == GateName::Capacity
            && displaced_incumbent.is_some());

    let (primary_reason, mut secondary_reasons) = if entered {
        (reason::ALL_GATES_PASSED.to_string(), Vec::new())
    } else {
        (
            failed[0].reason.clone(),
            failed.iter().skip(1).map(|g| g.reason.clone()).collect(),
        )
    };
    if let Some(symbol) = &displaced_incumbent {
        secondary_reasons.push(format!("displaced={}", symbol));
    }

    PipelineOutcome {
        gates,
        entered,
        primary_reason,
        secondary_reasons,
        displacement,
        displaced_incumbent,
    }
}
