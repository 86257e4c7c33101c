//! Displacement policy: may a challenger evict the weakest incumbent?
//!
//! Pure evaluation, three rules in fixed order: minimum hold, minimum score
//! delta, thesis dominance. The first failing rule supplies the block reason;
//! all rules are still computed so every record carries full diagnostics.
//! Boundaries are inclusive: age exactly at the hold floor passes, delta
//! exactly at the floor proceeds. Disabling the policy is a pure-config
//! rollback — every evaluation comes back allowed.

use serde::{Deserialize, Serialize};

use crate::aggregate::Candidate;
use crate::config::{Config, SignalWeights};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    None,
    MinHold,
    DeltaTooSmall,
    NoThesisDominance,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::None => "none",
            BlockReason::MinHold => "min_hold",
            BlockReason::DeltaTooSmall => "delta_too_small",
            BlockReason::NoThesisDominance => "no_thesis_dominance",
        }
    }
}

/// What the policy needs to know about the incumbent under consideration.
#[derive(Debug, Clone)]
pub struct IncumbentView {
    pub symbol: String,
    /// Fresh composite when the incumbent was scored this cycle, entry score
    /// otherwise.
    pub score: f64,
    pub entry_ts: u64,
    pub thesis_tags: Vec<String>,
    /// Opposing signals on the incumbent's fresh candidate, empty when the
    /// incumbent was not scored this cycle.
    pub opposing_signals: Vec<String>,
}

/// One record per (incumbent, challenger) pair considered per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplacementEvaluation {
    pub incumbent_symbol: String,
    pub challenger_symbol: String,
    pub incumbent_score: f64,
    pub challenger_score: f64,
    pub delta_score: f64,
    pub incumbent_age_secs: u64,
    pub thesis_dominance: bool,
    pub allowed: bool,
    pub block_reason: BlockReason,
    /// Layer tag justifying an allowed swap, e.g. `regime_dominance`.
    pub dominant_factor: Option<String>,
}

impl DisplacementEvaluation {
    /// Suffix appended to the incumbent's close reason on an allowed swap.
    pub fn close_annotation(&self) -> String {
        format!(
            "|delta={:.2}|age_s={}|thesis={}",
            self.delta_score,
            self.incumbent_age_secs,
            self.dominant_factor.as_deref().unwrap_or("composite")
        )
    }
}

pub struct DisplacementPolicy {
    enabled: bool,
    min_hold_secs: u64,
    min_delta_score: f64,
    require_thesis_dominance: bool,
    dominance_share: f64,
    opposing_veto_confidence: f64,
}

impl DisplacementPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            enabled: cfg.displacement_enabled,
            min_hold_secs: cfg.min_hold_secs,
            min_delta_score: cfg.min_delta_score,
            require_thesis_dominance: cfg.require_thesis_dominance,
            dominance_share: cfg.dominance_share,
            opposing_veto_confidence: cfg.opposing_veto_confidence,
        }
    }

    pub fn evaluate(
        &self,
        incumbent: &IncumbentView,
        challenger: &Candidate,
        weights: &SignalWeights,
        now_ts: u64,
    ) -> DisplacementEvaluation {
        let incumbent_age_secs = now_ts.saturating_sub(incumbent.entry_ts);
        let delta_score = challenger.composite_score - incumbent.score;

        // All three rules computed regardless of outcome; the record is the
        // diagnostic surface for the whole policy.
        let hold_ok = incumbent_age_secs >= self.min_hold_secs;
        let delta_ok = delta_score >= self.min_delta_score;
        let (thesis_dominance, dominant_factor) = self.thesis_verdict(incumbent, challenger, weights);
        let thesis_ok = !self.require_thesis_dominance || thesis_dominance;

        let (allowed, block_reason) = if !self.enabled {
            (true, BlockReason::None)
        } else if !hold_ok {
            (false, BlockReason::MinHold)
        } else if !delta_ok {
            (false, BlockReason::DeltaTooSmall)
        } else if !thesis_ok {
            (false, BlockReason::NoThesisDominance)
        } else {
            (true, BlockReason::None)
        };

        DisplacementEvaluation {
            incumbent_symbol: incumbent.symbol.clone(),
            challenger_symbol: challenger.symbol.clone(),
            incumbent_score: incumbent.score,
            challenger_score: challenger.composite_score,
            delta_score,
            incumbent_age_secs,
            thesis_dominance,
            allowed,
            block_reason,
            dominant_factor,
        }
    }

    /// Thesis dominance: the challenger must bring at least one dominant
    /// layer the incumbent's thesis does not already carry, and must not
    /// share a disqualifying opposing signal with the incumbent.
    fn thesis_verdict(
        &self,
        incumbent: &IncumbentView,
        challenger: &Candidate,
        weights: &SignalWeights,
    ) -> (bool, Option<String>) {
        let dominant = challenger.dominant_layers(weights, self.dominance_share);
        let novel: Vec<_> = dominant
            .iter()
            .copied()
            .filter(|l| !incumbent.thesis_tags.iter().any(|t| t == l.as_str()))
            .collect();

        let shared_veto = challenger.opposing_signals.iter().any(|name| {
            incumbent.opposing_signals.contains(name)
                && self.signal_confidence(challenger, name) >= self.opposing_veto_confidence
        });

        let verdict = !novel.is_empty() && !shared_veto;
        let factor = novel
            .first()
            .copied()
            .or_else(|| dominant.first().copied())
            .map(|l| format!("{}_dominance", l.as_str()));
        (verdict, factor)
    }

    fn signal_confidence(&self, candidate: &Candidate, name: &str) -> f64 {
        candidate
            .signal_layers
            .values()
            .flatten()
            .find(|s| s.name == name)
            .map(|s| s.confidence)
            .unwrap_or(0.0)
    }
}
