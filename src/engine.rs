//! Per-cycle decision engine.
//!
//! One logical sequential pass: aggregate the universe, gate each challenger
//! strongest-first, apply entries and displacements to the position book,
//! then hand the same candidate stream to the shadow runner. A fault in one
//! candidate's evaluation is caught at the trace boundary and blocks only
//! that candidate; the cycle always runs to completion.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;

use crate::aggregate::{aggregate, Candidate};
use crate::config::{Config, SignalWeights};
use crate::displace::{DisplacementEvaluation, DisplacementPolicy};
use crate::events;
use crate::features::FeatureSnapshot;
use crate::gates::{run_pipeline, PipelineContext};
use crate::logging;
use crate::positions::{ClosedPosition, Position, PositionBook};
use crate::shadow::{ShadowRunner, ShadowScoreboard, ShadowVariant};
use crate::trace::DecisionTrace;

/// Everything one cycle produced, for persistence and inspection.
pub struct CycleReport {
    pub cycle_id: u64,
    pub traces: Vec<DecisionTrace>,
    pub entered: Vec<String>,
    pub displacements: Vec<DisplacementEvaluation>,
    pub closed: Vec<ClosedPosition>,
    pub scoreboards: Vec<ShadowScoreboard>,
}

pub struct DecisionEngine {
    cfg: Config,
    weights: SignalWeights,
    config_version: String,
    policy: DisplacementPolicy,
    book: PositionBook,
    shadow: ShadowRunner,
}

impl DecisionEngine {
    pub fn new(
        cfg: Config,
        weights: SignalWeights,
        book: PositionBook,
        variants: Vec<ShadowVariant>,
    ) -> Self {
        let config_version = cfg.fingerprint();
        let policy = DisplacementPolicy::from_config(&cfg);
        let shadow = ShadowRunner::new(variants, cfg.shadow_window_cycles);
        Self { cfg, weights, config_version, policy, book, shadow }
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn config_version(&self) -> &str {
        &self.config_version
    }

    /// Hot-reload the config between cycles. An invalid config is rejected
    /// and the running one stays in force; a valid one re-derives the policy
    /// and fingerprint, so flipping `displacement_enabled` off here is the
    /// no-op-policy rollback path.
    pub fn update_config(&mut self, cfg: Config) -> Result<()> {
        cfg.validate()?;
        self.config_version = cfg.fingerprint();
        self.policy = DisplacementPolicy::from_config(&cfg);
        self.cfg = cfg;
        Ok(())
    }

    /// Swap in a newly published weight table for subsequent cycles.
    pub fn update_weights(&mut self, weights: SignalWeights) {
        self.weights = weights;
    }

    pub fn run_cycle(
        &mut self,
        cycle_id: u64,
        now_ts: u64,
        snapshots: &[FeatureSnapshot],
    ) -> CycleReport {
        self.book.begin_cycle(cycle_id);

        let mut traces: Vec<DecisionTrace> = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        // Aggregation. Degraded inputs are warned and carried forward as
        // omissions; a scoring fault costs only that symbol.
        for snap in snapshots {
            let result = catch_unwind(AssertUnwindSafe(|| {
                aggregate(snap, &self.weights, &self.cfg, now_ts)
            }));
            match result {
                Ok(cand) => {
                    if !cand.aggregation.omitted.is_empty()
                        || !cand.aggregation.stale_signals.is_empty()
                    {
                        events::stale_inputs(
                            &cand.symbol,
                            cycle_id,
                            cand.aggregation.omitted.len(),
                            &cand.aggregation.stale_signals,
                        );
                    }
                    candidates.push(cand);
                }
                Err(payload) => {
                    let trace = DecisionTrace::error_trace(
                        &snap.symbol,
                        cycle_id,
                        now_ts,
                        &self.config_version,
                        &panic_message(&payload),
                    );
                    events::trade_intent(&trace);
                    traces.push(trace);
                }
            }
        }

        // Fresh per-symbol context for incumbent ranking and thesis vetoes.
        let fresh_scores: HashMap<String, f64> = candidates
            .iter()
            .map(|c| (c.symbol.clone(), c.composite_score))
            .collect();
        let fresh_opposing: HashMap<String, Vec<String>> = candidates
            .iter()
            .map(|c| (c.symbol.clone(), c.opposing_signals.clone()))
            .collect();

        // Challengers strongest-first; held symbols are not challengers.
        let mut order: Vec<usize> = (0..candidates.len())
            .filter(|&i| !self.book.holds(&candidates[i].symbol))
            .collect();
        order.sort_by(|&a, &b| {
            candidates[b]
                .composite_score
                .partial_cmp(&candidates[a].composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut entered: Vec<String> = Vec::new();
        let mut displacements: Vec<DisplacementEvaluation> = Vec::new();
        let mut closed: Vec<ClosedPosition> = Vec::new();

        for i in order {
            let cand = &candidates[i];
            let result = catch_unwind(AssertUnwindSafe(|| {
                let ctx = PipelineContext {
                    cfg: &self.cfg,
                    weights: &self.weights,
                    policy: &self.policy,
                    fresh_scores: &fresh_scores,
                    fresh_opposing: &fresh_opposing,
                    now_ts,
                };
                run_pipeline(cand, &mut self.book, &ctx)
            }));

            let pipeline = match result {
                Ok(pipeline) => pipeline,
                Err(payload) => {
                    // Fail closed: an error anywhere in gating blocks the
                    // candidate, never enters it.
                    let trace = DecisionTrace::error_trace(
                        &cand.symbol,
                        cycle_id,
                        now_ts,
                        &self.config_version,
                        &panic_message(&payload),
                    );
                    events::trade_intent(&trace);
                    traces.push(trace);
                    continue;
                }
            };

            if let Some(eval) = &pipeline.displacement {
                displacements.push(eval.clone());
                if self.cfg.log_every_decision || eval.allowed {
                    events::displacement_evaluated(eval, cycle_id);
                }
            }

            let trace = DecisionTrace::from_evaluation(
                cand,
                &pipeline,
                cycle_id,
                now_ts,
                &self.config_version,
            );
            events::trade_intent(&trace);

            if pipeline.entered {
                if let (Some(incumbent), Some(eval)) =
                    (&pipeline.displaced_incumbent, &pipeline.displacement)
                {
                    let close_reason =
                        format!("displaced_by={}{}", cand.symbol, eval.close_annotation());
                    if let Some(c) = self.book.close(incumbent, &close_reason, now_ts) {
                        events::position_closed(&c, cycle_id);
                        closed.push(c);
                    }
                }
                let position = Position {
                    symbol: cand.symbol.clone(),
                    side: cand.side,
                    entry_score: cand.composite_score,
                    entry_ts: now_ts,
                    thesis_tags: cand.thesis_tags(&self.weights, self.cfg.dominance_share),
                };
                match self.book.open(position.clone()) {
                    Ok(()) => {
                        events::position_opened(&position, &trace.intent_id, cycle_id);
                        entered.push(cand.symbol.clone());
                    }
                    Err(err) => {
                        // Lost a capacity race within the cycle; treated as
                        // an ordinary block, not a failure.
                        logging::log(
                            logging::Level::Warn,
                            logging::Subsystem::Positions,
                            "open_rejected",
                            logging::obj(&[
                                ("symbol", logging::v_str(&cand.symbol)),
                                ("cycle_id", serde_json::json!(cycle_id)),
                                ("msg", logging::v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
            } else {
                events::gate_blocked(
                    &trace,
                    pipeline
                        .displacement
                        .as_ref()
                        .map(|e| e.incumbent_symbol.as_str()),
                );
            }
            traces.push(trace);
        }

        // Shadow variants read the same candidates and a read-only book.
        let scoreboards = self.shadow.observe_cycle(
            cycle_id,
            now_ts,
            &candidates,
            &self.book,
            &self.cfg,
            &self.weights,
        );
        for board in &scoreboards {
            events::shadow_scoreboard(board);
        }

        let blocked = traces.len() - entered.len();
        events::cycle_summary(
            cycle_id,
            traces.len(),
            entered.len(),
            blocked,
            closed.len(),
            self.book.len(),
        );

        CycleReport { cycle_id, traces, entered, displacements, closed, scoreboards }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "evaluation panicked".to_string()
    }
}
