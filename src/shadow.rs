//! Shadow experiment runner.
//!
//! Replays each cycle's candidate stream through N independently configured
//! variants without committing anything: a variant reads live candidates and
//! a read-only view of the position book, simulates entries and evictions
//! against its own local copy, and tallies would_enter / would_exit counts
//! plus a blocked-reason histogram per window. All trials are logged, no
//! cherry-picking. A variant that blows up is recorded and skipped; the other
//! variants and the live pipeline are untouched.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;

use crate::aggregate::{Candidate, Layer};
use crate::config::{Config, ConfigOverrides, SignalWeights};
use crate::displace::{DisplacementPolicy, IncumbentView};
use crate::events;
use crate::gates::reason;
use crate::positions::PositionBook;

#[derive(Debug, Clone)]
pub struct ShadowVariant {
    pub variant_id: String,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShadowScoreboard {
    pub variant_id: String,
    pub window_start_cycle: u64,
    pub cycles: u64,
    pub would_enter_count: u64,
    pub would_exit_count: u64,
    pub blocked_reason_histogram: BTreeMap<String, u64>,
}

impl ShadowScoreboard {
    fn new(variant_id: &str, window_start_cycle: u64) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            window_start_cycle,
            ..Default::default()
        }
    }
}

/// The variant's private copy of one occupied slot.
struct SimSlot {
    symbol: String,
    score: f64,
    entry_ts: u64,
    thesis_tags: Vec<String>,
    opposing_signals: Vec<String>,
}

pub struct ShadowRunner {
    variants: Vec<ShadowVariant>,
    boards: Vec<ShadowScoreboard>,
    window_cycles: u64,
    cycles_in_window: u64,
}

impl ShadowRunner {
    pub fn new(variants: Vec<ShadowVariant>, window_cycles: u64) -> Self {
        let boards = variants
            .iter()
            .map(|v| ShadowScoreboard::new(&v.variant_id, 0))
            .collect();
        Self { variants, boards, window_cycles: window_cycles.max(1), cycles_in_window: 0 }
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Feed one cycle's candidates to every variant. Returns the finished
    /// scoreboards when the window closes, empty otherwise.
    pub fn observe_cycle(
        &mut self,
        cycle_id: u64,
        now_ts: u64,
        candidates: &[Candidate],
        book: &PositionBook,
        cfg: &Config,
        weights: &SignalWeights,
    ) -> Vec<ShadowScoreboard> {
        for (variant, board) in self.variants.iter().zip(self.boards.iter_mut()) {
            let result = catch_unwind(AssertUnwindSafe(|| {
                evaluate_variant(variant, candidates, book, cfg, weights, now_ts)
            }));
            match result {
                Ok(tally) => {
                    board.cycles += 1;
                    board.would_enter_count += tally.would_enter;
                    board.would_exit_count += tally.would_exit;
                    for (reason, n) in tally.blocked {
                        *board.blocked_reason_histogram.entry(reason).or_insert(0) += n;
                    }
                }
                Err(payload) => {
                    events::variant_error(&variant.variant_id, cycle_id, &panic_message(&payload));
                }
            }
        }

        self.cycles_in_window += 1;
        if self.cycles_in_window < self.window_cycles {
            return Vec::new();
        }

        // Window boundary: hand the boards out and start fresh ones.
        self.cycles_in_window = 0;
        let next_start = cycle_id + 1;
        let finished = std::mem::replace(
            &mut self.boards,
            self.variants
                .iter()
                .map(|v| ShadowScoreboard::new(&v.variant_id, next_start))
                .collect(),
        );
        finished
    }
}

struct CycleTally {
    would_enter: u64,
    would_exit: u64,
    blocked: BTreeMap<String, u64>,
}

/// One variant, one cycle. Pure with respect to live state: the book is only
/// read, and the simulation runs against a local slot copy.
fn evaluate_variant(
    variant: &ShadowVariant,
    candidates: &[Candidate],
    book: &PositionBook,
    cfg: &Config,
    weights: &SignalWeights,
    now_ts: u64,
) -> CycleTally {
    let (vcfg, vweights) = variant.overrides.apply(cfg, weights);
    let policy = DisplacementPolicy::from_config(&vcfg);

    let by_symbol: HashMap<&str, &Candidate> =
        candidates.iter().map(|c| (c.symbol.as_str(), c)).collect();

    // Local copy of the live slots, rescored under the variant's weights.
    let mut slots: Vec<SimSlot> = book
        .positions()
        .into_iter()
        .map(|p| {
            let fresh = by_symbol.get(p.symbol.as_str());
            SimSlot {
                score: fresh.map(|c| reweight(c, &vweights)).unwrap_or(p.entry_score),
                opposing_signals: fresh.map(|c| c.opposing_signals.clone()).unwrap_or_default(),
                symbol: p.symbol,
                entry_ts: p.entry_ts,
                thesis_tags: p.thesis_tags,
            }
        })
        .collect();

    // Challengers under variant scoring, strongest first, mirroring the live
    // pipeline's ordering.
    let mut challengers: Vec<(&Candidate, f64)> = candidates
        .iter()
        .filter(|c| !slots.iter().any(|s| s.symbol == c.symbol))
        .map(|c| (c, reweight(c, &vweights)))
        .collect();
    challengers.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut tally = CycleTally {
        would_enter: 0,
        would_exit: 0,
        blocked: BTreeMap::new(),
    };
    fn block(tally: &mut CycleTally, reason: &str) {
        *tally.blocked.entry(reason.to_string()).or_insert(0) += 1;
    }

    for (cand, score) in challengers {
        if score < vcfg.min_composite_score {
            block(&mut tally, reason::SCORE_BELOW_THRESHOLD);
            continue;
        }
        if cand
            .aggregation
            .layer_scores
            .get(&Layer::Volatility)
            .map(|s| s.abs() > vcfg.max_volatility_score)
            .unwrap_or(false)
        {
            block(&mut tally, reason::VOLATILITY_EXTREME);
            continue;
        }
        match cand.aggregation.layer_scores.get(&Layer::Alpha) {
            None => {
                block(&mut tally, reason::MOMENTUM_UNAVAILABLE);
                continue;
            }
            Some(s) if s.abs() < vcfg.momentum_floor => {
                block(&mut tally, reason::MOMENTUM_FADING);
                continue;
            }
            Some(_) => {}
        }
        if cand.direction_confidence < vcfg.min_direction_confidence {
            block(&mut tally, reason::DIRECTION_CONFLICTED);
            continue;
        }

        if slots.len() < book.capacity() {
            tally.would_enter += 1;
            slots.push(sim_entry(cand, score, &vweights, &vcfg, now_ts));
            continue;
        }

        // At capacity: try displacing the weakest simulated incumbent.
        let weakest_idx = slots
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i);
        let idx = match weakest_idx {
            Some(i) if score > slots[i].score => i,
            _ => {
                block(&mut tally, reason::AT_CAPACITY);
                continue;
            }
        };
        let incumbent = IncumbentView {
            symbol: slots[idx].symbol.clone(),
            score: slots[idx].score,
            entry_ts: slots[idx].entry_ts,
            thesis_tags: slots[idx].thesis_tags.clone(),
            opposing_signals: slots[idx].opposing_signals.clone(),
        };
        let eval = policy.evaluate(&incumbent, cand, &vweights, now_ts);
        if eval.allowed {
            tally.would_exit += 1;
            tally.would_enter += 1;
            slots[idx] = sim_entry(cand, score, &vweights, &vcfg, now_ts);
        } else {
            // Most specific reason available: the displacement verdict.
            block(&mut tally, eval.block_reason.as_str());
        }
    }

    tally
}

fn sim_entry(cand: &Candidate, score: f64, weights: &SignalWeights, cfg: &Config, now_ts: u64) -> SimSlot {
    SimSlot {
        symbol: cand.symbol.clone(),
        score,
        entry_ts: now_ts,
        thesis_tags: cand.thesis_tags(weights, cfg.dominance_share),
        opposing_signals: cand.opposing_signals.clone(),
    }
}

/// Composite under different layer weights, from the already-aggregated
/// per-layer scores. The variant taps the stream after aggregation; layer
/// scores themselves are weight-independent.
pub fn reweight(candidate: &Candidate, weights: &SignalWeights) -> f64 {
    let present_weight: f64 = candidate
        .aggregation
        .layer_scores
        .keys()
        .map(|l| weights.get(*l))
        .sum();
    if present_weight <= 0.0 {
        return 0.0;
    }
    let signed: f64 = candidate
        .aggregation
        .layer_scores
        .iter()
        .map(|(l, s)| weights.get(*l) * s)
        .sum::<f64>()
        / present_weight;
    signed.abs()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "variant panicked".to_string()
    }
}
