//! End-to-end checks of the decision core: entry, displacement, shadow
//! isolation, and persistence across a restart.

use rotationfx::aggregate::Side;
use rotationfx::config::{Config, ConfigOverrides, SignalWeights};
use rotationfx::displace::BlockReason;
use rotationfx::engine::DecisionEngine;
use rotationfx::features::{FeatureSnapshot, FeatureValue};
use rotationfx::positions::PositionBook;
use rotationfx::shadow::ShadowVariant;
use rotationfx::storage::StateStore;
use rotationfx::trace::Outcome;

fn feature(score: f64, direction: f64, confidence: f64) -> FeatureValue {
    FeatureValue { value: score, score, direction, confidence, stale: false }
}

fn test_config(capacity: usize) -> Config {
    let mut cfg = Config::from_env();
    cfg.universe = vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()];
    cfg.capacity = capacity;
    cfg.cycle_secs = 300;
    cfg.min_composite_score = 2.0;
    cfg.max_volatility_score = 3.0;
    cfg.momentum_floor = 0.25;
    cfg.min_direction_confidence = 0.55;
    cfg.dominance_share = 0.35;
    cfg.stale_after_secs = 900;
    cfg.displacement_enabled = true;
    cfg.min_hold_secs = 1200;
    cfg.min_delta_score = 0.75;
    cfg.require_thesis_dominance = true;
    cfg.log_every_decision = true;
    cfg.shadow_window_cycles = 1;
    cfg.kill_file = "/tmp/nonexistent_kill_file".into();
    cfg
}

/// Alpha-plus-regime profile, entered thesis ["alpha", "regime"].
fn trend_snapshot(symbol: &str, strength: f64, fetch_ts: u64) -> FeatureSnapshot {
    FeatureSnapshot::new(symbol, fetch_ts)
        .with("alpha.trend_break", feature(strength, 1.0, 0.9))
        .with("regime.vol_shift", feature(strength - 0.1, 1.0, 0.9))
}

/// Alpha-plus-flow profile, bringing a flow thesis trend entries lack.
fn flow_snapshot(symbol: &str, strength: f64, fetch_ts: u64) -> FeatureSnapshot {
    FeatureSnapshot::new(symbol, fetch_ts)
        .with("alpha.trend_break", feature(strength, 1.0, 0.9))
        .with("flow.cvd_imbalance", feature(strength - 0.1, 1.0, 0.9))
}

fn engine(cfg: &Config) -> DecisionEngine {
    DecisionEngine::new(
        cfg.clone(),
        SignalWeights::default(),
        PositionBook::new(cfg.capacity),
        Vec::new(),
    )
}

#[test]
fn entry_then_displacement_lifecycle() {
    let cfg = test_config(1);
    let mut eng = engine(&cfg);

    // Cycle 1: modest trend entry.
    let report = eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.3, 900)]);
    assert_eq!(report.entered, vec!["BTCUSDT".to_string()]);
    assert!(eng.book().holds("BTCUSDT"));

    // Cycle 2, exactly min-hold later: stronger flow-led challenger evicts.
    let report = eng.run_cycle(5, 2200, &[flow_snapshot("SOLUSDT", 3.9, 2100)]);
    assert_eq!(report.entered, vec!["SOLUSDT".to_string()]);
    assert_eq!(report.closed.len(), 1);

    let closed = &report.closed[0];
    assert_eq!(closed.position.symbol, "BTCUSDT");
    assert!(closed.reason.starts_with("displaced_by=SOLUSDT|delta="));
    assert!(closed.reason.contains("|age_s=1200|"));
    assert!(closed.reason.contains("|thesis=flow_dominance"));

    let eval = &report.displacements[0];
    assert!(eval.allowed);
    assert_eq!(eval.block_reason, BlockReason::None);
    assert_eq!(eval.incumbent_age_secs, 1200);
}

#[test]
fn min_hold_boundary_is_inclusive() {
    let cfg = test_config(1);

    // 1199 seconds of hold: blocked.
    let mut eng = engine(&cfg);
    eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.3, 900)]);
    let report = eng.run_cycle(4, 2199, &[flow_snapshot("SOLUSDT", 3.9, 2100)]);
    assert!(report.entered.is_empty());
    assert_eq!(report.displacements[0].block_reason, BlockReason::MinHold);
    assert_eq!(report.displacements[0].incumbent_age_secs, 1199);

    // 1200 seconds: the hold rule passes and the eviction goes through.
    let mut eng = engine(&cfg);
    eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.3, 900)]);
    let report = eng.run_cycle(4, 2200, &[flow_snapshot("SOLUSDT", 3.9, 2100)]);
    assert_eq!(report.entered, vec!["SOLUSDT".to_string()]);
}

#[test]
fn small_delta_blocks_after_hold() {
    let cfg = test_config(1);
    let mut eng = engine(&cfg);
    eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.8, 900)]);

    // Challenger only marginally stronger than the incumbent's entry score.
    let report = eng.run_cycle(10, 4000, &[flow_snapshot("SOLUSDT", 2.9, 3900)]);
    assert!(report.entered.is_empty());
    let eval = &report.displacements[0];
    assert!(!eval.allowed);
    assert_eq!(eval.block_reason, BlockReason::DeltaTooSmall);
    assert!(eval.delta_score < 0.75);

    let trace = &report.traces[0];
    assert_eq!(trace.final_decision.outcome, Outcome::Blocked);
    assert_eq!(trace.final_decision.primary_reason, "at_capacity");
    assert!(trace
        .final_decision
        .secondary_reasons
        .contains(&"delta_too_small".to_string()));
}

#[test]
fn same_thesis_challenger_is_rejected() {
    let cfg = test_config(1);
    let mut eng = engine(&cfg);
    eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.3, 900)]);

    // Much stronger, but the same alpha+regime story as the incumbent.
    let report = eng.run_cycle(10, 4000, &[trend_snapshot("SOLUSDT", 3.9, 3900)]);
    assert!(report.entered.is_empty());
    let eval = &report.displacements[0];
    assert_eq!(eval.block_reason, BlockReason::NoThesisDominance);
    assert!(!eval.thesis_dominance);
    assert!(eval.delta_score >= 0.75, "delta must have passed before thesis");
}

#[test]
fn every_candidate_traced_exactly_once() {
    let cfg = test_config(2);
    let mut eng = engine(&cfg);

    let snaps = vec![
        trend_snapshot("BTCUSDT", 3.0, 900),
        trend_snapshot("ETHUSDT", 0.8, 900), // fails score gate
        trend_snapshot("SOLUSDT", 2.6, 900),
    ];
    let report = eng.run_cycle(1, 1000, &snaps);

    assert_eq!(report.traces.len(), 3);
    for trace in &report.traces {
        assert!(!trace.gates.is_empty(), "trade_intent must carry a gates map");
        assert!(!trace.final_decision.primary_reason.is_empty());
    }
    let entered = report
        .traces
        .iter()
        .filter(|t| t.final_decision.outcome == Outcome::Entered)
        .count();
    assert_eq!(entered, 2);
}

#[test]
fn shadow_variants_never_mutate_live_positions() {
    let cfg = test_config(1);
    let variants = vec![
        ShadowVariant {
            variant_id: "evict-everything".into(),
            overrides: ConfigOverrides {
                min_composite_score: Some(0.1),
                min_hold_secs: Some(0),
                min_delta_score: Some(0.0),
                require_thesis_dominance: Some(false),
                ..Default::default()
            },
        },
        ShadowVariant {
            variant_id: "enter-nothing".into(),
            overrides: ConfigOverrides { min_composite_score: Some(99.0), ..Default::default() },
        },
    ];
    let mut eng = DecisionEngine::new(
        cfg.clone(),
        SignalWeights::default(),
        PositionBook::new(1),
        variants,
    );

    eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.3, 900)]);

    // Live blocks SOL on min_hold; the aggressive variant would have evicted.
    let report = eng.run_cycle(2, 1300, &[flow_snapshot("SOLUSDT", 3.9, 1200)]);
    assert!(report.entered.is_empty());
    assert!(eng.book().holds("BTCUSDT"));
    assert_eq!(eng.book().len(), 1);

    // Scoreboards disagree with the live outcome, proving the variants ran.
    assert_eq!(report.scoreboards.len(), 2);
    let aggressive = report
        .scoreboards
        .iter()
        .find(|b| b.variant_id == "evict-everything")
        .unwrap();
    assert_eq!(aggressive.would_enter_count, 1);
    assert_eq!(aggressive.would_exit_count, 1);
    let strict = report
        .scoreboards
        .iter()
        .find(|b| b.variant_id == "enter-nothing")
        .unwrap();
    assert_eq!(strict.would_enter_count, 0);
    assert_eq!(
        strict.blocked_reason_histogram.get("score_below_threshold"),
        Some(&1)
    );
}

#[test]
fn disabled_policy_is_config_only_rollback() {
    let mut cfg = test_config(1);
    cfg.displacement_enabled = false;
    let mut eng = engine(&cfg);

    eng.run_cycle(1, 1000, &[trend_snapshot("BTCUSDT", 2.3, 900)]);
    // Min-hold violated and same thesis: with the policy off, none of that
    // blocks the swap.
    let report = eng.run_cycle(2, 1300, &[trend_snapshot("SOLUSDT", 3.9, 1200)]);
    assert_eq!(report.entered, vec!["SOLUSDT".to_string()]);
    assert!(report.displacements[0].allowed);
    assert_eq!(report.displacements[0].block_reason, BlockReason::None);
}

#[test]
fn event_stream_and_book_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("rotation.sqlite");
    let db = db_path.to_str().unwrap();

    let cfg = test_config(2);
    {
        let mut store = StateStore::new(db).unwrap();
        store.init().unwrap();

        let mut eng = engine(&cfg);
        let report = eng.run_cycle(1, 1000, &[
            trend_snapshot("BTCUSDT", 3.0, 900),
            trend_snapshot("ETHUSDT", 2.4, 900),
        ]);
        store.append_traces(&report.traces).unwrap();
        store.append_displacements(1000, 1, &report.displacements).unwrap();
        store.persist_positions(&eng.book().positions()).unwrap();
        assert_eq!(store.event_count("trade_intent").unwrap(), 2);
    }

    // Restart: restore the book from the snapshot and keep appending.
    let mut store = StateStore::new(db).unwrap();
    store.init().unwrap();
    let restored = store.load_positions().unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|p| p.side == Side::Long));

    let book = PositionBook::restore(cfg.capacity, restored).unwrap();
    let mut eng = DecisionEngine::new(cfg.clone(), SignalWeights::default(), book, Vec::new());

    let report = eng.run_cycle(10, 4000, &[flow_snapshot("SOLUSDT", 3.9, 3900)]);
    store.append_traces(&report.traces).unwrap();
    store.append_displacements(4000, 10, &report.displacements).unwrap();
    store.persist_positions(&eng.book().positions()).unwrap();

    // The eviction appended events; it never rewrote the earlier ones.
    assert_eq!(store.event_count("trade_intent").unwrap(), 3);
    assert_eq!(store.event_count("displacement_evaluated").unwrap(), 1);
    let final_positions = store.load_positions().unwrap();
    assert_eq!(final_positions.len(), 2);
    assert!(final_positions.iter().any(|p| p.symbol == "SOLUSDT"));
}
