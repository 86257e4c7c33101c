use anyhow::Result;
use serde_json::json;
use tokio::time::{sleep, Duration};

use rotationfx::config::{now_ts, Config, ConfigOverrides, SignalWeights};
use rotationfx::engine::DecisionEngine;
use rotationfx::features::{FileProvider, SnapshotProvider};
use rotationfx::logging::{log, obj, v_str, Level, Subsystem};
use rotationfx::positions::PositionBook;
use rotationfx::shadow::ShadowVariant;
use rotationfx::storage::StateStore;

/// Default shadow roster: a rollback variant and two threshold probes.
fn default_variants() -> Vec<ShadowVariant> {
    vec![
        ShadowVariant {
            variant_id: "no-displacement".into(),
            overrides: ConfigOverrides {
                displacement_enabled: Some(false),
                ..Default::default()
            },
        },
        ShadowVariant {
            variant_id: "delta-1.25".into(),
            overrides: ConfigOverrides { min_delta_score: Some(1.25), ..Default::default() },
        },
        ShadowVariant {
            variant_id: "hold-2400".into(),
            overrides: ConfigOverrides { min_hold_secs: Some(2400), ..Default::default() },
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    // Invalid thresholds are fatal here, before any cycle runs.
    cfg.validate()?;

    let mut store = StateStore::new(&cfg.sqlite_path)?;
    store.init()?;

    let weights = store.load_weights()?.unwrap_or_else(SignalWeights::default);
    let restored = store.load_positions()?;
    let book = PositionBook::restore(cfg.capacity, restored)?;
    if !book.is_empty() {
        log(
            Level::Info,
            Subsystem::System,
            "book_restored",
            obj(&[("open_positions", json!(book.len()))]),
        );
    }

    let provider = FileProvider::new(&cfg.features_path);
    let mut engine = DecisionEngine::new(cfg.clone(), weights, book, default_variants());

    log(
        Level::Info,
        Subsystem::System,
        "startup",
        obj(&[
            ("msg", v_str("decision loop starting")),
            ("universe", json!(cfg.universe)),
            ("capacity", json!(cfg.capacity)),
            ("config_version", v_str(engine.config_version())),
        ]),
    );

    loop {
        let now = now_ts();
        let cycle_id = now / cfg.cycle_secs;

        // The weight table is maintained externally; pick up a newly
        // published version before scoring.
        if let Some(weights) = store.load_weights()? {
            engine.update_weights(weights);
        }

        let snapshots = provider.fetch_universe(&cfg.universe).await?;
        let report = engine.run_cycle(cycle_id, now, &snapshots);

        store.append_traces(&report.traces)?;
        store.append_displacements(now, cycle_id, &report.displacements)?;
        store.append_scoreboards(now, &report.scoreboards)?;
        store.persist_positions(&engine.book().positions())?;

        let sleep_for = cfg.sleep_until_next_cycle(now);
        sleep(Duration::from_secs(sleep_for)).await;
    }
}
