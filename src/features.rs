//! Feature snapshot contract.
//!
//! Ingestion and caching live outside this crate; the decision core consumes
//! their output through [`SnapshotProvider`]. A snapshot is a bag of
//! namespaced signal values with explicit per-feature staleness — the core
//! never sees raw market data, only scored features, and never blocks a cycle
//! waiting for fresher ones.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One scored signal value from an upstream source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureValue {
    /// Raw observed value (units are source-specific).
    pub value: f64,
    /// Source-normalized strength, non-negative.
    pub score: f64,
    /// -1.0 bearish, +1.0 bullish, 0.0 neutral.
    pub direction: f64,
    /// 0..1 source confidence.
    pub confidence: f64,
    /// Set by the provider when the upstream refresh missed its deadline.
    pub stale: bool,
}

/// Per-symbol per-cycle feature map. Keys are namespaced by signal layer,
/// e.g. `alpha.trend_break`, `flow.cvd_imbalance`, `dark_pool.block_prints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub symbol: String,
    /// When the provider assembled this snapshot (0 = never fetched).
    pub fetch_ts: u64,
    pub features: BTreeMap<String, FeatureValue>,
}

impl FeatureSnapshot {
    pub fn new(symbol: &str, fetch_ts: u64) -> Self {
        Self { symbol: symbol.to_string(), fetch_ts, features: BTreeMap::new() }
    }

    pub fn with(mut self, name: &str, v: FeatureValue) -> Self {
        self.features.insert(name.to_string(), v);
        self
    }

    pub fn age_secs(&self, now_ts: u64) -> u64 {
        if self.fetch_ts == 0 {
            u64::MAX
        } else {
            now_ts.saturating_sub(self.fetch_ts)
        }
    }

    /// Whole-snapshot staleness. Boundary inclusive: exactly max_age is fresh.
    pub fn is_stale(&self, now_ts: u64, max_age_secs: u64) -> bool {
        self.age_secs(now_ts) > max_age_secs
    }
}

/// Narrow contract to the external ingestion layer.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_universe(&self, symbols: &[String]) -> Result<Vec<FeatureSnapshot>>;
}

/// Reads snapshots from a JSON file the ingestion process rewrites
/// asynchronously. Eventually consistent by construction: a missing or
/// partial file yields whatever parses, never an aborted cycle.
pub struct FileProvider {
    path: String,
}

impl FileProvider {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string() }
    }
}

#[async_trait]
impl SnapshotProvider for FileProvider {
    async fn fetch_universe(&self, symbols: &[String]) -> Result<Vec<FeatureSnapshot>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Ok(Vec::new()),
        };
        let all: Vec<FeatureSnapshot> = serde_json::from_str(&raw).unwrap_or_default();
        Ok(all.into_iter().filter(|s| symbols.contains(&s.symbol)).collect())
    }
}

/// In-memory provider for tests and replays.
#[derive(Default)]
pub struct StaticProvider {
    snapshots: HashMap<String, FeatureSnapshot>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, snapshot: FeatureSnapshot) {
        self.snapshots.insert(snapshot.symbol.clone(), snapshot);
    }
}

#[async_trait]
impl SnapshotProvider for StaticProvider {
    async fn fetch_universe(&self, symbols: &[String]) -> Result<Vec<FeatureSnapshot>> {
        Ok(symbols.iter().filter_map(|s| self.snapshots.get(s).cloned()).collect())
    }
}
