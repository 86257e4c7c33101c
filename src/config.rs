//! Runtime configuration for the decision core.
//!
//! All thresholds and flags are env-overridable with hard defaults, validated
//! once at startup (invalid values refuse to run a cycle rather than silently
//! falling back), and fingerprinted into a version string so every trace can
//! name the exact config it was evaluated under. Shadow variants hold their
//! own derived copy; nothing here is process-global.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregate::Layer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Symbols scored each cycle.
    pub universe: Vec<String>,
    pub cycle_secs: u64,
    /// Maximum simultaneously open positions.
    pub capacity: usize,
    pub min_composite_score: f64,
    pub max_volatility_score: f64,
    pub momentum_floor: f64,
    pub min_direction_confidence: f64,
    /// Confidence at which an opposing signal becomes disqualifying.
    pub opposing_veto_confidence: f64,
    /// Share of total weighted contribution a layer needs to count as
    /// dominant in an entry thesis.
    pub dominance_share: f64,
    /// Snapshot older than this degrades every layer to omitted.
    pub stale_after_secs: u64,
    pub displacement_enabled: bool,
    pub min_hold_secs: u64,
    pub min_delta_score: f64,
    pub require_thesis_dominance: bool,
    pub log_every_decision: bool,
    pub shadow_window_cycles: u64,
    pub sqlite_path: String,
    pub features_path: String,
    pub kill_file: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            universe: std::env::var("UNIVERSE")
                .unwrap_or_else(|_| "BTCUSDT,ETHUSDT,SOLUSDT".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            cycle_secs: env_parse("CYCLE_SECS", 300),
            capacity: env_parse("CAPACITY", 5),
            min_composite_score: env_parse("MIN_COMPOSITE_SCORE", 2.0),
            max_volatility_score: env_parse("MAX_VOL_SCORE", 3.0),
            momentum_floor: env_parse("MOMENTUM_FLOOR", 0.25),
            min_direction_confidence: env_parse("MIN_DIR_CONFIDENCE", 0.55),
            opposing_veto_confidence: env_parse("OPPOSING_VETO_CONFIDENCE", 0.6),
            dominance_share: env_parse("DOMINANCE_SHARE", 0.35),
            stale_after_secs: env_parse("STALE_AFTER_SECS", 900),
            displacement_enabled: env_flag("DISPLACEMENT_ENABLED", true),
            min_hold_secs: env_parse("MIN_HOLD_SECS", 1200),
            min_delta_score: env_parse("MIN_DELTA_SCORE", 0.75),
            require_thesis_dominance: env_flag("REQUIRE_THESIS_DOMINANCE", true),
            log_every_decision: env_flag("LOG_EVERY_DECISION", true),
            shadow_window_cycles: env_parse("SHADOW_WINDOW_CYCLES", 12),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./rotation.sqlite".to_string()),
            features_path: std::env::var("FEATURES_PATH").unwrap_or_else(|_| "./features.json".to_string()),
            kill_file: std::env::var("KILL_FILE").unwrap_or_else(|_| "/tmp/STOP".to_string()),
        }
    }

    /// Reject a config that would make the cycle misbehave. Called once at
    /// startup; failure is fatal rather than defaulting.
    pub fn validate(&self) -> Result<()> {
        if self.universe.is_empty() {
            bail!("universe is empty");
        }
        if self.cycle_secs == 0 {
            bail!("cycle_secs must be >= 1");
        }
        if self.capacity == 0 {
            bail!("capacity must be >= 1");
        }
        for (name, v) in [
            ("min_composite_score", self.min_composite_score),
            ("max_volatility_score", self.max_volatility_score),
            ("momentum_floor", self.momentum_floor),
            ("min_delta_score", self.min_delta_score),
        ] {
            if !v.is_finite() || v < 0.0 {
                bail!("{} must be finite and non-negative, got {}", name, v);
            }
        }
        for (name, v) in [
            ("min_direction_confidence", self.min_direction_confidence),
            ("opposing_veto_confidence", self.opposing_veto_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{} must be in [0, 1], got {}", name, v);
            }
        }
        if !(self.dominance_share > 0.0 && self.dominance_share <= 1.0) {
            bail!("dominance_share must be in (0, 1], got {}", self.dominance_share);
        }
        if self.shadow_window_cycles == 0 {
            bail!("shadow_window_cycles must be >= 1");
        }
        Ok(())
    }

    /// Short content hash naming this exact config in traces and events.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..6])
    }

    pub fn sleep_until_next_cycle(&self, now_ts: u64) -> u64 {
        let next = ((now_ts / self.cycle_secs) + 1) * self.cycle_secs;
        next.saturating_sub(now_ts)
    }
}

/// Per-layer weights for the composite. An explicit value passed into each
/// cycle, loadable from the weight table, so live and shadow evaluations can
/// hold different versions at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    pub alpha: f64,
    pub flow: f64,
    pub regime: f64,
    pub volatility: f64,
    pub dark_pool: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            flow: 0.6,
            regime: 0.8,
            volatility: 0.4,
            dark_pool: 0.3,
        }
    }
}

impl SignalWeights {
    pub fn get(&self, layer: Layer) -> f64 {
        match layer {
            Layer::Alpha => self.alpha,
            Layer::Flow => self.flow,
            Layer::Regime => self.regime,
            Layer::Volatility => self.volatility,
            Layer::DarkPool => self.dark_pool,
        }
    }

    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..4])
    }
}

/// Overrides a shadow variant applies on top of the live config. Only the
/// knobs a variant may legitimately differ in; everything else stays live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub weights: Option<SignalWeights>,
    pub min_composite_score: Option<f64>,
    pub momentum_floor: Option<f64>,
    pub min_direction_confidence: Option<f64>,
    pub min_hold_secs: Option<u64>,
    pub min_delta_score: Option<f64>,
    pub displacement_enabled: Option<bool>,
    pub require_thesis_dominance: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(&self, cfg: &Config, weights: &SignalWeights) -> (Config, SignalWeights) {
        let mut out = cfg.clone();
        if let Some(v) = self.min_composite_score {
            out.min_composite_score = v;
        }
        if let Some(v) = self.momentum_floor {
            out.momentum_floor = v;
        }
        if let Some(v) = self.min_direction_confidence {
            out.min_direction_confidence = v;
        }
        if let Some(v) = self.min_hold_secs {
            out.min_hold_secs = v;
        }
        if let Some(v) = self.min_delta_score {
            out.min_delta_score = v;
        }
        if let Some(v) = self.displacement_enabled {
            out.displacement_enabled = v;
        }
        if let Some(v) = self.require_thesis_dominance {
            out.require_thesis_dominance = v;
        }
        (out, self.weights.unwrap_or(*weights))
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_config() -> Config {
        Config {
            universe: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            cycle_secs: 300,
            capacity: 2,
            min_composite_score: 2.0,
            max_volatility_score: 3.0,
            momentum_floor: 0.25,
            min_direction_confidence: 0.55,
            opposing_veto_confidence: 0.6,
            dominance_share: 0.35,
            stale_after_secs: 900,
            displacement_enabled: true,
            min_hold_secs: 1200,
            min_delta_score: 0.75,
            require_thesis_dominance: true,
            log_every_decision: true,
            shadow_window_cycles: 12,
            sqlite_path: String::new(),
            features_path: String::new(),
            kill_file: "/tmp/nonexistent_kill_file".into(),
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let cfg = Config { capacity: 0, ..test_config() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_delta() {
        let cfg = Config { min_delta_score: -0.5, ..test_config() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nan_threshold() {
        let cfg = Config { min_composite_score: f64::NAN, ..test_config() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_confidence_out_of_range() {
        let cfg = Config { min_direction_confidence: 1.5, ..test_config() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = test_config();
        let b = test_config();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Config { min_delta_score: 0.9, ..test_config() };
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_sleep_until_next_cycle_boundary() {
        let cfg = test_config();
        assert_eq!(cfg.sleep_until_next_cycle(300), 300);
        assert_eq!(cfg.sleep_until_next_cycle(301), 299);
        assert_eq!(cfg.sleep_until_next_cycle(599), 1);
        assert_eq!(cfg.sleep_until_next_cycle(0), 300);
    }

    #[test]
    fn test_overrides_apply_partial() {
        let cfg = test_config();
        let weights = SignalWeights::default();
        let overrides = ConfigOverrides {
            min_delta_score: Some(1.5),
            displacement_enabled: Some(false),
            ..Default::default()
        };
        let (vcfg, vweights) = overrides.apply(&cfg, &weights);
        assert_eq!(vcfg.min_delta_score, 1.5);
        assert!(!vcfg.displacement_enabled);
        // Untouched knobs stay live
        assert_eq!(vcfg.min_hold_secs, cfg.min_hold_secs);
        assert_eq!(vweights, weights);
    }
}
