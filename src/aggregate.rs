//! Signal aggregation: feature snapshot → scored candidate.
//!
//! Pure per-symbol function. Each namespaced feature lands in one of five
//! fixed layers; a layer's score is the confidence-weighted mean of its
//! members' signed scores, and the composite is the weight-renormalized
//! combination of the layers that were actually present. Stale or missing
//! inputs are omitted with an explicit marker in the summary — never
//! zero-filled, because a silent zero reads as neutral data downstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{Config, SignalWeights};
use crate::features::FeatureSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Alpha,
    Flow,
    Regime,
    Volatility,
    DarkPool,
}

impl Layer {
    pub const ALL: [Layer; 5] = [
        Layer::Alpha,
        Layer::Flow,
        Layer::Regime,
        Layer::Volatility,
        Layer::DarkPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Alpha => "alpha",
            Layer::Flow => "flow",
            Layer::Regime => "regime",
            Layer::Volatility => "volatility",
            Layer::DarkPool => "dark_pool",
        }
    }

    /// Layer from a namespaced feature name (`"flow.cvd_imbalance"` → Flow).
    pub fn from_feature_name(name: &str) -> Option<Layer> {
        let prefix = name.split('.').next().unwrap_or("");
        match prefix {
            "alpha" => Some(Layer::Alpha),
            "flow" => Some(Layer::Flow),
            "regime" => Some(Layer::Regime),
            "volatility" => Some(Layer::Volatility),
            "dark_pool" => Some(Layer::DarkPool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

/// One signal as it entered the composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSignal {
    pub name: String,
    pub value: f64,
    pub score: f64,
    pub direction: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    Stale,
    Missing,
}

/// Explicit marker for a layer that did not contribute to the composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Omission {
    pub layer: Layer,
    pub reason: OmissionReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub weight_version: String,
    /// Signed per-layer scores for layers that contributed.
    pub layer_scores: BTreeMap<Layer, f64>,
    pub omitted: Vec<Omission>,
    /// Individual signals dropped for staleness inside otherwise-live layers.
    pub stale_signals: Vec<String>,
}

/// Immutable per-cycle scoring result for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub side: Side,
    pub signal_layers: BTreeMap<Layer, Vec<LayerSignal>>,
    /// Confident signals pointing against the final side.
    pub opposing_signals: Vec<String>,
    pub composite_score: f64,
    pub direction_confidence: f64,
    pub aggregation: AggregationSummary,
}

impl Candidate {
    /// Layers carrying at least `share` of the total absolute weighted
    /// contribution. These become the entry thesis on open.
    pub fn dominant_layers(&self, weights: &SignalWeights, share: f64) -> Vec<Layer> {
        let contributions: Vec<(Layer, f64)> = self
            .aggregation
            .layer_scores
            .iter()
            .map(|(layer, score)| (*layer, (weights.get(*layer) * score).abs()))
            .collect();
        let total: f64 = contributions.iter().map(|(_, c)| c).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        contributions
            .into_iter()
            .filter(|(_, c)| c / total >= share)
            .map(|(layer, _)| layer)
            .collect()
    }

    pub fn thesis_tags(&self, weights: &SignalWeights, share: f64) -> Vec<String> {
        self.dominant_layers(weights, share)
            .into_iter()
            .map(|l| l.as_str().to_string())
            .collect()
    }
}

/// Score one snapshot. Pure: same inputs, same candidate.
pub fn aggregate(
    snapshot: &FeatureSnapshot,
    weights: &SignalWeights,
    cfg: &Config,
    now_ts: u64,
) -> Candidate {
    let snapshot_stale = snapshot.is_stale(now_ts, cfg.stale_after_secs);

    let mut signal_layers: BTreeMap<Layer, Vec<LayerSignal>> = BTreeMap::new();
    let mut stale_signals: Vec<String> = Vec::new();
    let mut saw_any: BTreeMap<Layer, bool> = BTreeMap::new();

    for (name, feature) in &snapshot.features {
        let layer = match Layer::from_feature_name(name) {
            Some(layer) => layer,
            None => {
                // Unknown namespace: drop, but leave a visible marker.
                stale_signals.push(name.clone());
                continue;
            }
        };
        saw_any.insert(layer, true);
        if snapshot_stale || feature.stale {
            stale_signals.push(name.clone());
            continue;
        }
        signal_layers.entry(layer).or_default().push(LayerSignal {
            name: name.clone(),
            value: feature.value,
            score: feature.score,
            direction: feature.direction,
            confidence: feature.confidence,
        });
    }

    // Per-layer signed score: confidence-weighted mean of score * direction.
    let mut layer_scores: BTreeMap<Layer, f64> = BTreeMap::new();
    for (layer, signals) in &signal_layers {
        let conf_total: f64 = signals.iter().map(|s| s.confidence).sum();
        if conf_total <= 0.0 {
            continue;
        }
        let signed: f64 = signals
            .iter()
            .map(|s| s.score * s.direction * s.confidence)
            .sum::<f64>()
            / conf_total;
        layer_scores.insert(*layer, signed);
    }

    let mut omitted: Vec<Omission> = Vec::new();
    for layer in Layer::ALL {
        if layer_scores.contains_key(&layer) {
            continue;
        }
        let reason = if saw_any.get(&layer).copied().unwrap_or(false) {
            OmissionReason::Stale
        } else {
            OmissionReason::Missing
        };
        omitted.push(Omission { layer, reason });
    }

    // Composite: renormalize over present-layer weights so omission does not
    // masquerade as a low score.
    let present_weight: f64 = layer_scores.keys().map(|l| weights.get(*l)).sum();
    let composite_signed = if present_weight > 0.0 {
        layer_scores
            .iter()
            .map(|(l, s)| weights.get(*l) * s)
            .sum::<f64>()
            / present_weight
    } else {
        0.0
    };

    let side = if composite_signed >= 0.0 { Side::Long } else { Side::Short };

    // Direction confidence: share of signal confidence agreeing with the side.
    let mut agree = 0.0;
    let mut directional_total = 0.0;
    let mut opposing_signals: Vec<String> = Vec::new();
    for signals in signal_layers.values() {
        for s in signals {
            if s.direction == 0.0 {
                continue;
            }
            directional_total += s.confidence;
            if s.direction * side.sign() > 0.0 {
                agree += s.confidence;
            } else {
                opposing_signals.push(s.name.clone());
            }
        }
    }
    let direction_confidence = if directional_total > 0.0 { agree / directional_total } else { 0.0 };
    opposing_signals.sort();

    Candidate {
        symbol: snapshot.symbol.clone(),
        side,
        signal_layers,
        opposing_signals,
        composite_score: composite_signed.abs(),
        direction_confidence,
        aggregation: AggregationSummary {
            weight_version: weights.fingerprint(),
            layer_scores,
            omitted,
            stale_signals,
        },
    }
}
