// =============================================================================
// Range-Graduation Learner — feature importance and profitable value ranges
// =============================================================================
//
// From a partition's outcome history the learner derives which features are
// predictive and what value ranges they should sit in:
//
// Step 1 — Score every feature seen in enough vectors:
//            correlation = Pearson(feature value, per-contract P&L)
//            stability   = 1 / (1 + population variance)
//            importance  = 0.7·|correlation| + 0.3·stability
// Step 2 — Keep the top-K by importance, dropping features below the
//          correlation floor or the sample-size floor.
// Step 3 — From the profitable subset, derive
//            optimal    = [Q25, Q75]
//            acceptable = [P10, P90]
//          and classify the signal direction from the profitable vs
//          unprofitable means.
//
// A feature without enough profitable samples has no derivable ranges and is
// excluded from the published table.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graduation::stats;
use crate::memory::features::FeatureRegistry;
use crate::memory::partition::Partition;
use crate::runtime_config::RuntimeConfig;

/// Mean-difference band inside which a signal counts as neutral.
const SIGNAL_NEUTRAL_BAND: f64 = 0.001;

/// Weight of |correlation| in the importance blend.
const IMPORTANCE_CORRELATION_WEIGHT: f64 = 0.7;
/// Weight of stability in the importance blend.
const IMPORTANCE_STABILITY_WEIGHT: f64 = 0.3;

// ---------------------------------------------------------------------------
// Table model
// ---------------------------------------------------------------------------

/// Closed value interval, `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Closed-interval membership.
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn center(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    /// Distance from `v` to the nearest boundary of the interval, zero when
    /// inside.
    pub fn distance_to(&self, v: f64) -> f64 {
        if v < self.min {
            self.min - v
        } else if v > self.max {
            v - self.max
        } else {
            0.0
        }
    }
}

/// Direction in which a feature predicts profit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureSignal {
    HigherIsBetter,
    LowerIsBetter,
    Neutral,
    InsufficientData,
}

/// One graduated feature within a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraduatedFeature {
    pub name: String,
    pub importance: f64,
    pub correlation: f64,
    pub stability: f64,
    pub optimal_range: ValueRange,
    pub acceptable_range: ValueRange,
    pub profitable_mean: f64,
    pub unprofitable_mean: f64,
    pub signal: FeatureSignal,
    pub sample_size: usize,
}

/// Published per-partition graduation table. Immutable once built; the
/// memory manager swaps whole tables on recompute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraduationTable {
    pub instrument: String,
    pub direction: String,
    pub features: Vec<GraduatedFeature>,
    pub vector_count: usize,
    pub profitable_count: usize,
    pub unprofitable_count: usize,
    pub win_rate: f64,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

impl GraduationTable {
    pub fn feature(&self, name: &str) -> Option<&GraduatedFeature> {
        self.features.iter().find(|f| f.name == name)
    }
}

// ---------------------------------------------------------------------------
// Learner
// ---------------------------------------------------------------------------

/// Build a graduation table for `partition`, or `None` when the partition
/// has too few training vectors. `registry` must be the snapshot registry
/// the partition's dense arrays were built against.
pub fn build_table(
    partition: &Partition,
    registry: &FeatureRegistry,
    config: &RuntimeConfig,
    version: u64,
) -> Option<GraduationTable> {
    let vectors: Vec<_> = partition.training_vectors().collect();
    if vectors.len() < config.min_partition_vectors {
        return None;
    }

    let pnls: Vec<f64> = vectors.iter().map(|v| v.outcome.per_contract_pnl()).collect();
    let profitable_count = vectors.iter().filter(|v| v.outcome.is_profitable()).count();
    let unprofitable_count = vectors.len() - profitable_count;
    let win_count = vectors.iter().filter(|v| v.outcome.is_win()).count();

    // --- Score every feature with enough samples -----------------------------
    let mut scored: Vec<ScoredFeature> = Vec::new();

    for id in 0..registry.len() {
        let id = id as u16;
        let mut values = Vec::with_capacity(vectors.len());
        let mut paired_pnls = Vec::with_capacity(vectors.len());
        for (vector, pnl) in vectors.iter().zip(pnls.iter()) {
            if let Some(v) = vector.value(id) {
                values.push(v);
                paired_pnls.push(*pnl);
            }
        }

        if values.len() < config.min_feature_samples {
            continue;
        }

        let Some(correlation) = stats::pearson(&values, &paired_pnls) else {
            continue;
        };
        let variance = stats::population_variance(&values).unwrap_or(0.0);
        let stability = if variance > 0.0 { 1.0 / (1.0 + variance) } else { 1.0 };
        let importance = IMPORTANCE_CORRELATION_WEIGHT * correlation.abs()
            + IMPORTANCE_STABILITY_WEIGHT * stability;

        if correlation.abs() < config.min_correlation
            || values.len() < config.min_selection_samples
        {
            continue;
        }

        scored.push(ScoredFeature {
            id,
            correlation,
            stability,
            importance,
            sample_size: values.len(),
        });
    }

    // --- Top-K by importance --------------------------------------------------
    scored.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .expect("importance is finite")
    });
    scored.truncate(config.max_graduated_features);

    // --- Derive ranges from the profitable subset ------------------------------
    let mut features = Vec::with_capacity(scored.len());
    for sf in scored {
        let Some(name) = registry.name(sf.id).map(str::to_string) else {
            continue;
        };

        let mut profitable_values = Vec::new();
        let mut unprofitable_values = Vec::new();
        for vector in &vectors {
            let Some(v) = vector.value(sf.id) else { continue };
            if vector.outcome.is_profitable() {
                profitable_values.push(v);
            } else {
                unprofitable_values.push(v);
            }
        }

        if profitable_values.len() < config.min_profitable_samples {
            continue;
        }

        let sorted = stats::sorted_finite(&profitable_values);
        let optimal = ValueRange::new(
            stats::quantile_sorted(&sorted, 0.25).unwrap_or(sorted[0]),
            stats::quantile_sorted(&sorted, 0.75).unwrap_or(sorted[sorted.len() - 1]),
        );
        let acceptable = ValueRange::new(
            stats::quantile_sorted(&sorted, 0.10).unwrap_or(sorted[0]),
            stats::quantile_sorted(&sorted, 0.90).unwrap_or(sorted[sorted.len() - 1]),
        );

        let profitable_mean = stats::mean(&profitable_values).unwrap_or(0.0);
        let (unprofitable_mean, signal) = match stats::mean(&unprofitable_values) {
            Some(um) => {
                let diff = profitable_mean - um;
                let signal = if diff > SIGNAL_NEUTRAL_BAND {
                    FeatureSignal::HigherIsBetter
                } else if diff < -SIGNAL_NEUTRAL_BAND {
                    FeatureSignal::LowerIsBetter
                } else {
                    FeatureSignal::Neutral
                };
                (um, signal)
            }
            None => (0.0, FeatureSignal::InsufficientData),
        };

        features.push(GraduatedFeature {
            name,
            importance: sf.importance,
            correlation: sf.correlation,
            stability: sf.stability,
            optimal_range: optimal,
            acceptable_range: acceptable,
            profitable_mean,
            unprofitable_mean,
            signal,
            sample_size: sf.sample_size,
        });
    }

    let table = GraduationTable {
        instrument: partition.key.instrument.clone(),
        direction: partition.key.direction.to_string(),
        features,
        vector_count: vectors.len(),
        profitable_count,
        unprofitable_count,
        win_rate: if vectors.is_empty() {
            0.0
        } else {
            win_count as f64 / vectors.len() as f64
        },
        version,
        last_updated: Utc::now(),
    };

    debug!(
        partition = %partition.key,
        features = table.features.len(),
        vectors = table.vector_count,
        win_rate = table.win_rate,
        "graduation table built"
    );

    Some(table)
}

struct ScoredFeature {
    id: u16,
    correlation: f64,
    stability: f64,
    importance: f64,
    sample_size: usize,
}
