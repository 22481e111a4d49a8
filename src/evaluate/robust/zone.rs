// =============================================================================
// Robust Zones — wide profitable regions prioritising stability
// =============================================================================
//
// A zone prefers a wide region that stays profitable over a tight pocket of
// peak performance. Construction mirrors graduation ranges (quartile core,
// decile shell) but from the rolling recent window, and each feature carries
// a tolerance (the profitable stdev) that shapes the out-of-zone decay.
//
// Robustness blends four normalised components:
//   0.3 · profitability + 0.4 · variability + 0.2 · consistency + 0.1 · samples
// where variability rewards zones covering a wide share of the observed
// value range — wider is better.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graduation::stats;
use crate::graduation::ValueRange;
use crate::memory::VectorRecord;

/// Trades must clear this per-contract P&L to count toward the
/// profitability metric.
const PROFIT_CLEAR_THRESHOLD: f64 = 10.0;
/// Per-contract profit at which the profitability component saturates.
const PROFITABILITY_SCALE: f64 = 50.0;
/// Profitable samples required per feature before ranges are derived.
const MIN_PROFITABLE_SAMPLES: usize = 10;

/// Weights of the robustness blend.
const W_PROFITABILITY: f64 = 0.3;
const W_VARIABILITY: f64 = 0.4;
const W_CONSISTENCY: f64 = 0.2;
const W_SAMPLE_BONUS: f64 = 0.1;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Learned region for one feature.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureZone {
    pub optimal: ValueRange,
    pub acceptable: ValueRange,
    /// Profitable-subset stdev; shapes the out-of-zone decay.
    pub tolerance: f64,
    pub sample_size: usize,
}

/// Normalised robustness components, kept for the state surface.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneMetrics {
    pub profitability: f64,
    pub variability: f64,
    pub consistency: f64,
    pub sample_bonus: f64,
}

/// A robust zone for one (instrument, direction[, entry type]) key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobustZone {
    pub feature_ranges: HashMap<String, FeatureZone>,
    pub robustness_score: f64,
    pub sample_size: usize,
    pub description: String,
    pub metrics: ZoneMetrics,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_adjustment: Option<String>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build a zone from a rolling window of outcomes. Returns `None` when no
/// feature reaches the profitable-sample floor.
pub fn build_zone(window: &[Arc<VectorRecord>], now: DateTime<Utc>) -> Option<RobustZone> {
    let profitable: Vec<&Arc<VectorRecord>> = window
        .iter()
        .filter(|v| v.outcome.is_profitable())
        .collect();

    if profitable.len() < MIN_PROFITABLE_SAMPLES {
        return None;
    }

    // Collect per-feature profitable values plus the full observed span.
    let mut profitable_values: HashMap<&str, Vec<f64>> = HashMap::new();
    let mut observed_span: HashMap<&str, (f64, f64)> = HashMap::new();

    for record in window {
        for (name, value) in &record.outcome.features {
            if !value.is_finite() {
                continue;
            }
            let span = observed_span
                .entry(name.as_str())
                .or_insert((*value, *value));
            span.0 = span.0.min(*value);
            span.1 = span.1.max(*value);

            if record.outcome.is_profitable() {
                profitable_values
                    .entry(name.as_str())
                    .or_default()
                    .push(*value);
            }
        }
    }

    let mut feature_ranges = HashMap::new();
    let mut width_shares = Vec::new();

    for (name, values) in &profitable_values {
        if values.len() < MIN_PROFITABLE_SAMPLES {
            continue;
        }
        let sorted = stats::sorted_finite(values);
        let optimal = ValueRange::new(
            stats::quantile_sorted(&sorted, 0.25).unwrap_or(sorted[0]),
            stats::quantile_sorted(&sorted, 0.75).unwrap_or(sorted[sorted.len() - 1]),
        );
        let acceptable = ValueRange::new(
            stats::quantile_sorted(&sorted, 0.10).unwrap_or(sorted[0]),
            stats::quantile_sorted(&sorted, 0.90).unwrap_or(sorted[sorted.len() - 1]),
        );
        let tolerance = stats::std_dev(values).unwrap_or(0.0);

        if let Some((lo, hi)) = observed_span.get(name) {
            let total = hi - lo;
            if total > 0.0 {
                width_shares.push((acceptable.width() / total).clamp(0.0, 1.0));
            }
        }

        feature_ranges.insert(
            name.to_string(),
            FeatureZone {
                optimal,
                acceptable,
                tolerance,
                sample_size: values.len(),
            },
        );
    }

    if feature_ranges.is_empty() {
        return None;
    }

    // --- Robustness components -------------------------------------------
    let clearing: Vec<f64> = window
        .iter()
        .map(|v| v.outcome.per_contract_pnl())
        .filter(|p| *p > PROFIT_CLEAR_THRESHOLD)
        .collect();

    let profitability = stats::mean(&clearing)
        .map(|m| (m / PROFITABILITY_SCALE).clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let variability = stats::mean(&width_shares).unwrap_or(0.0);

    let consistency = match (stats::mean(&clearing), stats::std_dev(&clearing)) {
        (Some(mu), Some(sigma)) if mu > 0.0 => (1.0 - sigma / mu).max(0.0),
        _ => 0.0,
    };

    let sample_bonus = (profitable.len() as f64 / 100.0).min(1.0);

    let robustness_score = (W_PROFITABILITY * profitability
        + W_VARIABILITY * variability
        + W_CONSISTENCY * consistency
        + W_SAMPLE_BONUS * sample_bonus)
        .clamp(0.0, 1.0);

    let description = format!(
        "{} feature zone from {} trades ({} profitable)",
        feature_ranges.len(),
        window.len(),
        profitable.len()
    );

    Some(RobustZone {
        feature_ranges,
        robustness_score,
        sample_size: window.len(),
        description,
        metrics: ZoneMetrics {
            profitability,
            variability,
            consistency,
            sample_bonus,
        },
        last_updated: now,
        last_adjustment: None,
    })
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Score a live feature map against the zone: 1.0 inside the optimal core,
/// 0.6 inside the acceptable shell, exponential tolerance decay outside.
/// Mean across the features present in both; 0.5 when none match.
pub fn membership(zone: &RobustZone, features: &HashMap<String, f64>) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;

    for (name, fz) in &zone.feature_ranges {
        let Some(value) = features.get(name).copied().filter(|v| v.is_finite()) else {
            continue;
        };
        let score = if fz.optimal.contains(value) {
            1.0
        } else if fz.acceptable.contains(value) {
            0.6
        } else if fz.tolerance > 0.0 {
            let dist = fz.acceptable.distance_to(value);
            (0.5 * (-dist / fz.tolerance).exp()).max(0.1)
        } else {
            0.1
        };
        total += score;
        count += 1;
    }

    if count == 0 {
        0.5
    } else {
        total / count as f64
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::memory::features::FeatureRegistry;
    use crate::types::{Direction, TradeOutcome};

    fn record(id: usize, pnl: f64, edge: f64) -> Arc<VectorRecord> {
        let mut features = HashMap::new();
        features.insert("edge".to_string(), edge);
        let outcome = TradeOutcome {
            entry_signal_id: format!("sig-{id}"),
            instrument: "MGC".to_string(),
            direction: Direction::Long,
            entry_type: None,
            timestamp: Utc.with_ymd_and_hms(2025, 7, 1, 9, 0, 0).unwrap()
                + chrono::Duration::minutes(id as i64),
            data_type: None,
            features,
            pnl,
            pnl_per_contract: Some(pnl),
            max_profit: None,
            max_loss: None,
            exit_reason: None,
            was_good_exit: None,
            stop_loss: None,
            take_profit: None,
        };
        Arc::new(VectorRecord::new(outcome, &FeatureRegistry::default()))
    }

    /// 30-trade window: 20 winners with `edge` spread 40..60, 10 losers low.
    fn window() -> Vec<Arc<VectorRecord>> {
        let mut w = Vec::new();
        for i in 0..20 {
            w.push(record(i, 25.0 + (i % 5) as f64, 40.0 + i as f64));
        }
        for i in 20..30 {
            w.push(record(i, -12.0, 5.0 + (i % 3) as f64));
        }
        w
    }

    // ---- construction ----------------------------------------------------

    #[test]
    fn zone_builds_with_nested_ranges() {
        let zone = build_zone(&window(), Utc::now()).unwrap();
        let fz = &zone.feature_ranges["edge"];
        assert!(fz.optimal.min <= fz.optimal.max);
        assert!(fz.acceptable.min <= fz.optimal.min);
        assert!(fz.optimal.max <= fz.acceptable.max);
        assert!(fz.tolerance > 0.0);
        assert!(fz.sample_size >= 10);
        assert!((0.0..=1.0).contains(&zone.robustness_score));
        assert_eq!(zone.sample_size, 30);
    }

    #[test]
    fn too_few_profitable_trades_yield_no_zone() {
        let mut w: Vec<Arc<VectorRecord>> = (0..9)
            .map(|i| record(i, 20.0, 50.0 + i as f64))
            .collect();
        w.extend((9..30).map(|i| record(i, -10.0, 10.0)));
        assert!(build_zone(&w, Utc::now()).is_none());
    }

    #[test]
    fn robustness_components_are_normalised() {
        let zone = build_zone(&window(), Utc::now()).unwrap();
        for m in [
            zone.metrics.profitability,
            zone.metrics.variability,
            zone.metrics.consistency,
            zone.metrics.sample_bonus,
        ] {
            assert!((0.0..=1.0).contains(&m), "metric out of range: {m}");
        }
        // 20 profitable of a possible 100.
        assert!((zone.metrics.sample_bonus - 0.2).abs() < 1e-9);
    }

    // ---- membership ------------------------------------------------------

    #[test]
    fn membership_bands() {
        let zone = build_zone(&window(), Utc::now()).unwrap();
        let fz = zone.feature_ranges["edge"].clone();

        let at = |v: f64| {
            let mut m = HashMap::new();
            m.insert("edge".to_string(), v);
            membership(&zone, &m)
        };

        assert_eq!(at(fz.optimal.center()), 1.0);
        // Inside acceptable but outside optimal.
        let shell = (fz.acceptable.min + fz.optimal.min) / 2.0;
        if !fz.optimal.contains(shell) {
            assert_eq!(at(shell), 0.6);
        }
        // Far outside decays to the floor.
        assert!((at(fz.acceptable.max + fz.tolerance * 50.0) - 0.1).abs() < 1e-9);
        // Just outside sits between floor and shell score.
        let just_out = at(fz.acceptable.max + fz.tolerance * 0.1);
        assert!(just_out > 0.1 && just_out < 0.6);
    }

    #[test]
    fn membership_without_matches_is_neutral() {
        let zone = build_zone(&window(), Utc::now()).unwrap();
        assert_eq!(membership(&zone, &HashMap::new()), 0.5);
    }
}
