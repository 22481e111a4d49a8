// =============================================================================
// Graduated-Ranges Evaluator — score a live feature set against a table
// =============================================================================
//
// Per-feature membership bands:
//   inside optimal     → [0.8, 1.0], peaking at the range centre
//   inside acceptable  → [0.4, 0.8], decaying toward the acceptable edge
//   outside            → exponential tail, floored at 0.1
// Degenerate (zero-width) ranges take the fixed mid-band scores.
//
// The overall confidence is the plain mean of the matched feature scores.
// Rejection (≥ 3 poor features, or overall below the floor) caps confidence
// under the approval threshold so the structural `approved = confidence ≥
// 0.5` rule can never contradict the evaluator's verdict.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::evaluate::{size_risk, Evaluation};
use crate::graduation::learner::{GraduatedFeature, GraduationTable};

/// A feature score below this counts toward rejection.
const POOR_SCORE: f64 = 0.3;
/// Rejection fires at this many poor features.
const REJECT_FEATURE_COUNT: usize = 3;
/// Rejection fires below this overall confidence.
const REJECT_CONFIDENCE_FLOOR: f64 = 0.25;
/// Confidence published for a rejected signal never exceeds this.
const REJECTED_CONFIDENCE_CAP: f64 = 0.40;

/// Band a live value landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeTag {
    Optimal,
    Acceptable,
    Poor,
    NoRangeData,
}

/// Per-feature scoring detail.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureScore {
    pub name: String,
    pub value: f64,
    pub score: f64,
    pub tag: RangeTag,
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Score one live value against a graduated feature's ranges.
pub fn membership_score(value: f64, feature: &GraduatedFeature) -> (f64, RangeTag) {
    let optimal = &feature.optimal_range;
    let acceptable = &feature.acceptable_range;
    let w_opt = optimal.width();
    let w_acc = acceptable.width();

    if optimal.contains(value) {
        let score = if w_opt <= 0.0 {
            0.9
        } else {
            let half = w_opt / 2.0;
            let dist = (value - optimal.center()).abs();
            1.0 - 0.2 * (dist / half)
        };
        return (score.clamp(0.0, 1.0), RangeTag::Optimal);
    }

    if acceptable.contains(value) {
        let score = if w_acc <= 0.0 {
            0.6
        } else {
            // Distance to the optimal boundary, normalised by the width of
            // the acceptable margin on this side.
            let dist = optimal.distance_to(value);
            let gap = if value < optimal.min {
                optimal.min - acceptable.min
            } else {
                acceptable.max - optimal.max
            };
            if gap <= 0.0 {
                0.6
            } else {
                0.8 - 0.4 * (dist / gap)
            }
        };
        return (score.clamp(0.0, 1.0), RangeTag::Acceptable);
    }

    let score = if w_acc <= 0.0 {
        0.1
    } else {
        let dist = acceptable.distance_to(value);
        (0.4 * (-dist / w_acc).exp()).max(0.1)
    };
    (score.clamp(0.0, 1.0), RangeTag::Poor)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a live feature map against a published graduation table.
pub fn evaluate(table: &GraduationTable, features: &HashMap<String, f64>) -> Evaluation {
    let mut scores: Vec<FeatureScore> = Vec::new();

    for feature in &table.features {
        let Some(value) = features.get(&feature.name).copied().filter(|v| v.is_finite())
        else {
            continue;
        };
        let (score, tag) = membership_score(value, feature);
        scores.push(FeatureScore {
            name: feature.name.clone(),
            value,
            score,
            tag,
        });
    }

    let mut reasons = Vec::new();

    let overall = if scores.is_empty() {
        reasons.push("no graduated features matched the request".to_string());
        0.5
    } else {
        scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
    };

    let poor_count = scores.iter().filter(|s| s.score < POOR_SCORE).count();
    let rejected = poor_count >= REJECT_FEATURE_COUNT || overall < REJECT_CONFIDENCE_FLOOR;

    let confidence = if rejected {
        if poor_count >= REJECT_FEATURE_COUNT {
            reasons.push(format!("{poor_count} features in poor range"));
        }
        if overall < REJECT_CONFIDENCE_FLOOR {
            reasons.push(format!(
                "overall confidence {overall:.2} below minimum {REJECT_CONFIDENCE_FLOOR}"
            ));
        }
        overall.min(REJECTED_CONFIDENCE_CAP)
    } else {
        reasons.push(format!(
            "{} graduated features scored, mean {overall:.2}",
            scores.len()
        ));
        overall
    };

    reasons.push(band_label(confidence).to_string());

    for s in scores.iter().take(3) {
        reasons.push(format!("{} {:?} ({:.2})", s.name, s.tag, s.score));
    }

    let (suggested_sl, suggested_tp) = size_risk(confidence);

    Evaluation {
        confidence: confidence.clamp(0.0, 1.0),
        suggested_sl,
        suggested_tp,
        reasons,
    }
}

/// Confidence band annotation.
fn band_label(confidence: f64) -> &'static str {
    if confidence < 0.4 {
        "low confidence band"
    } else if confidence <= 0.7 {
        "nominal confidence band"
    } else {
        "optimal confidence band"
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::graduation::learner::{FeatureSignal, ValueRange};

    fn feature(name: &str, opt: (f64, f64), acc: (f64, f64)) -> GraduatedFeature {
        GraduatedFeature {
            name: name.to_string(),
            importance: 0.5,
            correlation: 0.4,
            stability: 0.6,
            optimal_range: ValueRange::new(opt.0, opt.1),
            acceptable_range: ValueRange::new(acc.0, acc.1),
            profitable_mean: opt.0 + (opt.1 - opt.0) / 2.0,
            unprofitable_mean: acc.0,
            signal: FeatureSignal::HigherIsBetter,
            sample_size: 60,
        }
    }

    fn table(features: Vec<GraduatedFeature>) -> GraduationTable {
        GraduationTable {
            instrument: "MGC".to_string(),
            direction: "long".to_string(),
            features,
            vector_count: 200,
            profitable_count: 120,
            unprofitable_count: 80,
            win_rate: 0.55,
            version: 1,
            last_updated: Utc::now(),
        }
    }

    fn request(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn s2_table() -> GraduationTable {
        table(vec![
            feature("atr_percentage", (0.002, 0.004), (0.0015, 0.0055)),
            feature("rsi_14", (40.0, 55.0), (35.0, 60.0)),
            feature("volume_delta", (1000.0, 1800.0), (800.0, 2200.0)),
        ])
    }

    // ---- membership ------------------------------------------------------

    #[test]
    fn optimal_centre_scores_one() {
        let f = feature("x", (10.0, 20.0), (5.0, 25.0));
        let (score, tag) = membership_score(15.0, &f);
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(tag, RangeTag::Optimal);
    }

    #[test]
    fn optimal_boundary_scores_point_eight() {
        let f = feature("x", (10.0, 20.0), (5.0, 25.0));
        let (score, _) = membership_score(10.0, &f);
        assert!((score - 0.8).abs() < 1e-9);
        let (score, _) = membership_score(20.0, &f);
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn acceptable_band_decays_toward_edge() {
        let f = feature("x", (10.0, 20.0), (5.0, 25.0));
        let (near_opt, tag) = membership_score(9.0, &f);
        assert_eq!(tag, RangeTag::Acceptable);
        let (at_edge, _) = membership_score(5.0, &f);
        assert!(near_opt > at_edge);
        assert!((at_edge - 0.4).abs() < 1e-9);
    }

    #[test]
    fn outside_decays_exponentially_with_floor() {
        let f = feature("x", (10.0, 20.0), (5.0, 25.0));
        let (just_out, tag) = membership_score(25.5, &f);
        assert_eq!(tag, RangeTag::Poor);
        assert!(just_out < 0.4);
        let (far_out, _) = membership_score(500.0, &f);
        assert!((far_out - 0.1).abs() < 1e-9);
    }

    /// Membership is monotone from the optimal centre outward.
    #[test]
    fn membership_is_monotone_outward() {
        let f = feature("x", (10.0, 20.0), (5.0, 25.0));
        let centre = membership_score(15.0, &f).0;
        let opt_edge = membership_score(20.0, &f).0;
        let acc_edge = membership_score(25.0, &f).0;
        let outside = membership_score(27.0, &f).0;
        assert!(centre >= opt_edge);
        assert!(opt_edge >= acc_edge);
        assert!(acc_edge >= outside);
    }

    #[test]
    fn degenerate_ranges_take_fixed_scores() {
        let point = feature("x", (7.0, 7.0), (7.0, 7.0));
        assert_eq!(membership_score(7.0, &point).0, 0.9);
        assert_eq!(membership_score(8.0, &point).0, 0.1);
    }

    // ---- overall decision -------------------------------------------------

    #[test]
    fn aligned_request_approaches_full_confidence() {
        let eval = evaluate(
            &s2_table(),
            &request(&[
                ("atr_percentage", 0.003),
                ("rsi_14", 48.0),
                ("volume_delta", 1500.0),
            ]),
        );
        // All three land mid-optimal; overall lands around 0.9.
        assert!(eval.confidence > 0.85);
        assert!(eval.suggested_sl > 42.0);
        assert!(eval.suggested_tp > 125.0);
        assert!(!eval.reasons.is_empty());
    }

    #[test]
    fn three_poor_features_reject() {
        let eval = evaluate(
            &s2_table(),
            &request(&[
                ("atr_percentage", 0.010),
                ("rsi_14", 80.0),
                ("volume_delta", 300.0),
            ]),
        );
        assert!(eval.confidence < 0.25);
        assert!(eval
            .reasons
            .iter()
            .any(|r| r.contains("3 features in poor range")));
    }

    #[test]
    fn no_matched_features_is_neutral() {
        let eval = evaluate(&s2_table(), &request(&[("unknown", 1.0)]));
        assert!((eval.confidence - 0.5).abs() < 1e-9);
        assert!(eval
            .reasons
            .iter()
            .any(|r| r.contains("no graduated features matched")));
    }

    #[test]
    fn non_finite_live_values_are_skipped() {
        let eval = evaluate(
            &s2_table(),
            &request(&[("rsi_14", f64::NAN), ("volume_delta", 1500.0)]),
        );
        // Only volume_delta scores; NaN rsi contributes nothing.
        assert!(eval.confidence > 0.8);
    }
}
