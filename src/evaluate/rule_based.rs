// =============================================================================
// Rule-Based Evaluator — indicator heuristics for data-poor partitions
// =============================================================================
//
// The safety net under both learned evaluators: additive adjustments over a
// base confidence, driven by whichever well-known indicator features the
// request happens to carry. Used when no graduation table exists, when the
// learned evaluators cannot satisfy their data preconditions, and as the
// deadline short-circuit response.
//
// The "noise" term is a deterministic jitter hashed from the entry-signal
// id, so identical requests always score identically.
// =============================================================================

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::evaluate::Evaluation;
use crate::types::Direction;

/// Base confidence before adjustments.
const BASE_CONFIDENCE: f64 = 0.60;
/// Half-width of the deterministic jitter band.
const JITTER_BAND: f64 = 0.03;
/// Published confidence is clamped to this range.
const CONFIDENCE_FLOOR: f64 = 0.10;
const CONFIDENCE_CEIL: f64 = 0.95;

/// Default risk parameters when no learned sizing is available (currency
/// per contract).
pub const DEFAULT_SL: f64 = 10.0;
pub const DEFAULT_TP: f64 = 15.0;

/// Evaluate a live feature map with indicator heuristics only.
pub fn evaluate(
    features: &HashMap<String, f64>,
    direction: Direction,
    entry_signal_id: Option<&str>,
) -> Evaluation {
    let mut confidence = BASE_CONFIDENCE + jitter(entry_signal_id);
    let mut reasons = vec!["rule-based heuristic scoring".to_string()];

    let get = |name: &str| features.get(name).copied().filter(|v| v.is_finite());

    // --- ATR percentage band -------------------------------------------------
    if let Some(atr) = get("atr_percentage") {
        if atr > 0.008 {
            confidence -= 0.10;
            reasons.push(format!("volatility elevated (atr {atr:.4})"));
        } else if atr < 0.0005 {
            confidence -= 0.05;
            reasons.push(format!("market too quiet (atr {atr:.4})"));
        }
    }

    // --- Momentum in / against direction --------------------------------------
    if let Some(momentum) = get("momentum_5") {
        let aligned = match direction {
            Direction::Long => momentum,
            Direction::Short => -momentum,
        };
        if aligned > 0.002 {
            confidence += 0.05;
            reasons.push("strong momentum in direction".to_string());
        } else if aligned > 0.0 {
            confidence += 0.02;
            reasons.push("mild momentum in direction".to_string());
        } else if aligned < -0.002 {
            confidence -= 0.06;
            reasons.push("strong momentum against direction".to_string());
        } else if aligned < 0.0 {
            confidence -= 0.02;
            reasons.push("momentum against direction".to_string());
        }
    }

    // --- Volume spike ---------------------------------------------------------
    if let Some(spike) = get("volume_spike_3bar") {
        if spike > 1.5 {
            confidence += 0.03;
            reasons.push(format!("volume spike {spike:.1}x"));
        } else if spike < 0.8 {
            confidence -= 0.02;
            reasons.push("volume drying up".to_string());
        }
    }

    // --- Bollinger position ---------------------------------------------------
    if let Some(bb) = get("bb_position") {
        match direction {
            Direction::Long => {
                if bb < 0.3 {
                    confidence += 0.03;
                    reasons.push("price near lower band".to_string());
                } else if bb > 0.8 {
                    confidence -= 0.03;
                    reasons.push("price stretched above bands".to_string());
                }
            }
            Direction::Short => {
                if bb > 0.7 {
                    confidence += 0.03;
                    reasons.push("price near upper band".to_string());
                } else if bb < 0.2 {
                    confidence -= 0.03;
                    reasons.push("price stretched below bands".to_string());
                }
            }
        }
    }

    // --- RSI bands ------------------------------------------------------------
    if let Some(rsi) = get("rsi_14") {
        match direction {
            Direction::Long => {
                if rsi < 35.0 {
                    confidence += 0.04;
                    reasons.push(format!("oversold rsi {rsi:.0} favours long"));
                } else if rsi > 70.0 {
                    confidence -= 0.06;
                    reasons.push(format!("overbought rsi {rsi:.0} against long"));
                }
            }
            Direction::Short => {
                if rsi > 65.0 {
                    confidence += 0.04;
                    reasons.push(format!("overbought rsi {rsi:.0} favours short"));
                } else if rsi < 30.0 {
                    confidence -= 0.06;
                    reasons.push(format!("oversold rsi {rsi:.0} against short"));
                }
            }
        }
    }

    Evaluation {
        confidence: confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL),
        suggested_sl: DEFAULT_SL,
        suggested_tp: DEFAULT_TP,
        reasons,
    }
}

/// Deterministic jitter in [-JITTER_BAND, +JITTER_BAND] from the signal id.
/// No id → no jitter.
fn jitter(entry_signal_id: Option<&str>) -> f64 {
    let Some(id) = entry_signal_id else { return 0.0 };
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    let unit = (hasher.finish() % 10_000) as f64 / 10_000.0;
    (unit * 2.0 - 1.0) * JITTER_BAND
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn request(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Favourable long setup: neutral RSI, normal ATR, aligned momentum,
    /// volume spike, price near lower band.
    fn favourable_long() -> HashMap<String, f64> {
        request(&[
            ("rsi_14", 45.0),
            ("atr_percentage", 0.002),
            ("momentum_5", 0.003),
            ("volume_spike_3bar", 1.6),
            ("bb_position", 0.25),
        ])
    }

    #[test]
    fn favourable_long_scores_about_point_seven() {
        let eval = evaluate(&favourable_long(), Direction::Long, None);
        assert!((eval.confidence - 0.71).abs() < 1e-9);
        assert_eq!(eval.suggested_sl, DEFAULT_SL);
        assert_eq!(eval.suggested_tp, DEFAULT_TP);
    }

    #[test]
    fn same_setup_against_short_scores_lower() {
        let long = evaluate(&favourable_long(), Direction::Long, None).confidence;
        let short = evaluate(&favourable_long(), Direction::Short, None).confidence;
        assert!(short < long);
    }

    #[test]
    fn hostile_setup_is_clamped_above_floor() {
        let features = request(&[
            ("rsi_14", 80.0),
            ("atr_percentage", 0.02),
            ("momentum_5", -0.01),
            ("volume_spike_3bar", 0.5),
            ("bb_position", 0.95),
        ]);
        let eval = evaluate(&features, Direction::Long, None);
        assert!(eval.confidence >= CONFIDENCE_FLOOR);
        assert!(eval.confidence < 0.5);
    }

    #[test]
    fn empty_features_score_base() {
        let eval = evaluate(&HashMap::new(), Direction::Long, None);
        assert!((eval.confidence - BASE_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let a = jitter(Some("sig-123"));
        let b = jitter(Some("sig-123"));
        assert_eq!(a, b);
        assert!(a.abs() <= JITTER_BAND);
        assert_eq!(jitter(None), 0.0);
    }

    #[test]
    fn identical_requests_score_identically() {
        let a = evaluate(&favourable_long(), Direction::Long, Some("sig-9"));
        let b = evaluate(&favourable_long(), Direction::Long, Some("sig-9"));
        assert_eq!(a.confidence, b.confidence);
    }
}
