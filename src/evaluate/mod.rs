// =============================================================================
// Risk Evaluators — interchangeable strategies sharing one output shape
// =============================================================================
//
// The strategy set is closed: graduated ranges, robust zones, and the
// rule-based fallback. The coordinator dispatches between them and owns
// approval; evaluators only produce confidence, risk parameters, and
// rationale.
// =============================================================================

pub mod graduated;
pub mod robust;
pub mod rule_based;

/// Lower bound of the base stop-loss band (currency per contract).
pub const SL_MIN: f64 = 20.0;
/// Upper bound of the base stop-loss band.
pub const SL_MAX: f64 = 50.0;
/// Lower bound of the base take-profit band.
pub const TP_MIN: f64 = 40.0;
/// Upper bound of the base take-profit band.
pub const TP_MAX: f64 = 150.0;
/// Confidence floor applied before risk sizing so that thin wins still get
/// workable stops.
pub const MIN_SIZING_SCALE: f64 = 0.60;

/// What a single evaluator hands back to the coordinator. Approval is
/// derived later from the final (post-modulator) confidence.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// In [0, 1] before the modulator runs.
    pub confidence: f64,
    /// Currency per contract, before caller caps and size scaling.
    pub suggested_sl: f64,
    pub suggested_tp: f64,
    pub reasons: Vec<String>,
}

/// Scale the base SL/TP bands linearly by confidence (floored at
/// `MIN_SIZING_SCALE`).
pub fn size_risk(confidence: f64) -> (f64, f64) {
    let scale = confidence.max(MIN_SIZING_SCALE);
    let sl = (SL_MAX * scale).clamp(SL_MIN, SL_MAX);
    let tp = (TP_MAX * scale).clamp(TP_MIN, TP_MAX);
    (sl, tp)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_scales_with_confidence() {
        let (sl, tp) = size_risk(0.9);
        assert!((sl - 45.0).abs() < 1e-9);
        assert!((tp - 135.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_floors_at_minimum_scale() {
        let (sl_low, tp_low) = size_risk(0.1);
        let (sl_floor, tp_floor) = size_risk(MIN_SIZING_SCALE);
        assert_eq!(sl_low, sl_floor);
        assert_eq!(tp_low, tp_floor);
        assert!((sl_low - 30.0).abs() < 1e-9);
        assert!((tp_low - 90.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_stays_inside_bands() {
        for conf in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let (sl, tp) = size_risk(conf);
            assert!((SL_MIN..=SL_MAX).contains(&sl));
            assert!((TP_MIN..=TP_MAX).contains(&tp));
        }
    }
}
