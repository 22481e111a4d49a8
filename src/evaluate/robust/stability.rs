// =============================================================================
// Equity-Curve Stability — windowed health diagnostics for a zone key
// =============================================================================
//
// Looks at the last ≤ 30 outcomes for a key and blends three views of the
// cumulative P&L path:
//
//   volatility  = max(0, 1 - stdev/100)       calm beats wild
//   trend       = upticks / (n-1)             rising beats falling
//   smoothness  = 1 - reversals / (n-2)       steady beats whipsaw
//   stability   = 0.4·trend + 0.4·smoothness + 0.2·volatility
//
// Degradation escalates with max drawdown percentage and the longest run of
// consecutive losing periods.
// =============================================================================

use serde::Serialize;

use crate::graduation::stats;

/// Outcomes considered by the assessment.
pub const STABILITY_WINDOW: usize = 30;

/// Stability below this marks the curve unstable regardless of degradation.
const UNSTABLE_FLOOR: f64 = 0.5;

/// How degraded the equity curve is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    None,
    Mild,
    Moderate,
    Severe,
}

/// Full assessment of a key's recent equity curve.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityStability {
    pub stability: f64,
    pub volatility_score: f64,
    pub trend_strength: f64,
    pub smoothness: f64,
    pub max_drawdown_pct: f64,
    pub consecutive_down: u32,
    pub level: DegradationLevel,
    pub is_unstable: bool,
}

impl EquityStability {
    /// Neutral assessment for keys with too little history.
    fn neutral() -> Self {
        Self {
            stability: 1.0,
            volatility_score: 1.0,
            trend_strength: 0.5,
            smoothness: 1.0,
            max_drawdown_pct: 0.0,
            consecutive_down: 0,
            level: DegradationLevel::None,
            is_unstable: false,
        }
    }
}

/// Assess the last ≤ 30 per-contract outcomes (oldest-first).
pub fn assess(pnls: &[f64]) -> EquityStability {
    let window: Vec<f64> = pnls
        .iter()
        .copied()
        .filter(|p| p.is_finite())
        .collect();
    let window = if window.len() > STABILITY_WINDOW {
        window[window.len() - STABILITY_WINDOW..].to_vec()
    } else {
        window
    };

    let n = window.len();
    if n < 3 {
        return EquityStability::neutral();
    }

    // --- Blend components -------------------------------------------------
    let volatility_score = stats::std_dev(&window)
        .map(|sd| (1.0 - sd / 100.0).max(0.0))
        .unwrap_or(1.0);

    let upticks = window.iter().filter(|p| **p > 0.0).count();
    let trend_strength = upticks as f64 / (n - 1) as f64;

    let reversals = window
        .windows(2)
        .filter(|w| (w[0] > 0.0) != (w[1] > 0.0))
        .count();
    let smoothness = 1.0 - reversals as f64 / (n - 2) as f64;

    let stability =
        (0.4 * trend_strength + 0.4 * smoothness + 0.2 * volatility_score).clamp(0.0, 1.0);

    // --- Drawdown over the cumulative path ---------------------------------
    let mut equity = 0.0;
    let mut peak = 0.0_f64;
    let mut max_drawdown_pct = 0.0_f64;
    for pnl in &window {
        equity += pnl;
        peak = peak.max(equity);
        let base = peak.abs().max(1.0);
        let dd = (peak - equity) / base * 100.0;
        max_drawdown_pct = max_drawdown_pct.max(dd);
    }

    // --- Longest run of losing periods -------------------------------------
    let mut consecutive_down = 0u32;
    let mut run = 0u32;
    for pnl in &window {
        if *pnl <= 0.0 {
            run += 1;
            consecutive_down = consecutive_down.max(run);
        } else {
            run = 0;
        }
    }

    let level = if max_drawdown_pct > 30.0 || consecutive_down > 5 {
        DegradationLevel::Severe
    } else if max_drawdown_pct > 15.0 || consecutive_down > 3 {
        DegradationLevel::Moderate
    } else if max_drawdown_pct > 8.0 || consecutive_down > 2 {
        DegradationLevel::Mild
    } else {
        DegradationLevel::None
    };

    let is_unstable = stability < UNSTABLE_FLOOR || level >= DegradationLevel::Moderate;

    EquityStability {
        stability,
        volatility_score,
        trend_strength,
        smoothness,
        max_drawdown_pct,
        consecutive_down,
        level,
        is_unstable,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_history_is_neutral() {
        let s = assess(&[10.0, -5.0]);
        assert_eq!(s.level, DegradationLevel::None);
        assert!(!s.is_unstable);
    }

    #[test]
    fn steady_winner_is_stable() {
        let pnls: Vec<f64> = (0..20).map(|_| 12.0).collect();
        let s = assess(&pnls);
        assert!(s.stability > 0.8);
        assert_eq!(s.level, DegradationLevel::None);
        assert!(!s.is_unstable);
        assert_eq!(s.consecutive_down, 0);
    }

    #[test]
    fn long_losing_run_is_severe() {
        let mut pnls: Vec<f64> = (0..10).map(|_| 15.0).collect();
        pnls.extend((0..6).map(|_| -20.0));
        let s = assess(&pnls);
        assert_eq!(s.consecutive_down, 6);
        assert_eq!(s.level, DegradationLevel::Severe);
        assert!(s.is_unstable);
    }

    #[test]
    fn whipsaw_curve_loses_smoothness() {
        let pnls: Vec<f64> = (0..20)
            .map(|i| if i % 2 == 0 { 30.0 } else { -30.0 })
            .collect();
        let s = assess(&pnls);
        assert!(s.smoothness < 0.1);
        assert!(s.stability < 0.5);
        assert!(s.is_unstable);
    }

    #[test]
    fn drawdown_thresholds_escalate() {
        // Build up equity, then give back ~20% of peak: moderate.
        let mut pnls: Vec<f64> = (0..10).map(|_| 50.0).collect();
        pnls.extend([-40.0, -40.0, -20.0]);
        let s = assess(&pnls);
        assert!(s.max_drawdown_pct > 15.0);
        assert!(s.level >= DegradationLevel::Moderate);
    }

    #[test]
    fn only_last_thirty_outcomes_count() {
        // 40 heavy losses followed by 30 wins: the losses age out.
        let mut pnls: Vec<f64> = (0..40).map(|_| -50.0).collect();
        pnls.extend((0..30).map(|_| 20.0));
        let s = assess(&pnls);
        assert_eq!(s.consecutive_down, 0);
        assert_eq!(s.level, DegradationLevel::None);
    }

    #[test]
    fn non_finite_entries_are_skipped() {
        let s = assess(&[10.0, f64::NAN, 12.0, 11.0, f64::INFINITY, 9.0]);
        assert!(s.stability > 0.5);
    }
}
