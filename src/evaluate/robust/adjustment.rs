// =============================================================================
// Incremental Adjustment Cycle — observe → adjust → wait, per zone key
// =============================================================================
//
// When a zone's equity curve degrades, the cycle picks one adjustment from a
// closed set, applies it to the zone, then sits out a fixed number of trades
// before judging the result. Detection and application are split across
// evolution passes: an unstable observation moves the cycle into `adjust`,
// the adjustment is selected and applied on the following pass, and the
// cycle then waits — so all three phases are visible on the state surface.
// An adjustment applied within the last three cycles is skipped so the
// machine cannot thrash on one lever.
//
// Selection priority:
//   severe degradation      → reset_zone, then tighten_strict
//   moderate degradation    → tighten_moderate, then feature_refresh
//   ≥ 3 consecutive losses  → confidence_penalty, then expand_tolerance
//   otherwise               → gentle_tighten
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::evaluate::robust::stability::DegradationLevel;
use crate::evaluate::robust::zone::RobustZone;
use crate::graduation::ValueRange;

/// Adjustments applied within this many past cycles are skipped.
const RECENT_CYCLE_MEMORY: usize = 3;

/// Closed set of zone adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    ResetZone,
    TightenStrict,
    TightenModerate,
    FeatureRefresh,
    ConfidencePenalty,
    ExpandTolerance,
    GentleTighten,
}

impl AdjustmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResetZone => "reset_zone",
            Self::TightenStrict => "tighten_strict",
            Self::TightenModerate => "tighten_moderate",
            Self::FeatureRefresh => "feature_refresh",
            Self::ConfidencePenalty => "confidence_penalty",
            Self::ExpandTolerance => "expand_tolerance",
            Self::GentleTighten => "gentle_tighten",
        }
    }

    /// Whether the evaluator must rebuild the zone's feature set from the
    /// rolling window after this adjustment.
    pub fn rebuilds_zone(&self) -> bool {
        matches!(self, Self::ResetZone | Self::FeatureRefresh)
    }
}

impl std::fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Observe,
    Adjust,
    Wait,
}

/// Per-key cycle state.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentCycle {
    pub phase: CyclePhase,
    /// Trades left to sit out while in `Wait`.
    pub wait_remaining: u32,
    /// Adjustments applied in the most recent cycles, newest-first.
    recent: VecDeque<AdjustmentKind>,
    pub cycles_run: u64,
}

impl Default for AdjustmentCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjustmentCycle {
    pub fn new() -> Self {
        Self {
            phase: CyclePhase::Observe,
            wait_remaining: 0,
            recent: VecDeque::new(),
            cycles_run: 0,
        }
    }

    /// One trade outcome arrived for this key; counts down the wait phase.
    pub fn on_trade(&mut self) {
        if self.phase == CyclePhase::Wait {
            self.wait_remaining = self.wait_remaining.saturating_sub(1);
            if self.wait_remaining == 0 {
                self.phase = CyclePhase::Observe;
            }
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.phase == CyclePhase::Wait
    }

    /// Move from `Observe` to `Adjust` once degradation is detected. The
    /// adjustment itself is selected and applied on the next evolution
    /// pass, leaving the phase observable in between.
    pub fn enter_adjust(&mut self) {
        if self.phase == CyclePhase::Observe {
            self.phase = CyclePhase::Adjust;
        }
    }

    /// Pick the next adjustment for the observed conditions, skipping any
    /// applied within the last three cycles.
    pub fn select(
        &self,
        level: DegradationLevel,
        consecutive_losses: u32,
    ) -> AdjustmentKind {
        let fresh = |k: AdjustmentKind| !self.recent.contains(&k);

        let preferences: &[AdjustmentKind] = match level {
            DegradationLevel::Severe => {
                &[AdjustmentKind::ResetZone, AdjustmentKind::TightenStrict]
            }
            DegradationLevel::Moderate => {
                &[AdjustmentKind::TightenModerate, AdjustmentKind::FeatureRefresh]
            }
            _ if consecutive_losses >= 3 => {
                &[AdjustmentKind::ConfidencePenalty, AdjustmentKind::ExpandTolerance]
            }
            _ => &[AdjustmentKind::GentleTighten],
        };

        preferences
            .iter()
            .copied()
            .find(|k| fresh(*k))
            .unwrap_or(AdjustmentKind::GentleTighten)
    }

    /// Apply `kind` to `zone`, record it, and complete the adjust phase by
    /// entering the wait. Zone-rebuilding kinds only mutate robustness
    /// here; the evaluator rebuilds ranges from the rolling window right
    /// after.
    pub fn apply(
        &mut self,
        zone: &mut RobustZone,
        kind: AdjustmentKind,
        target_wait_trades: u32,
    ) {
        match kind {
            AdjustmentKind::ResetZone => {
                scale_robustness(zone, 0.8);
            }
            AdjustmentKind::TightenStrict => {
                shrink_optimal(zone, 0.5);
                scale_robustness(zone, 0.9);
            }
            AdjustmentKind::TightenModerate => {
                shrink_optimal(zone, 0.6);
                scale_robustness(zone, 0.9);
            }
            AdjustmentKind::FeatureRefresh => {
                scale_robustness(zone, 0.95);
            }
            AdjustmentKind::ConfidencePenalty => {
                scale_robustness(zone, 0.85);
            }
            AdjustmentKind::ExpandTolerance => {
                expand_acceptable(zone, 1.4);
                scale_robustness(zone, 1.1);
            }
            AdjustmentKind::GentleTighten => {
                shrink_optimal(zone, 0.85);
                scale_robustness(zone, 0.95);
            }
        }

        zone.last_adjustment = Some(kind.as_str().to_string());

        self.recent.push_front(kind);
        self.recent.truncate(RECENT_CYCLE_MEMORY);
        self.phase = CyclePhase::Wait;
        self.wait_remaining = target_wait_trades;
        self.cycles_run += 1;
    }
}

// ---------------------------------------------------------------------------
// Zone mutations
// ---------------------------------------------------------------------------

/// Shrink every optimal range around its centre to `factor` of its width.
fn shrink_optimal(zone: &mut RobustZone, factor: f64) {
    for fz in zone.feature_ranges.values_mut() {
        let centre = fz.optimal.center();
        let half = fz.optimal.width() * factor / 2.0;
        fz.optimal = ValueRange::new(centre - half, centre + half);
    }
}

/// Grow every acceptable range around its centre to `factor` of its width,
/// widening tolerance alongside.
fn expand_acceptable(zone: &mut RobustZone, factor: f64) {
    for fz in zone.feature_ranges.values_mut() {
        let centre = fz.acceptable.center();
        let half = fz.acceptable.width() * factor / 2.0;
        fz.acceptable = ValueRange::new(centre - half, centre + half);
        fz.tolerance *= 1.2;
        // Expansion must keep the optimal core inside the shell.
        fz.optimal = ValueRange::new(
            fz.optimal.min.max(fz.acceptable.min),
            fz.optimal.max.min(fz.acceptable.max),
        );
    }
}

fn scale_robustness(zone: &mut RobustZone, factor: f64) {
    zone.robustness_score = (zone.robustness_score * factor).clamp(0.0, 1.0);
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Utc;

    use crate::evaluate::robust::zone::{FeatureZone, ZoneMetrics};

    fn zone() -> RobustZone {
        let mut feature_ranges = HashMap::new();
        feature_ranges.insert(
            "edge".to_string(),
            FeatureZone {
                optimal: ValueRange::new(40.0, 60.0),
                acceptable: ValueRange::new(30.0, 70.0),
                tolerance: 8.0,
                sample_size: 25,
            },
        );
        RobustZone {
            feature_ranges,
            robustness_score: 0.8,
            sample_size: 50,
            description: "test zone".to_string(),
            metrics: ZoneMetrics {
                profitability: 0.5,
                variability: 0.5,
                consistency: 0.5,
                sample_bonus: 0.5,
            },
            last_updated: Utc::now(),
            last_adjustment: None,
        }
    }

    // ---- selection -------------------------------------------------------

    #[test]
    fn severe_prefers_reset_then_strict() {
        let mut cycle = AdjustmentCycle::new();
        assert_eq!(
            cycle.select(DegradationLevel::Severe, 0),
            AdjustmentKind::ResetZone
        );
        let mut z = zone();
        cycle.apply(&mut z, AdjustmentKind::ResetZone, 10);
        assert_eq!(
            cycle.select(DegradationLevel::Severe, 0),
            AdjustmentKind::TightenStrict
        );
    }

    #[test]
    fn losses_without_degradation_prefer_penalty() {
        let cycle = AdjustmentCycle::new();
        assert_eq!(
            cycle.select(DegradationLevel::None, 3),
            AdjustmentKind::ConfidencePenalty
        );
        assert_eq!(
            cycle.select(DegradationLevel::Mild, 1),
            AdjustmentKind::GentleTighten
        );
    }

    #[test]
    fn exhausted_preferences_fall_back_to_gentle() {
        let mut cycle = AdjustmentCycle::new();
        let mut z = zone();
        cycle.apply(&mut z, AdjustmentKind::ConfidencePenalty, 10);
        cycle.apply(&mut z, AdjustmentKind::ExpandTolerance, 10);
        assert_eq!(
            cycle.select(DegradationLevel::None, 5),
            AdjustmentKind::GentleTighten
        );
    }

    // ---- application -----------------------------------------------------

    #[test]
    fn tighten_shrinks_optimal_to_sixty_percent() {
        let mut cycle = AdjustmentCycle::new();
        let mut z = zone();
        cycle.apply(&mut z, AdjustmentKind::TightenModerate, 10);
        let fz = &z.feature_ranges["edge"];
        assert!((fz.optimal.width() - 12.0).abs() < 1e-9);
        assert!((fz.optimal.center() - 50.0).abs() < 1e-9);
        assert!((z.robustness_score - 0.72).abs() < 1e-9);
        assert_eq!(z.last_adjustment.as_deref(), Some("tighten_moderate"));
    }

    #[test]
    fn expand_grows_acceptable_to_140_percent() {
        let mut cycle = AdjustmentCycle::new();
        let mut z = zone();
        cycle.apply(&mut z, AdjustmentKind::ExpandTolerance, 10);
        let fz = &z.feature_ranges["edge"];
        assert!((fz.acceptable.width() - 56.0).abs() < 1e-9);
        assert!((fz.tolerance - 9.6).abs() < 1e-9);
        // Optimal still nested.
        assert!(fz.acceptable.min <= fz.optimal.min);
        assert!(fz.optimal.max <= fz.acceptable.max);
        // 0.8 × 1.1 = 0.88.
        assert!((z.robustness_score - 0.88).abs() < 1e-9);
    }

    #[test]
    fn apply_enters_wait_and_counts_down() {
        let mut cycle = AdjustmentCycle::new();
        let mut z = zone();
        cycle.apply(&mut z, AdjustmentKind::GentleTighten, 3);
        assert!(cycle.is_waiting());
        assert_eq!(cycle.wait_remaining, 3);

        cycle.on_trade();
        cycle.on_trade();
        assert!(cycle.is_waiting());
        cycle.on_trade();
        assert_eq!(cycle.phase, CyclePhase::Observe);
    }

    #[test]
    fn cycle_walks_observe_adjust_wait() {
        let mut cycle = AdjustmentCycle::new();
        assert_eq!(cycle.phase, CyclePhase::Observe);

        cycle.enter_adjust();
        assert_eq!(cycle.phase, CyclePhase::Adjust);
        // Re-entry is a no-op outside Observe.
        cycle.enter_adjust();
        assert_eq!(cycle.phase, CyclePhase::Adjust);

        let mut z = zone();
        cycle.apply(&mut z, AdjustmentKind::GentleTighten, 2);
        assert_eq!(cycle.phase, CyclePhase::Wait);

        cycle.on_trade();
        cycle.on_trade();
        assert_eq!(cycle.phase, CyclePhase::Observe);
    }

    #[test]
    fn robustness_never_leaves_unit_interval() {
        let mut cycle = AdjustmentCycle::new();
        let mut z = zone();
        z.robustness_score = 0.99;
        cycle.apply(&mut z, AdjustmentKind::ExpandTolerance, 10);
        assert!(z.robustness_score <= 1.0);
    }
}
