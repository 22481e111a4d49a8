// =============================================================================
// Exploration Mode — deliberate probing when a zone stops paying
// =============================================================================
//
// A zone key enters exploration when its recent evaluations or outcomes show
// sustained weakness. While exploring, scoring turns deliberately selective:
// off-zone signals are capped hard, lukewarm confidence is discounted, and
// after two days the decision rule inverts to probe for a regime change —
// previously good patterns are rejected and some off-zone patterns are let
// through.
//
// Exit requires evidence: two consecutive wins with positive rolling P&L.
// Before the inversion kicks in, one strong live signal (confidence above
// 0.7 with solid membership) also exits. Once inverted, only outcomes count:
// the whole point of the extended phase is to distrust high-confidence
// signals, so one cannot be allowed to end it.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

// Entry triggers.
const LOW_CONFIDENCE_RUN: u32 = 5;
const LOW_CONFIDENCE_FLOOR: f64 = 0.5;
const LOW_MEMBERSHIP_RUN: u32 = 3;
const LOW_MEMBERSHIP_FLOOR: f64 = 0.4;
const LOSS_RUN: u32 = 3;
const ROLLING_PNL_FLOOR: f64 = -50.0;
const ROLLING_PNL_MIN_TRADES: usize = 10;
const WIN_RATE_FLOOR: f64 = 0.30;
const WIN_RATE_MIN_TRADES: usize = 15;

/// Rolling outcome history retained per key.
const ROLLING_CAPACITY: usize = 20;

/// Days in exploration after which the decision rule inverts.
const INVERSION_AFTER_DAYS: f64 = 2.0;

/// Strict enforcement: membership below this caps confidence hard.
const STRICT_MEMBERSHIP_FLOOR: f64 = 0.6;
const STRICT_CONFIDENCE_CAP: f64 = 0.2;

/// Lukewarm confidence band discounted while exploring.
const MODERATE_BAND: (f64, f64) = (0.4, 0.7);
const MODERATE_DISCOUNT: f64 = 0.6;

/// Inversion thresholds.
const INVERT_REJECT_CONFIDENCE: f64 = 0.7;
const INVERT_REJECTED_VALUE: f64 = 0.12;
const INVERT_PROBE_MEMBERSHIP: f64 = 0.4;
const INVERT_PROBE_VALUE: f64 = 0.55;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Exploration phase reported on the state surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationPhase {
    Normal,
    Exploring,
    ExploringExtended,
}

/// Per-key exploration state. Fed by every evaluation and outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorationState {
    active: bool,
    entered_at: Option<DateTime<Utc>>,
    entry_reason: Option<String>,

    low_confidence_run: u32,
    low_membership_run: u32,
    loss_run: u32,
    win_run: u32,

    #[serde(skip)]
    rolling_pnl: VecDeque<f64>,
}

impl Default for ExplorationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExplorationState {
    pub fn new() -> Self {
        Self {
            active: false,
            entered_at: None,
            entry_reason: None,
            low_confidence_run: 0,
            low_membership_run: 0,
            loss_run: 0,
            win_run: 0,
            rolling_pnl: VecDeque::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn entry_reason(&self) -> Option<&str> {
        self.entry_reason.as_deref()
    }

    pub fn days_in(&self, now: DateTime<Utc>) -> f64 {
        self.entered_at
            .map(|at| now.signed_duration_since(at).num_seconds() as f64 / 86_400.0)
            .unwrap_or(0.0)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> ExplorationPhase {
        if !self.active {
            ExplorationPhase::Normal
        } else if self.days_in(now) > INVERSION_AFTER_DAYS {
            ExplorationPhase::ExploringExtended
        } else {
            ExplorationPhase::Exploring
        }
    }

    fn rolling_sum(&self) -> f64 {
        self.rolling_pnl.iter().sum()
    }

    // -------------------------------------------------------------------------
    // Feeds
    // -------------------------------------------------------------------------

    /// Record a completed evaluation's base confidence and membership, then
    /// check entry triggers.
    pub fn record_evaluation(
        &mut self,
        confidence: f64,
        membership: f64,
        key: &str,
        now: DateTime<Utc>,
    ) {
        if confidence < LOW_CONFIDENCE_FLOOR {
            self.low_confidence_run += 1;
        } else {
            self.low_confidence_run = 0;
        }
        if membership < LOW_MEMBERSHIP_FLOOR {
            self.low_membership_run += 1;
        } else {
            self.low_membership_run = 0;
        }

        self.maybe_enter(key, now);
    }

    /// Record a trade outcome, then check entry and exit conditions.
    pub fn record_outcome(&mut self, pnl_per_contract: f64, is_win: bool, key: &str, now: DateTime<Utc>) {
        self.rolling_pnl.push_back(pnl_per_contract);
        if self.rolling_pnl.len() > ROLLING_CAPACITY {
            self.rolling_pnl.pop_front();
        }

        if pnl_per_contract <= 0.0 {
            self.loss_run += 1;
            self.win_run = 0;
        } else if is_win {
            self.win_run += 1;
            self.loss_run = 0;
        } else {
            // Scratch trade: breaks the loss run without counting as a win.
            self.loss_run = 0;
            self.win_run = 0;
        }

        if self.active {
            if self.win_run >= 2 && self.rolling_sum() > 0.0 {
                self.exit(key, now, "2 consecutive wins with positive rolling pnl");
            }
        } else {
            self.maybe_enter(key, now);
        }
    }

    fn maybe_enter(&mut self, key: &str, now: DateTime<Utc>) {
        if self.active {
            return;
        }

        let reason = if self.low_confidence_run >= LOW_CONFIDENCE_RUN {
            Some(format!(
                "{LOW_CONFIDENCE_RUN} consecutive low confidence trades"
            ))
        } else if self.low_membership_run >= LOW_MEMBERSHIP_RUN {
            Some(format!(
                "{LOW_MEMBERSHIP_RUN} consecutive low membership trades"
            ))
        } else if self.loss_run >= LOSS_RUN {
            Some(format!("{LOSS_RUN} consecutive losses"))
        } else if self.rolling_pnl.len() >= ROLLING_PNL_MIN_TRADES
            && self.rolling_sum() < ROLLING_PNL_FLOOR
        {
            Some(format!("rolling pnl {:.0} below floor", self.rolling_sum()))
        } else if self.rolling_pnl.len() >= WIN_RATE_MIN_TRADES {
            let wins = self.rolling_pnl.iter().filter(|p| **p > 0.0).count();
            let rate = wins as f64 / self.rolling_pnl.len() as f64;
            (rate < WIN_RATE_FLOOR).then(|| format!("win rate {:.0}% below floor", rate * 100.0))
        } else {
            None
        };

        if let Some(reason) = reason {
            self.active = true;
            self.entered_at = Some(now);
            info!(key, reason = %reason, "entering exploration mode");
            self.entry_reason = Some(reason);
        }
    }

    fn exit(&mut self, key: &str, now: DateTime<Utc>, why: &str) {
        info!(key, days = self.days_in(now), why, "exiting exploration mode");
        self.active = false;
        self.entered_at = None;
        self.entry_reason = None;
        self.low_confidence_run = 0;
        self.low_membership_run = 0;
    }

    // -------------------------------------------------------------------------
    // Scoring effects
    // -------------------------------------------------------------------------

    /// Apply exploration effects to a base confidence. Returns the adjusted
    /// confidence plus rationale notes. May exit exploration when a strong
    /// signal arrives before the inversion window.
    pub fn apply(
        &mut self,
        base_confidence: f64,
        membership: f64,
        key: &str,
        now: DateTime<Utc>,
    ) -> (f64, Vec<String>) {
        if !self.active {
            return (base_confidence, Vec::new());
        }

        let days = self.days_in(now);
        let inverted = days > INVERSION_AFTER_DAYS;

        // A strong signal ends exploration early — but never once inverted.
        if !inverted
            && base_confidence > INVERT_REJECT_CONFIDENCE
            && membership > STRICT_MEMBERSHIP_FLOOR
        {
            self.exit(key, now, "strong live signal");
            return (
                base_confidence,
                vec!["exploration ended by strong signal".to_string()],
            );
        }

        let mut notes = vec![match self.entry_reason.as_deref() {
            Some(reason) => format!("exploration mode: {reason}"),
            None => "exploration mode".to_string(),
        }];
        let mut confidence = base_confidence;

        // Strict zone enforcement.
        if membership < STRICT_MEMBERSHIP_FLOOR && !inverted {
            if confidence > STRICT_CONFIDENCE_CAP {
                confidence = STRICT_CONFIDENCE_CAP;
                notes.push("strict zone enforcement capped confidence".to_string());
            }
        }

        // Lukewarm confidence discount.
        if confidence > MODERATE_BAND.0 && confidence < MODERATE_BAND.1 {
            confidence *= MODERATE_DISCOUNT;
            notes.push("moderate confidence discounted while exploring".to_string());
        }

        // Time-based selectivity.
        let selectivity = (1.0 - 0.1 * days).max(0.3);
        confidence *= selectivity;

        // Behaviour inversion after two days: probe the regime change.
        if inverted {
            if membership > STRICT_MEMBERSHIP_FLOOR
                && base_confidence >= INVERT_REJECT_CONFIDENCE
            {
                confidence = INVERT_REJECTED_VALUE;
                notes.push(
                    "inverted: rejecting previously profitable pattern".to_string(),
                );
            } else if membership < INVERT_PROBE_MEMBERSHIP {
                confidence = confidence.max(INVERT_PROBE_VALUE);
                notes.push("inverted: probing off-zone pattern".to_string());
            }
            notes.push(format!("exploration day {days:.1}, inverted selection"));
        } else {
            notes.push(format!(
                "exploration day {days:.1}, selectivity {selectivity:.2}"
            ));
        }

        (confidence.clamp(0.0, 1.0), notes)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    // ---- entry -----------------------------------------------------------

    #[test]
    fn five_low_confidence_evaluations_enter_exploration() {
        let mut state = ExplorationState::new();
        for _ in 0..4 {
            state.record_evaluation(0.45, 0.8, "MGC/long", now());
            assert!(!state.is_active());
        }
        state.record_evaluation(0.45, 0.8, "MGC/long", now());
        assert!(state.is_active());
        assert!(state
            .entry_reason()
            .unwrap()
            .contains("consecutive low confidence"));
    }

    #[test]
    fn three_low_membership_evaluations_enter_exploration() {
        let mut state = ExplorationState::new();
        for _ in 0..3 {
            state.record_evaluation(0.6, 0.3, "MGC/long", now());
        }
        assert!(state.is_active());
    }

    #[test]
    fn three_losses_enter_exploration() {
        let mut state = ExplorationState::new();
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "MGC/long", now());
        }
        assert!(state.is_active());
        assert_eq!(state.entry_reason(), Some("3 consecutive losses"));
    }

    #[test]
    fn deep_rolling_drawdown_enters_exploration() {
        let mut state = ExplorationState::new();
        // Alternate so no loss run forms, but the rolling sum sinks.
        for i in 0..12 {
            let pnl = if i % 2 == 0 { -30.0 } else { 8.0 };
            state.record_outcome(pnl, pnl > 5.0, "MGC/long", now());
        }
        assert!(state.is_active());
        assert!(state.entry_reason().unwrap().contains("rolling pnl"));
    }

    // ---- effects ---------------------------------------------------------

    #[test]
    fn strict_enforcement_caps_off_zone_confidence() {
        let mut state = ExplorationState::new();
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "k", now());
        }
        let (conf, notes) = state.apply(0.65, 0.5, "k", now());
        assert!(conf <= STRICT_CONFIDENCE_CAP);
        assert!(notes.iter().any(|n| n.contains("strict zone enforcement")));
    }

    #[test]
    fn moderate_band_is_discounted() {
        let mut state = ExplorationState::new();
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "k", now());
        }
        // Membership fine, confidence lukewarm.
        let (conf, _) = state.apply(0.6, 0.9, "k", now());
        // 0.6 × 0.6 discount × ~1.0 selectivity.
        assert!(conf < 0.4);
    }

    #[test]
    fn inversion_rejects_previously_good_patterns() {
        let mut state = ExplorationState::new();
        let entered = now() - Duration::hours(60);
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "k", entered);
        }
        assert!(state.is_active());
        // 60 hours in: inverted.
        let (conf, notes) = state.apply(0.7, 0.95, "k", now());
        assert!(conf <= 0.15);
        assert!(notes.iter().any(|n| n.contains("inverted")));
    }

    #[test]
    fn inversion_probes_off_zone_patterns() {
        let mut state = ExplorationState::new();
        let entered = now() - Duration::hours(60);
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "k", entered);
        }
        let (conf, _) = state.apply(0.2, 0.3, "k", now());
        assert!(conf >= 0.55);
    }

    // ---- exit ------------------------------------------------------------

    #[test]
    fn strong_signal_exits_before_inversion() {
        let mut state = ExplorationState::new();
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "k", now());
        }
        let (conf, _) = state.apply(0.75, 0.8, "k", now());
        assert_eq!(conf, 0.75);
        assert!(!state.is_active());
    }

    #[test]
    fn two_wins_with_positive_rolling_pnl_exit() {
        let mut state = ExplorationState::new();
        for _ in 0..3 {
            state.record_outcome(-10.0, false, "k", now());
        }
        assert!(state.is_active());
        state.record_outcome(40.0, true, "k", now());
        assert!(state.is_active());
        state.record_outcome(40.0, true, "k", now());
        assert!(!state.is_active());
    }

    #[test]
    fn selectivity_decays_with_days() {
        let mut state = ExplorationState::new();
        let entered = now() - Duration::hours(36);
        for _ in 0..3 {
            state.record_outcome(-20.0, false, "k", entered);
        }
        // Day 1.5, not yet inverted: 0.8 confidence with strong membership
        // passes strict checks but still pays the selectivity multiplier...
        let (conf, _) = state.apply(0.69, 0.9, "k", now());
        // 0.69 avoids the early-exit branch (needs > 0.7): discounted by
        // the moderate band (×0.6) and selectivity (×0.85).
        assert!(conf < 0.4);
    }
}
