// =============================================================================
// Recent-Trade Modulator — tail-window analysis and risk adjustments
// =============================================================================
//
// Inspects the last few outcomes for a partition and, when the tail looks
// ugly, adjusts the recommendation that is about to go out. The modulator
// never silently rejects and never raises confidence: it either overrides
// SL/TP toward protection or subtracts a confidence penalty, and it always
// explains itself in the reasons list.
//
// Tiers, first match wins:
//   1. ≥3 consecutive losses that left >$20 profit on the table
//        → tighter_risk (take the profit that was repeatedly there)
//   2. ≥3 consecutive losses that never saw $10 of profit
//        → ultra_tight_risk (the edge is gone; risk almost nothing)
//   3. ≥3 consecutive losses otherwise   → cautious_risk, penalty 0.3
//   4. ≥2 consecutive same-direction losses (trend-following error)
//        → penalty 0.3
//   5. ≥5 trades with win rate <40%      → penalty 0.3
//
// The ring buffer is populated synchronously on outcome submission so the
// tail reacts immediately; the durable store catches up on the next reload.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::memory::partition::{Partition, PartitionKey};
use crate::runtime_config::{RuntimeConfig, WindowMode};
use crate::types::{Direction, RecentTradesSummary, TradeOutcome};

/// Confidence penalty applied by the penalty tiers.
pub const CONFIDENCE_PENALTY: f64 = 0.3;

/// Consecutive-loss count that activates the protective tiers.
const LOSS_RUN_TRIGGER: u32 = 3;
/// Average max-profit above this routes to `tighter_risk`.
const PROFIT_LEFT_THRESHOLD: f64 = 20.0;
/// Average max-profit below this routes to `ultra_tight_risk`.
const NO_PROFIT_THRESHOLD: f64 = 10.0;
/// Win-rate tier thresholds.
const WIN_RATE_MIN_TRADES: u32 = 5;
const WIN_RATE_FLOOR: f64 = 0.4;
/// Ultra-tight override, in points.
const ULTRA_TIGHT_POINTS: f64 = 1.0;

// ---------------------------------------------------------------------------
// Ring entries
// ---------------------------------------------------------------------------

/// One recent outcome as held in the in-process ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentOutcome {
    pub entry_signal_id: String,
    pub pnl_per_contract: f64,
    pub is_win: bool,
    pub is_loss: bool,
    pub max_profit: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// True when the source record carried any data-type tag (drives the
    /// auto window-mode selector).
    pub tagged: bool,
}

impl RecentOutcome {
    fn from_outcome(outcome: &TradeOutcome) -> Self {
        Self {
            entry_signal_id: outcome.entry_signal_id.clone(),
            pnl_per_contract: outcome.per_contract_pnl(),
            is_win: outcome.is_win(),
            is_loss: outcome.is_loss(),
            max_profit: outcome.max_profit.filter(|v| v.is_finite()),
            timestamp: outcome.timestamp,
            tagged: outcome.data_type.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tail metrics
// ---------------------------------------------------------------------------

/// Measurements over the analysed tail window.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailMetrics {
    pub consecutive_losses: u32,
    pub win_rate: f64,
    pub total: u32,
    /// Mean |loss| across the current losing run.
    pub avg_abs_loss: f64,
    /// Mean max-profit across the current losing run.
    pub avg_max_profit_of_losses: f64,
    pub same_direction_losses: u32,
    pub trendfollowing_error: bool,
}

impl TailMetrics {
    pub fn summary(&self) -> RecentTradesSummary {
        RecentTradesSummary {
            consecutive_losses: self.consecutive_losses,
            recent_win_rate: self.win_rate,
            total_recent_trades: self.total,
            trendfollowing_error: self.trendfollowing_error,
        }
    }
}

/// Compute tail metrics over outcomes ordered oldest-first.
pub fn analyze(tail: &[RecentOutcome]) -> TailMetrics {
    if tail.is_empty() {
        return TailMetrics::default();
    }

    let total = tail.len() as u32;
    let wins = tail.iter().filter(|o| o.is_win).count();
    let win_rate = wins as f64 / total as f64;

    let mut consecutive_losses = 0u32;
    for outcome in tail.iter().rev() {
        if outcome.is_loss {
            consecutive_losses += 1;
        } else {
            break;
        }
    }

    let losses: Vec<&RecentOutcome> = tail.iter().filter(|o| o.is_loss).collect();

    // Loss magnitude and max-profit across the losing run (the trades the
    // protective tiers act on).
    let run = &tail[tail.len() - consecutive_losses as usize..];
    let avg_abs_loss = if run.is_empty() {
        0.0
    } else {
        run.iter().map(|o| o.pnl_per_contract.abs()).sum::<f64>() / run.len() as f64
    };
    let run_profits: Vec<f64> = run.iter().filter_map(|o| o.max_profit).collect();
    let avg_max_profit_of_losses = if run_profits.is_empty() {
        0.0
    } else {
        run_profits.iter().sum::<f64>() / run_profits.len() as f64
    };

    // The ring is partition-scoped, so every loss shares the direction.
    let same_direction_losses = losses.len() as u32;
    let trendfollowing_error = consecutive_losses >= 2 && same_direction_losses >= 2;

    TailMetrics {
        consecutive_losses,
        win_rate,
        total,
        avg_abs_loss,
        avg_max_profit_of_losses,
        same_direction_losses,
        trendfollowing_error,
    }
}

// ---------------------------------------------------------------------------
// Adjustments
// ---------------------------------------------------------------------------

/// Closed set of modulator actions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RiskAdjustment {
    /// Override SL/TP to capture the profit recent losers kept giving back.
    TighterRisk { tp_points: f64, sl_points: f64 },
    /// Near-minimal risk envelope; the pattern shows no profit at all.
    UltraTightRisk,
    /// Confidence penalty without an override.
    CautiousRisk,
    /// Same-direction losing streak penalty.
    TrendfollowingPenalty,
    /// Sustained poor win rate penalty.
    PoorWinRatePenalty,
}

impl RiskAdjustment {
    /// Confidence subtracted by this adjustment.
    pub fn penalty(&self) -> f64 {
        match self {
            Self::TighterRisk { .. } | Self::UltraTightRisk => 0.0,
            Self::CautiousRisk | Self::TrendfollowingPenalty | Self::PoorWinRatePenalty => {
                CONFIDENCE_PENALTY
            }
        }
    }

    /// SL/TP override in currency, when the adjustment carries one.
    pub fn risk_override(&self, point_value: f64) -> Option<(f64, f64)> {
        match self {
            Self::TighterRisk { tp_points, sl_points } => {
                Some((sl_points * point_value, tp_points * point_value))
            }
            Self::UltraTightRisk => Some((
                ULTRA_TIGHT_POINTS * point_value,
                ULTRA_TIGHT_POINTS * point_value,
            )),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::TighterRisk { tp_points, sl_points } => format!(
                "adjusted for protection: recent losses left profit on the table \
                 (tp {tp_points:.0}pt, sl {sl_points:.0}pt)"
            ),
            Self::UltraTightRisk => {
                "adjusted for protection: recent losses saw no profit — ultra tight risk"
                    .to_string()
            }
            Self::CautiousRisk => "cautious risk after consecutive losses".to_string(),
            Self::TrendfollowingPenalty => {
                "trend-following error: repeated same-direction losses".to_string()
            }
            Self::PoorWinRatePenalty => "recent win rate below 40%".to_string(),
        }
    }
}

/// Pick the adjustment for the measured tail, if any.
pub fn adjust(metrics: &TailMetrics) -> Option<RiskAdjustment> {
    if metrics.consecutive_losses >= LOSS_RUN_TRIGGER {
        if metrics.avg_max_profit_of_losses > PROFIT_LEFT_THRESHOLD {
            return Some(RiskAdjustment::TighterRisk {
                tp_points: (metrics.avg_max_profit_of_losses / 10.0).round(),
                sl_points: (0.7 * metrics.avg_abs_loss / 10.0).round(),
            });
        }
        if metrics.avg_max_profit_of_losses < NO_PROFIT_THRESHOLD {
            return Some(RiskAdjustment::UltraTightRisk);
        }
        return Some(RiskAdjustment::CautiousRisk);
    }

    if metrics.consecutive_losses >= 2 && metrics.trendfollowing_error {
        return Some(RiskAdjustment::TrendfollowingPenalty);
    }

    if metrics.total >= WIN_RATE_MIN_TRADES && metrics.win_rate < WIN_RATE_FLOOR {
        return Some(RiskAdjustment::PoorWinRatePenalty);
    }

    None
}

// ---------------------------------------------------------------------------
// Modulator (ring owner)
// ---------------------------------------------------------------------------

pub struct RecentTradeModulator {
    config: std::sync::Arc<RwLock<RuntimeConfig>>,
    rings: RwLock<HashMap<PartitionKey, VecDeque<RecentOutcome>>>,
}

impl RecentTradeModulator {
    pub fn new(config: std::sync::Arc<RwLock<RuntimeConfig>>) -> Self {
        Self {
            config,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Synchronous feedback path: push one outcome into the ring.
    pub fn record(&self, outcome: &TradeOutcome) {
        let key = PartitionKey::new(&outcome.instrument, outcome.direction);
        let capacity = self.config.read().recent_ring_capacity;

        let mut rings = self.rings.write();
        let ring = rings.entry(key.clone()).or_default();
        ring.push_back(RecentOutcome::from_outcome(outcome));
        while ring.len() > capacity {
            ring.pop_front();
        }
        debug!(partition = %key, depth = ring.len(), "recent outcome recorded");
    }

    /// Assemble the tail for analysis: partition history merged with the
    /// in-process ring (ring entries not yet visible in the snapshot are
    /// appended), bounded by the configured window and — in wall-clock mode
    /// — a trailing time window strictly before `as_of`.
    pub fn tail_for(
        &self,
        instrument: &str,
        direction: Direction,
        partition: Option<&Partition>,
        as_of: DateTime<Utc>,
    ) -> Vec<RecentOutcome> {
        let config = self.config.read();
        let window = config.recent_trade_window;
        let hours = config.recent_window_hours;
        let mode = config.recent_window_mode;
        let capacity = config.recent_ring_capacity;
        drop(config);

        let key = PartitionKey::new(instrument, direction);

        let mut merged: Vec<RecentOutcome> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut any_tagged = false;

        if let Some(partition) = partition {
            any_tagged = partition.has_tagged_records();
            // Only the newest slice of the partition can matter; bounding the
            // scan keeps the hot path flat even at millions of vectors.
            let tail = partition.tail((window + capacity) * 2);
            for record in tail {
                if !matches!(record.outcome.data_type, Some(crate::types::DataType::Recent) | None)
                {
                    continue;
                }
                let entry = RecentOutcome::from_outcome(&record.outcome);
                seen.insert(entry.entry_signal_id.clone());
                merged.push(entry);
            }
        }

        {
            let rings = self.rings.read();
            if let Some(ring) = rings.get(&key) {
                for entry in ring {
                    any_tagged |= entry.tagged;
                    if seen.insert(entry.entry_signal_id.clone()) {
                        merged.push(entry.clone());
                    }
                }
            }
        }

        merged.sort_by_key(|o| o.timestamp);

        // Window-mode selection: explicit config wins; auto falls back to
        // sequence order for untagged (backtest-style) histories.
        let wall_clock = match mode {
            WindowMode::WallClock => true,
            WindowMode::Sequence => false,
            WindowMode::Auto => any_tagged,
        };

        if wall_clock {
            let floor = as_of - Duration::hours(hours);
            merged.retain(|o| o.timestamp < as_of && o.timestamp >= floor);
        }

        if merged.len() > window {
            merged.split_off(merged.len() - window)
        } else {
            merged
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
    }

    fn outcome(
        id: &str,
        minute: i64,
        pnl: f64,
        max_profit: Option<f64>,
    ) -> TradeOutcome {
        TradeOutcome {
            entry_signal_id: id.to_string(),
            instrument: "MGC AUG25".to_string(),
            direction: Direction::Long,
            entry_type: None,
            timestamp: base_time() + Duration::minutes(minute),
            data_type: None,
            features: HashMap::new(),
            pnl,
            pnl_per_contract: Some(pnl),
            max_profit,
            max_loss: None,
            exit_reason: None,
            was_good_exit: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    fn recent(id: &str, minute: i64, pnl: f64, max_profit: Option<f64>) -> RecentOutcome {
        RecentOutcome::from_outcome(&outcome(id, minute, pnl, max_profit))
    }

    fn modulator() -> RecentTradeModulator {
        RecentTradeModulator::new(Arc::new(RwLock::new(RuntimeConfig::default())))
    }

    // ---- metrics ---------------------------------------------------------

    #[test]
    fn empty_tail_has_default_metrics() {
        let m = analyze(&[]);
        assert_eq!(m.total, 0);
        assert_eq!(m.consecutive_losses, 0);
        assert!(adjust(&m).is_none());
    }

    #[test]
    fn consecutive_losses_count_from_the_newest() {
        let tail = vec![
            recent("a", 0, -10.0, None),
            recent("b", 1, 30.0, None),
            recent("c", 2, -15.0, None),
            recent("d", 3, -20.0, None),
        ];
        let m = analyze(&tail);
        assert_eq!(m.consecutive_losses, 2);
        assert_eq!(m.total, 4);
        assert!((m.win_rate - 0.25).abs() < 1e-9);
    }

    /// Three losses averaging $30+ of unrealised profit route to the
    /// tighter-risk override with rounded point targets.
    #[test]
    fn profit_left_on_table_yields_tighter_risk() {
        let tail = vec![
            recent("w", 0, 40.0, Some(55.0)),
            recent("a", 1, -30.0, Some(25.0)),
            recent("b", 2, -25.0, Some(30.0)),
            recent("c", 3, -40.0, Some(22.0)),
        ];
        let m = analyze(&tail);
        assert_eq!(m.consecutive_losses, 3);
        // (25 + 30 + 22) / 3 ≈ 25.67
        assert!((m.avg_max_profit_of_losses - 25.666_666_666_666_668).abs() < 1e-9);

        let adj = adjust(&m).unwrap();
        match &adj {
            RiskAdjustment::TighterRisk { tp_points, sl_points } => {
                assert_eq!(*tp_points, 3.0);
                // avg |loss| = (30+25+40)/3 ≈ 31.67; 0.7·31.67/10 ≈ 2.2 → 2.
                assert_eq!(*sl_points, 2.0);
            }
            other => panic!("expected tighter risk, got {other:?}"),
        }
        assert_eq!(adj.penalty(), 0.0);
        assert_eq!(adj.risk_override(10.0), Some((20.0, 30.0)));
    }

    #[test]
    fn no_profit_seen_yields_ultra_tight() {
        let tail = vec![
            recent("a", 0, -20.0, Some(4.0)),
            recent("b", 1, -18.0, Some(6.0)),
            recent("c", 2, -25.0, Some(3.0)),
        ];
        let adj = adjust(&analyze(&tail)).unwrap();
        assert_eq!(adj, RiskAdjustment::UltraTightRisk);
        assert_eq!(adj.penalty(), 0.0);
        assert_eq!(adj.risk_override(10.0), Some((10.0, 10.0)));
    }

    #[test]
    fn middling_profit_yields_cautious_penalty() {
        let tail = vec![
            recent("a", 0, -20.0, Some(15.0)),
            recent("b", 1, -18.0, Some(14.0)),
            recent("c", 2, -25.0, Some(16.0)),
        ];
        let adj = adjust(&analyze(&tail)).unwrap();
        assert_eq!(adj, RiskAdjustment::CautiousRisk);
        assert_eq!(adj.penalty(), CONFIDENCE_PENALTY);
        assert!(adj.risk_override(10.0).is_none());
    }

    #[test]
    fn two_same_direction_losses_flag_trendfollowing() {
        let tail = vec![
            recent("w", 0, 30.0, None),
            recent("a", 1, -12.0, None),
            recent("b", 2, -14.0, None),
        ];
        let m = analyze(&tail);
        assert!(m.trendfollowing_error);
        assert_eq!(
            adjust(&m),
            Some(RiskAdjustment::TrendfollowingPenalty)
        );
    }

    #[test]
    fn poor_win_rate_over_five_trades_penalises() {
        // No loss run at the end, just a grim hit rate.
        let tail = vec![
            recent("a", 0, -12.0, None),
            recent("b", 1, -14.0, None),
            recent("c", 2, -9.0, None),
            recent("d", 3, -11.0, None),
            recent("e", 4, 30.0, None),
        ];
        let m = analyze(&tail);
        assert_eq!(m.consecutive_losses, 0);
        assert_eq!(adjust(&m), Some(RiskAdjustment::PoorWinRatePenalty));
    }

    #[test]
    fn healthy_tail_needs_no_adjustment() {
        let tail = vec![
            recent("a", 0, 20.0, None),
            recent("b", 1, 15.0, None),
            recent("c", 2, -5.0, None),
            recent("d", 3, 25.0, None),
            recent("e", 4, 30.0, None),
        ];
        assert!(adjust(&analyze(&tail)).is_none());
    }

    // ---- ring + windows --------------------------------------------------

    #[test]
    fn ring_caps_at_capacity() {
        let m = modulator();
        for i in 0..30 {
            m.record(&outcome(&format!("s{i}"), i, 10.0, None));
        }
        let tail = m.tail_for("MGC", Direction::Long, None, base_time() + Duration::hours(1));
        // Window (10) is the binding constraint here.
        assert_eq!(tail.len(), 10);
        assert_eq!(tail.last().unwrap().entry_signal_id, "s29");
    }

    #[test]
    fn ring_and_partition_merge_dedups_by_signal_id() {
        use crate::memory::features::FeatureRegistry;

        let m = modulator();
        let shared = outcome("dup", 5, -10.0, None);
        m.record(&shared);
        m.record(&outcome("ring-only", 6, 12.0, None));

        let partition = Partition::build(
            PartitionKey::new("MGC", Direction::Long),
            vec![shared.clone(), outcome("store-only", 4, 8.0, None)],
            &FeatureRegistry::default(),
        );

        let tail = m.tail_for(
            "MGC",
            Direction::Long,
            Some(&partition),
            base_time() + Duration::hours(1),
        );
        let ids: Vec<&str> = tail.iter().map(|o| o.entry_signal_id.as_str()).collect();
        assert_eq!(ids, vec!["store-only", "dup", "ring-only"]);
    }

    #[test]
    fn wall_clock_mode_drops_stale_and_future_outcomes() {
        let config = RuntimeConfig {
            recent_window_mode: WindowMode::WallClock,
            ..Default::default()
        };
        let m = RecentTradeModulator::new(Arc::new(RwLock::new(config)));
        m.record(&outcome("stale", -60 * 30, -10.0, None)); // 30 h old
        m.record(&outcome("fresh", -30, 15.0, None));
        m.record(&outcome("future", 60, -20.0, None)); // after the query

        let tail = m.tail_for("MGC", Direction::Long, None, base_time());
        let ids: Vec<&str> = tail.iter().map(|o| o.entry_signal_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn sequence_mode_ignores_wall_clock() {
        let config = RuntimeConfig {
            recent_window_mode: WindowMode::Sequence,
            ..Default::default()
        };
        let m = RecentTradeModulator::new(Arc::new(RwLock::new(config)));
        m.record(&outcome("old", -60 * 300, -10.0, None));
        m.record(&outcome("new", -30, 15.0, None));

        let tail = m.tail_for("MGC", Direction::Long, None, base_time());
        assert_eq!(tail.len(), 2);
    }
}
