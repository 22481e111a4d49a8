// =============================================================================
// Robust-Zone Evaluator — zones + stability + adjustment cycle + exploration
// =============================================================================
//
// The default evaluation strategy. Holds the live zone map and the per-key
// state machines; the 15-minute evolution loop rebuilds zones from each
// partition's rolling window and steps the adjustment cycles, while the hot
// path only reads and scores.
//
// Zone keys carry an optional entry type: a request with
// entryType="ORDER_FLOW_IMBALANCE" prefers that specific zone and falls back
// to the partition-wide one.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::audit::AuditLog;
use crate::evaluate::robust::adjustment::{AdjustmentCycle, CyclePhase};
use crate::evaluate::robust::exploration::{ExplorationPhase, ExplorationState};
use crate::evaluate::robust::stability;
use crate::evaluate::robust::zone::{self, RobustZone};
use crate::evaluate::{size_risk, Evaluation};
use crate::memory::manager::MemorySnapshot;
use crate::memory::partition::normalize_instrument;
use crate::memory::VectorRecord;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Direction, EvalMethod, TradeOutcome};

/// Published robust confidence is clamped to this range.
const CONFIDENCE_FLOOR: f64 = 0.1;
const CONFIDENCE_CEIL: f64 = 0.9;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Zone identity: partition key plus optional entry type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ZoneKey {
    pub instrument: String,
    pub direction: Direction,
    pub entry_type: Option<String>,
}

impl ZoneKey {
    pub fn new(raw_instrument: &str, direction: Direction, entry_type: Option<&str>) -> Self {
        Self {
            instrument: normalize_instrument(raw_instrument),
            direction,
            entry_type: entry_type.map(str::to_string),
        }
    }

    /// The partition-wide key (entry type stripped).
    pub fn base(&self) -> Self {
        Self {
            instrument: self.instrument.clone(),
            direction: self.direction,
            entry_type: None,
        }
    }
}

impl std::fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry_type {
            Some(et) => write!(f, "{}/{}/{}", self.instrument, self.direction, et),
            None => write!(f, "{}/{}", self.instrument, self.direction),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What the robust evaluator hands the coordinator.
#[derive(Debug, Clone)]
pub struct RobustEvaluation {
    pub evaluation: Evaluation,
    /// `RobustZones`, or `RobustZonesWaiting` during an adjustment wait.
    pub method: EvalMethod,
    pub membership: f64,
}

/// Per-key status row for the state surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStatus {
    pub key: String,
    pub robustness_score: f64,
    pub sample_size: usize,
    pub cycle_phase: CyclePhase,
    pub wait_remaining: u32,
    pub exploration: ExplorationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_adjustment: Option<String>,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct RobustZoneEvaluator {
    config: Arc<RwLock<RuntimeConfig>>,
    audit: Arc<AuditLog>,

    zones: RwLock<HashMap<ZoneKey, RobustZone>>,
    cycles: RwLock<HashMap<ZoneKey, AdjustmentCycle>>,
    exploration: RwLock<HashMap<ZoneKey, ExplorationState>>,
}

impl RobustZoneEvaluator {
    pub fn new(config: Arc<RwLock<RuntimeConfig>>, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            audit,
            zones: RwLock::new(HashMap::new()),
            cycles: RwLock::new(HashMap::new()),
            exploration: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Hot path
    // -------------------------------------------------------------------------

    /// Score a live request. `None` when no zone exists for the key (the
    /// coordinator falls through to the next evaluator).
    pub fn evaluate(
        &self,
        instrument: &str,
        direction: Direction,
        entry_type: Option<&str>,
        features: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Option<RobustEvaluation> {
        let specific = ZoneKey::new(instrument, direction, entry_type);
        let base = specific.base();

        let zones = self.zones.read();
        let (key, zone) = if let Some(z) = zones.get(&specific) {
            (specific, z.clone())
        } else if let Some(z) = zones.get(&base) {
            (base, z.clone())
        } else {
            return None;
        };
        drop(zones);

        let membership = zone::membership(&zone, features);
        let base_confidence =
            (membership * zone.robustness_score).clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL);

        let mut reasons = vec![
            zone.description.clone(),
            format!(
                "membership {membership:.2} x robustness {:.2}",
                zone.robustness_score
            ),
        ];

        // Adjustment wait status.
        let mut method = EvalMethod::RobustZones;
        {
            let cycles = self.cycles.read();
            if let Some(cycle) = cycles.get(&key) {
                if cycle.is_waiting() {
                    method = EvalMethod::RobustZonesWaiting;
                    reasons.push(format!(
                        "adjustment settling: {} trades remaining",
                        cycle.wait_remaining
                    ));
                }
            }
        }

        // Exploration effects use the state as of *before* this evaluation;
        // the evaluation is recorded afterwards so entry triggers fire on
        // the next request.
        let mut exploration = self.exploration.write();
        let state = exploration.entry(key.clone()).or_default();
        let was_active = state.is_active();

        let (confidence, notes) =
            state.apply(base_confidence, membership, &key.to_string(), now);
        reasons.extend(notes);

        state.record_evaluation(base_confidence, membership, &key.to_string(), now);
        self.audit_transition(&key, was_active, state.is_active());
        drop(exploration);

        let (suggested_sl, suggested_tp) = size_risk(confidence);

        Some(RobustEvaluation {
            evaluation: Evaluation {
                confidence: confidence.clamp(0.0, 1.0),
                suggested_sl,
                suggested_tp,
                reasons,
            },
            method,
            membership,
        })
    }

    /// Exploration phase for one key (state surface + response shaping).
    pub fn exploration_phase(
        &self,
        instrument: &str,
        direction: Direction,
        entry_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> ExplorationPhase {
        let key = ZoneKey::new(instrument, direction, entry_type);
        let exploration = self.exploration.read();
        exploration
            .get(&key)
            .or_else(|| exploration.get(&key.base()))
            .map(|s| s.phase(now))
            .unwrap_or(ExplorationPhase::Normal)
    }

    // -------------------------------------------------------------------------
    // Feedback
    // -------------------------------------------------------------------------

    /// Feed a trade outcome into the per-key state machines (wait countdown,
    /// exploration entry/exit).
    pub fn record_outcome(&self, outcome: &TradeOutcome, now: DateTime<Utc>) {
        let mut keys = vec![ZoneKey::new(
            &outcome.instrument,
            outcome.direction,
            None,
        )];
        if let Some(et) = &outcome.entry_type {
            keys.push(ZoneKey::new(&outcome.instrument, outcome.direction, Some(et)));
        }

        let pnl = outcome.per_contract_pnl();
        let is_win = outcome.is_win();

        for key in keys {
            {
                let mut cycles = self.cycles.write();
                if let Some(cycle) = cycles.get_mut(&key) {
                    cycle.on_trade();
                }
            }
            let mut exploration = self.exploration.write();
            let state = exploration.entry(key.clone()).or_default();
            let was_active = state.is_active();
            state.record_outcome(pnl, is_win, &key.to_string(), now);
            self.audit_transition(&key, was_active, state.is_active());
        }
    }

    // -------------------------------------------------------------------------
    // Evolution loop
    // -------------------------------------------------------------------------

    /// One evolution pass: rebuild zones from each partition's rolling
    /// window and step the adjustment cycles. Runs on a wall-clock cadence
    /// from a background task; the hot path never calls this.
    pub fn evolve(&self, snapshot: &MemorySnapshot, now: DateTime<Utc>) {
        let config = self.config.read().clone();

        for (pkey, partition) in &snapshot.partitions {
            let window = partition.tail(config.recent_window_size);

            // Partition-wide zone plus one per entry type with enough trades.
            let mut keys: Vec<(ZoneKey, Vec<Arc<VectorRecord>>)> = Vec::new();
            keys.push((
                ZoneKey::new(&pkey.instrument, pkey.direction, None),
                window.to_vec(),
            ));
            for et in distinct_entry_types(window) {
                let filtered: Vec<Arc<VectorRecord>> = window
                    .iter()
                    .filter(|v| v.outcome.entry_type.as_deref() == Some(et.as_str()))
                    .cloned()
                    .collect();
                if filtered.len() >= config.min_trades_for_update {
                    keys.push((
                        ZoneKey::new(&pkey.instrument, pkey.direction, Some(&et)),
                        filtered,
                    ));
                }
            }

            for (key, window) in keys {
                if window.len() < config.min_trades_for_update {
                    continue;
                }
                self.evolve_key(&key, &window, config.target_wait_trades, now);
            }
        }
    }

    /// Evolve a single zone key against its filtered window. One pass moves
    /// the cycle at most one phase: an unstable observation enters `adjust`,
    /// the next pass applies the chosen adjustment and enters `wait`.
    fn evolve_key(
        &self,
        key: &ZoneKey,
        window: &[Arc<VectorRecord>],
        target_wait_trades: u32,
        now: DateTime<Utc>,
    ) {
        let mut cycles = self.cycles.write();
        let cycle = cycles.entry(key.clone()).or_default();

        let pnls: Vec<f64> = window.iter().map(|v| v.outcome.per_contract_pnl()).collect();
        let equity = stability::assess(&pnls);
        let consecutive_losses = trailing_losses(window);

        match cycle.phase {
            // Observing: refresh the zone from current data, and flag the
            // key for adjustment when the curve degrades.
            CyclePhase::Observe => {
                if let Some(mut rebuilt) = zone::build_zone(window, now) {
                    let mut zones = self.zones.write();
                    if let Some(previous) = zones.get(key) {
                        rebuilt.last_adjustment = previous.last_adjustment.clone();
                    }
                    zones.insert(key.clone(), rebuilt);
                }

                if equity.is_unstable || consecutive_losses >= 2 {
                    cycle.enter_adjust();
                    info!(
                        key = %key,
                        level = ?equity.level,
                        consecutive_losses,
                        "zone degradation detected — entering adjust phase"
                    );
                    self.audit.record(
                        "adjustment",
                        "enter_adjust",
                        serde_json::json!({
                            "key": key.to_string(),
                            "degradation": equity.level,
                            "consecutiveLosses": consecutive_losses,
                            "stability": equity.stability,
                        }),
                    );
                } else {
                    debug!(key = %key, "zone observed — healthy");
                }
            }

            // Adjusting: pick one lever against the current conditions,
            // pull it, then sit out the wait.
            CyclePhase::Adjust => {
                let kind = cycle.select(equity.level, consecutive_losses);

                let mut zones = self.zones.write();
                let Some(zone_entry) = zones.get_mut(key) else {
                    return;
                };

                if kind.rebuilds_zone() {
                    if let Some(rebuilt) = zone::build_zone(window, now) {
                        *zone_entry = rebuilt;
                    }
                }
                cycle.apply(zone_entry, kind, target_wait_trades);

                info!(
                    key = %key,
                    adjustment = %kind,
                    level = ?equity.level,
                    consecutive_losses,
                    "zone adjustment applied"
                );
                self.audit.record(
                    "adjustment",
                    kind.as_str(),
                    serde_json::json!({
                        "key": key.to_string(),
                        "degradation": equity.level,
                        "consecutiveLosses": consecutive_losses,
                        "stability": equity.stability,
                        "robustness": zone_entry.robustness_score,
                    }),
                );
            }

            // Waiting: outcomes count the phase down via `record_outcome`.
            CyclePhase::Wait => {
                debug!(
                    key = %key,
                    remaining = cycle.wait_remaining,
                    "adjustment settling — no evolution"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // State surface
    // -------------------------------------------------------------------------

    pub fn zone_statuses(&self, now: DateTime<Utc>) -> Vec<ZoneStatus> {
        let zones = self.zones.read();
        let cycles = self.cycles.read();
        let exploration = self.exploration.read();

        let mut statuses: Vec<ZoneStatus> = zones
            .iter()
            .map(|(key, zone)| {
                let cycle = cycles.get(key);
                ZoneStatus {
                    key: key.to_string(),
                    robustness_score: zone.robustness_score,
                    sample_size: zone.sample_size,
                    cycle_phase: cycle.map(|c| c.phase).unwrap_or(CyclePhase::Observe),
                    wait_remaining: cycle.map(|c| c.wait_remaining).unwrap_or(0),
                    exploration: exploration
                        .get(key)
                        .map(|s| s.phase(now))
                        .unwrap_or(ExplorationPhase::Normal),
                    last_adjustment: zone.last_adjustment.clone(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    fn audit_transition(&self, key: &ZoneKey, was_active: bool, is_active: bool) {
        if was_active != is_active {
            let action = if is_active { "enter" } else { "exit" };
            self.audit.record(
                "exploration",
                action,
                serde_json::json!({ "key": key.to_string() }),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn distinct_entry_types(window: &[Arc<VectorRecord>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in window {
        if let Some(et) = &record.outcome.entry_type {
            if seen.insert(et.clone()) {
                out.push(et.clone());
            }
        }
    }
    out
}

/// Consecutive losses counted back from the newest outcome.
fn trailing_losses(window: &[Arc<VectorRecord>]) -> u32 {
    let mut run = 0u32;
    for record in window.iter().rev() {
        if record.outcome.is_loss() {
            run += 1;
        } else {
            break;
        }
    }
    run
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::memory::features::FeatureRegistry;
    use crate::memory::partition::Partition;

    fn evaluator() -> RobustZoneEvaluator {
        let dir = std::env::temp_dir().join(format!("meridian-robust-{}", std::process::id()));
        RobustZoneEvaluator::new(
            Arc::new(RwLock::new(RuntimeConfig::default())),
            Arc::new(AuditLog::new(dir).unwrap()),
        )
    }

    fn record(id: usize, pnl: f64, edge: f64, entry_type: Option<&str>) -> Arc<VectorRecord> {
        let mut features = HashMap::new();
        features.insert("edge".to_string(), edge);
        let outcome = TradeOutcome {
            entry_signal_id: format!("sig-{id}"),
            instrument: "MGC AUG25".to_string(),
            direction: Direction::Long,
            entry_type: entry_type.map(str::to_string),
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

    /// Healthy window: 30 winners around edge 50, 10 early losers.
    fn healthy_window() -> Vec<Arc<VectorRecord>> {
        let mut w: Vec<Arc<VectorRecord>> = (0..10)
            .map(|i| record(i, -8.0, 15.0, None))
            .collect();
        w.extend((10..40).map(|i| record(i, 30.0 + (i % 4) as f64, 45.0 + (i % 10) as f64, None)));
        w
    }

    fn seed_zone(ev: &RobustZoneEvaluator, window: &[Arc<VectorRecord>]) {
        let key = ZoneKey::new("MGC", Direction::Long, None);
        let zone = zone::build_zone(window, Utc::now()).unwrap();
        ev.zones.write().insert(key, zone);
    }

    fn features(edge: f64) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("edge".to_string(), edge);
        m
    }

    // ---- evaluation ------------------------------------------------------

    #[test]
    fn no_zone_defers_to_fallback() {
        let ev = evaluator();
        assert!(ev
            .evaluate("MGC", Direction::Long, None, &features(50.0), Utc::now())
            .is_none());
    }

    #[test]
    fn in_zone_request_scores_confidently() {
        let ev = evaluator();
        seed_zone(&ev, &healthy_window());
        let result = ev
            .evaluate("MGC AUG25", Direction::Long, None, &features(49.0), Utc::now())
            .unwrap();
        assert_eq!(result.method, EvalMethod::RobustZones);
        assert!(result.membership >= 0.9);
        assert!((CONFIDENCE_FLOOR..=CONFIDENCE_CEIL).contains(&result.evaluation.confidence));
        assert!(!result.evaluation.reasons.is_empty());
    }

    #[test]
    fn off_zone_request_scores_low() {
        let ev = evaluator();
        seed_zone(&ev, &healthy_window());
        let result = ev
            .evaluate("MGC", Direction::Long, None, &features(500.0), Utc::now())
            .unwrap();
        assert!(result.membership <= 0.2);
        assert!(result.evaluation.confidence <= 0.2);
    }

    #[test]
    fn waiting_cycle_tags_the_method() {
        let ev = evaluator();
        let window = healthy_window();
        seed_zone(&ev, &window);
        let key = ZoneKey::new("MGC", Direction::Long, None);
        {
            let mut cycles = ev.cycles.write();
            let cycle = cycles.entry(key.clone()).or_default();
            let mut zones = ev.zones.write();
            cycle.apply(
                zones.get_mut(&key).unwrap(),
                crate::evaluate::robust::adjustment::AdjustmentKind::GentleTighten,
                5,
            );
        }
        let result = ev
            .evaluate("MGC", Direction::Long, None, &features(49.0), Utc::now())
            .unwrap();
        assert_eq!(result.method, EvalMethod::RobustZonesWaiting);
        assert!(result
            .evaluation
            .reasons
            .iter()
            .any(|r| r.contains("trades remaining")));
    }

    // ---- evolution -------------------------------------------------------

    #[test]
    fn evolve_builds_zones_from_partitions() {
        let ev = evaluator();
        let window = healthy_window();
        let outcomes: Vec<TradeOutcome> = window.iter().map(|r| r.outcome.clone()).collect();

        let registry = FeatureRegistry::from_names(["edge"]);
        let pkey = crate::memory::PartitionKey::new("MGC", Direction::Long);
        let partition = Arc::new(Partition::build(pkey.clone(), outcomes, &registry));

        let mut snapshot = MemorySnapshot::empty();
        snapshot.partitions.insert(pkey, partition);

        ev.evolve(&snapshot, Utc::now());
        assert!(ev
            .zones
            .read()
            .contains_key(&ZoneKey::new("MGC", Direction::Long, None)));
    }

    #[test]
    fn unstable_window_walks_the_cycle_to_wait() {
        let ev = evaluator();
        // Profitable early (so a zone builds), collapsing late.
        let mut window: Vec<Arc<VectorRecord>> = (0..25)
            .map(|i| record(i, 28.0, 48.0 + (i % 6) as f64, None))
            .collect();
        window.extend((25..40).map(|i| record(i, -35.0, 20.0, None)));

        let outcomes: Vec<TradeOutcome> = window.iter().map(|r| r.outcome.clone()).collect();
        let registry = FeatureRegistry::from_names(["edge"]);
        let pkey = crate::memory::PartitionKey::new("MGC", Direction::Long);
        let partition = Arc::new(Partition::build(pkey.clone(), outcomes, &registry));
        let mut snapshot = MemorySnapshot::empty();
        snapshot.partitions.insert(pkey, partition);

        let key = ZoneKey::new("MGC", Direction::Long, None);

        // First pass observes the degradation and enters the adjust phase;
        // nothing is mutated yet.
        ev.evolve(&snapshot, Utc::now());
        {
            let cycles = ev.cycles.read();
            assert_eq!(cycles.get(&key).unwrap().phase, CyclePhase::Adjust);
            assert!(ev.zones.read().get(&key).unwrap().last_adjustment.is_none());
        }

        // Second pass applies the adjustment and starts the wait.
        ev.evolve(&snapshot, Utc::now());
        let cycles = ev.cycles.read();
        assert_eq!(cycles.get(&key).unwrap().phase, CyclePhase::Wait);
        assert!(ev.zones.read().get(&key).unwrap().last_adjustment.is_some());
    }

    #[test]
    fn outcomes_count_down_the_wait_phase() {
        let ev = evaluator();
        seed_zone(&ev, &healthy_window());
        let key = ZoneKey::new("MGC", Direction::Long, None);
        {
            let mut cycles = ev.cycles.write();
            let cycle = cycles.entry(key.clone()).or_default();
            let mut zones = ev.zones.write();
            cycle.apply(
                zones.get_mut(&key).unwrap(),
                crate::evaluate::robust::adjustment::AdjustmentKind::GentleTighten,
                2,
            );
        }

        let outcome = record(99, 15.0, 50.0, None).outcome.clone();
        ev.record_outcome(&outcome, Utc::now());
        ev.record_outcome(&outcome, Utc::now());

        let cycles = ev.cycles.read();
        assert_eq!(cycles.get(&key).unwrap().phase, CyclePhase::Observe);
    }
}
