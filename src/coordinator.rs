// =============================================================================
// Risk Coordinator — request pipeline from routing to response assembly
// =============================================================================
//
// Per-request flow:
//   1. Capture one memory snapshot (the request reads nothing else).
//   2. Route to the primary evaluator; fall through robust_zones →
//      graduated_ranges → rule_based when data preconditions fail, tagging
//      fallthrough methods with a `_fallback` suffix.
//   3. Apply the recent-trade modulator (overrides and penalties only —
//      confidence never goes up here).
//   4. Clamp to caller caps, then scale by √quantity with a $5 per-contract
//      floor, then re-apply caps (a caller cap is a hard limit).
//   5. approved = confidence ≥ 0.5, structurally.
//   6. Attach the pullback hint from profitable history.
//
// Every stage runs inside a panic guard: an internal failure surfaces as an
// `error_no_fallback` response, never a synthesised approval and never a
// crash. A blown deadline short-circuits to the rule-based safety response.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::evaluate::robust::RobustZoneEvaluator;
use crate::evaluate::{graduated, rule_based, Evaluation};
use crate::graduation::stats;
use crate::memory::manager::{MemoryManager, MemorySnapshot};
use crate::memory::partition::Partition;
use crate::recent_trades::{self, RecentTradeModulator, TailMetrics};
use crate::runtime_config::{PrimaryEvaluator, RuntimeConfig};
use crate::store::{PredictorClient, VectorStoreClient};
use crate::types::{
    EvalFailure, EvalMethod, PullbackDetails, RiskRequest, RiskResponse, TradeOutcome,
};

/// Structural approval threshold. No code path may bypass it.
const APPROVAL_THRESHOLD: f64 = 0.5;
/// Per-contract floor applied after position-size scaling (currency).
const SCALED_RISK_FLOOR: f64 = 5.0;

pub struct RiskCoordinator {
    config: Arc<RwLock<RuntimeConfig>>,
    memory: Arc<MemoryManager>,
    robust: Arc<RobustZoneEvaluator>,
    modulator: Arc<RecentTradeModulator>,
    store: Arc<VectorStoreClient>,
    predictor: Option<Arc<PredictorClient>>,
}

impl RiskCoordinator {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        memory: Arc<MemoryManager>,
        robust: Arc<RobustZoneEvaluator>,
        modulator: Arc<RecentTradeModulator>,
        store: Arc<VectorStoreClient>,
        predictor: Option<Arc<PredictorClient>>,
    ) -> Self {
        Self {
            config,
            memory,
            robust,
            modulator,
            store,
            predictor,
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation entry point
    // -------------------------------------------------------------------------

    pub async fn evaluate(&self, request: &RiskRequest) -> Result<RiskResponse, EvalFailure> {
        let started = Instant::now();
        let now = request.timestamp.unwrap_or_else(Utc::now);

        // One snapshot for the whole request: partitions and graduation
        // tables always come from the same reload.
        let snapshot = self.memory.snapshot();

        let guarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.evaluate_pipeline(request, &snapshot, now, started)
        }));

        let mut response = match guarded {
            Ok(response) => response,
            Err(panic) => {
                let message = panic_message(&panic);
                error!(message = %message, "evaluator panicked");
                return Err(EvalFailure::new("EVALUATOR_INTERNAL_ERROR", message));
            }
        };

        // Advisory predictor context; never fabricated when unavailable.
        if let Some(predictor) = &self.predictor {
            if !deadline_blown(request, started) {
                match predictor
                    .predict(&request.instrument, request.direction, &request.features)
                    .await
                {
                    Ok(p) => response.reasons.push(format!(
                        "predictor: confidence {:.2}, pnl {:.1}±{:.1}",
                        p.confidence, p.pnl.mean, p.pnl.std
                    )),
                    Err(e) => {
                        warn!(error = %e, "predictor unavailable — continuing without it");
                    }
                }
            }
        }

        response.duration = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    /// The synchronous pipeline body (inside the panic guard).
    fn evaluate_pipeline(
        &self,
        request: &RiskRequest,
        snapshot: &MemorySnapshot,
        now: DateTime<Utc>,
        started: Instant,
    ) -> RiskResponse {
        let config = self.config.read().clone();
        let partition = snapshot
            .partition(&request.instrument, request.direction)
            .map(|p| &**p);

        // Sanitise the live feature map once: non-finite values are dropped,
        // never treated as zero.
        let features: HashMap<String, f64> = request
            .features
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        // --- Deadline short-circuit (rule-based safety response) ----------
        if deadline_blown(request, started) {
            let mut evaluation = rule_based::evaluate(
                &features,
                request.direction,
                request.entry_signal_id.as_deref(),
            );
            evaluation
                .reasons
                .insert(0, "deadline exceeded — rule-based safety response".to_string());
            return self.assemble(
                request,
                partition,
                evaluation,
                EvalMethod::RuleBased,
                TailMetrics::default(),
                started,
            );
        }

        // --- Route to an evaluator ----------------------------------------
        let (mut evaluation, method) =
            self.route(request, snapshot, partition, &features, &config, now);

        // --- Recent-trade modulation ---------------------------------------
        let tail = self.modulator.tail_for(
            &request.instrument,
            request.direction,
            partition,
            now,
        );
        let metrics = recent_trades::analyze(&tail);

        if let Some(adjustment) = recent_trades::adjust(&metrics) {
            let penalty = adjustment.penalty();
            if penalty > 0.0 {
                evaluation.confidence = (evaluation.confidence - penalty).max(0.0);
            }
            if let Some((sl, tp)) = adjustment.risk_override(config.point_value) {
                evaluation.suggested_sl = sl;
                evaluation.suggested_tp = tp;
            }
            evaluation.reasons.push(adjustment.describe());
            debug!(
                instrument = %request.instrument,
                adjustment = ?adjustment,
                "recent-trade adjustment applied"
            );
        }

        self.assemble(request, partition, evaluation, method, metrics, started)
    }

    /// Evaluator routing with ordered fallthrough: the configured primary
    /// first, then the other learned evaluator, then rule-based. A
    /// non-primary evaluator tags its method with the `_fallback` suffix.
    fn route(
        &self,
        request: &RiskRequest,
        snapshot: &MemorySnapshot,
        partition: Option<&Partition>,
        features: &HashMap<String, f64>,
        config: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> (Evaluation, EvalMethod) {
        let order: &[PrimaryEvaluator] = match config.primary_evaluator {
            PrimaryEvaluator::RobustZones => {
                &[PrimaryEvaluator::RobustZones, PrimaryEvaluator::GraduatedRanges]
            }
            PrimaryEvaluator::GraduatedRanges => {
                &[PrimaryEvaluator::GraduatedRanges, PrimaryEvaluator::RobustZones]
            }
            PrimaryEvaluator::RuleBased => &[],
        };

        let mut fell_through = false;
        for strategy in order {
            let is_primary = !fell_through;
            match strategy {
                PrimaryEvaluator::RobustZones => {
                    if let Some(result) = self.robust.evaluate(
                        &request.instrument,
                        request.direction,
                        request.entry_type.as_deref(),
                        features,
                        now,
                    ) {
                        let method = if !is_primary && result.method == EvalMethod::RobustZones {
                            EvalMethod::RobustZonesFallback
                        } else {
                            result.method
                        };
                        return (result.evaluation, method);
                    }
                    fell_through = true;
                }
                PrimaryEvaluator::GraduatedRanges => {
                    if let Some(table) = snapshot.table(&request.instrument, request.direction) {
                        let evaluation = graduated::evaluate(table, features);
                        let method = if is_primary {
                            EvalMethod::GraduatedRanges
                        } else {
                            EvalMethod::GraduatedRangesFallback
                        };
                        return (evaluation, method);
                    }
                    fell_through = true;
                }
                PrimaryEvaluator::RuleBased => {}
            }
        }

        let mut evaluation = rule_based::evaluate(
            features,
            request.direction,
            request.entry_signal_id.as_deref(),
        );

        let no_memory = partition.map(|p| p.is_empty()).unwrap_or(true);
        let method = if no_memory {
            evaluation.reasons.insert(
                0,
                format!(
                    "no memory for {}/{}",
                    crate::memory::normalize_instrument(&request.instrument),
                    request.direction
                ),
            );
            EvalMethod::RuleBasedNoMemory
        } else {
            if fell_through {
                evaluation
                    .reasons
                    .insert(0, "insufficient learned data — rule-based fallback".to_string());
            }
            EvalMethod::RuleBased
        };

        (evaluation, method)
    }

    /// Caps, scaling, approval, pullback, and final response shape.
    fn assemble(
        &self,
        request: &RiskRequest,
        partition: Option<&Partition>,
        evaluation: Evaluation,
        method: EvalMethod,
        metrics: TailMetrics,
        started: Instant,
    ) -> RiskResponse {
        let confidence = evaluation.confidence.clamp(0.0, 1.0);
        let mut sl = evaluation.suggested_sl.max(0.0);
        let mut tp = evaluation.suggested_tp.max(0.0);

        // Caller caps.
        if let Some(cap) = request.max_stop_loss {
            sl = sl.min(cap);
        }
        if let Some(cap) = request.max_take_profit {
            tp = tp.min(cap);
        }

        // Position-size scaling with the per-contract floor; caps re-applied
        // because they are hard caller limits.
        let quantity = request.quantity.max(1);
        if quantity > 1 {
            let divisor = (quantity as f64).sqrt();
            sl = (sl / divisor).max(SCALED_RISK_FLOOR);
            tp = (tp / divisor).max(SCALED_RISK_FLOOR);
        }
        if let Some(cap) = request.max_stop_loss {
            sl = sl.min(cap);
        }
        if let Some(cap) = request.max_take_profit {
            tp = tp.min(cap);
        }

        let approved = confidence >= APPROVAL_THRESHOLD;

        let mut reasons = evaluation.reasons;
        if reasons.is_empty() {
            reasons.push(format!("method {method}"));
        }

        RiskResponse {
            approved,
            confidence,
            suggested_sl: sl,
            suggested_tp: tp,
            method,
            reasons,
            recent_trades: metrics.summary(),
            pullback_details: pullback_from(partition),
            duration: started.elapsed().as_millis() as u64,
        }
    }

    // -------------------------------------------------------------------------
    // Outcome feedback path
    // -------------------------------------------------------------------------

    /// Accept a completed trade outcome: the in-process ring and the zone
    /// state machines see it immediately; the durable store write is best
    /// effort (the next reload reconciles either way).
    pub async fn submit_outcome(&self, outcome: &TradeOutcome) {
        self.modulator.record(outcome);
        self.robust.record_outcome(outcome, Utc::now());

        if let Err(e) = self.store.store_outcome(outcome).await {
            warn!(
                entry_signal_id = %outcome.entry_signal_id,
                error = %e,
                "outcome store write failed — ring retains it until next reload"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn deadline_blown(request: &RiskRequest, started: Instant) -> bool {
    match request.deadline_ms {
        Some(deadline) => started.elapsed().as_millis() as u64 >= deadline,
        None => false,
    }
}

/// Soft-floor trailing-exit hint from the partition's profitable history.
fn pullback_from(partition: Option<&Partition>) -> PullbackDetails {
    let Some(partition) = partition else {
        return PullbackDetails::default();
    };

    let profits: Vec<f64> = partition
        .vectors()
        .iter()
        .filter(|v| v.outcome.is_profitable())
        .map(|v| v.outcome.per_contract_pnl())
        .collect();
    let Some(avg_profit) = stats::mean(&profits) else {
        return PullbackDetails::default();
    };

    let max_profits: Vec<f64> = partition
        .vectors()
        .iter()
        .filter(|v| v.outcome.is_profitable())
        .filter_map(|v| v.outcome.max_profit)
        .filter(|v| v.is_finite())
        .collect();
    let avg_max_profit = stats::mean(&max_profits).unwrap_or(avg_profit);

    PullbackDetails {
        step_size: (0.25 * avg_profit).round().max(5.0),
        soft_floor: (0.4 * avg_profit).round().max(10.0),
        max_profit_estimate: avg_max_profit,
        threshold_drop_percent: 15.0,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown evaluator panic".to_string()
    }
}
