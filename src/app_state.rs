// =============================================================================
// Central Application State — Meridian Risk Nexus
// =============================================================================
//
// The single source of truth for the hosting process. Subsystems manage their
// own interior mutability; AppState ties them together and provides a unified
// snapshot for the state API and the WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for all mutable shared collections.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::audit::AuditLog;
use crate::coordinator::RiskCoordinator;
use crate::evaluate::robust::evaluator::ZoneStatus;
use crate::evaluate::robust::RobustZoneEvaluator;
use crate::memory::MemoryManager;
use crate::recent_trades::RecentTradeModulator;
use crate::runtime_config::RuntimeConfig;
use crate::types::{EvalMethod, RiskResponse};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

// =============================================================================
// Records
// =============================================================================

/// A recorded error event for the state surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Audit-trail row for one evaluation decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub id: String,
    pub instrument: String,
    pub direction: String,
    pub method: EvalMethod,
    pub approved: bool,
    pub confidence: f64,
    pub suggested_sl: f64,
    pub suggested_tp: f64,
    pub created_at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation; the WebSocket feed uses it to detect
    /// changes and push updates.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub memory: Arc<MemoryManager>,
    pub robust: Arc<RobustZoneEvaluator>,
    pub modulator: Arc<RecentTradeModulator>,
    pub coordinator: Arc<RiskCoordinator>,
    pub audit: Arc<AuditLog>,

    // ── Counters ────────────────────────────────────────────────────────
    /// Evaluation count per method tag.
    pub method_counts: RwLock<HashMap<&'static str, u64>>,

    // ── Decision audit trail ────────────────────────────────────────────
    pub recent_decisions: RwLock<Vec<DecisionRecord>>,

    // ── Error log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        runtime_config: Arc<RwLock<RuntimeConfig>>,
        memory: Arc<MemoryManager>,
        robust: Arc<RobustZoneEvaluator>,
        modulator: Arc<RecentTradeModulator>,
        coordinator: Arc<RiskCoordinator>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            runtime_config,
            memory,
            robust,
            modulator,
            coordinator,
            audit,
            method_counts: RwLock::new(HashMap::new()),
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            started_at: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Version tracking
    // -------------------------------------------------------------------------

    pub fn increment_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Track one completed evaluation on the decision trail and the
    /// per-method counters.
    pub fn record_decision(&self, instrument: &str, direction: &str, response: &RiskResponse) {
        {
            let mut counts = self.method_counts.write();
            *counts.entry(response.method.as_str()).or_insert(0) += 1;
        }

        let record = DecisionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instrument: instrument.to_string(),
            direction: direction.to_string(),
            method: response.method,
            approved: response.approved,
            confidence: response.confidence,
            suggested_sl: response.suggested_sl,
            suggested_tp: response.suggested_tp,
            created_at: Utc::now().to_rfc3339(),
        };

        let mut decisions = self.recent_decisions.write();
        decisions.push(record);
        if decisions.len() > MAX_RECENT_DECISIONS {
            let overflow = decisions.len() - MAX_RECENT_DECISIONS;
            decisions.drain(..overflow);
        }
        drop(decisions);

        self.increment_version();
    }

    pub fn record_error(&self, message: impl Into<String>, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        });
        if errors.len() > MAX_RECENT_ERRORS {
            let overflow = errors.len() - MAX_RECENT_ERRORS;
            errors.drain(..overflow);
        }
        drop(errors);

        self.increment_version();
    }

    // -------------------------------------------------------------------------
    // Snapshot for the state API / WebSocket feed
    // -------------------------------------------------------------------------

    pub fn build_snapshot(&self) -> StateSnapshot {
        let memory = self.memory.snapshot();

        let partitions: Vec<PartitionSummary> = {
            let mut rows: Vec<PartitionSummary> = memory
                .partitions
                .iter()
                .map(|(key, partition)| PartitionSummary {
                    key: key.to_string(),
                    vectors: partition.len(),
                    graduated_features: memory
                        .tables
                        .get(key)
                        .map(|t| t.features.len())
                        .unwrap_or(0),
                    table_version: memory.tables.get(key).map(|t| t.version),
                })
                .collect();
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            rows
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            started_at: self.started_at.to_rfc3339(),
            snapshot_version: memory.version,
            total_vectors: memory.total_vectors,
            untagged_vectors: memory.untagged_vectors,
            store_unreachable: self.memory.store_unreachable(),
            reload_count: self.memory.reload_count(),
            recompute_count: self.memory.recompute_count(),
            partitions,
            zones: self.robust.zone_statuses(Utc::now()),
            method_counts: self
                .method_counts
                .read()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            recent_decisions: self.recent_decisions.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Snapshot shape
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSummary {
    pub key: String,
    pub vectors: usize,
    pub graduated_features: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_version: Option<u64>,
}

/// Full engine state pushed to dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub started_at: String,
    pub snapshot_version: u64,
    pub total_vectors: usize,
    pub untagged_vectors: usize,
    pub store_unreachable: bool,
    pub reload_count: u64,
    pub recompute_count: u64,
    pub partitions: Vec<PartitionSummary>,
    pub zones: Vec<ZoneStatus>,
    pub method_counts: HashMap<String, u64>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub recent_errors: Vec<ErrorRecord>,
}
