// =============================================================================
// Shared types used across the Meridian risk engine
// =============================================================================
//
// Wire types mirror the JSON produced by the durable vector store and the
// trading client: camelCase field names, every optional field defaulted so
// that older records never fail to parse.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A realised per-contract P&L above this threshold counts as a win.
pub const WIN_THRESHOLD_PER_CONTRACT: f64 = 5.0;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

// ---------------------------------------------------------------------------
// Data-type tag
// ---------------------------------------------------------------------------

/// Provenance tag carried by stored outcome vectors.
///
/// Records written before the tag existed carry no value; those are treated
/// as legacy `Recent` for recency queries and remain eligible for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Training,
    Recent,
    OutOfSample,
}

// ---------------------------------------------------------------------------
// Outcome vector
// ---------------------------------------------------------------------------

/// A single historical trade outcome as delivered by the durable store.
///
/// Immutable once received. The `features` map is the authoritative feature
/// representation; the memory manager derives a dense array form from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOutcome {
    /// Opaque identifier, unique per trade. Used for de-duplication.
    pub entry_signal_id: String,

    /// Raw symbol, possibly with a contract month (e.g. "MGC AUG25").
    pub instrument: String,

    pub direction: Direction,

    /// Optional categorical tag (e.g. "ORDER_FLOW_IMBALANCE").
    #[serde(default)]
    pub entry_type: Option<String>,

    /// Instant the trade was taken (UTC). Orders partitions and drives
    /// bar-time comparisons.
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub data_type: Option<DataType>,

    /// Feature name → finite value. Non-finite entries are skipped by every
    /// aggregate, never coerced to zero.
    #[serde(default)]
    pub features: HashMap<String, f64>,

    /// Realised P&L for the whole position.
    #[serde(default)]
    pub pnl: f64,

    /// Realised P&L per contract. Preferred over `pnl` whenever present so
    /// that learning is independent of position size.
    #[serde(default)]
    pub pnl_per_contract: Option<f64>,

    /// Best unrealised profit seen during the trade (per contract).
    #[serde(default)]
    pub max_profit: Option<f64>,

    /// Worst unrealised loss seen during the trade (per contract).
    #[serde(default)]
    pub max_loss: Option<f64>,

    /// Categorical exit cause (e.g. "TP", "STOP_LOSS", "MANUAL").
    #[serde(default)]
    pub exit_reason: Option<String>,

    /// Producer-supplied label for exit quality.
    #[serde(default)]
    pub was_good_exit: Option<bool>,

    /// Risk parameters actually used on the trade.
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

impl TradeOutcome {
    /// Per-contract P&L, falling back to raw `pnl` when the per-contract
    /// figure is absent or non-finite.
    pub fn per_contract_pnl(&self) -> f64 {
        match self.pnl_per_contract {
            Some(v) if v.is_finite() => v,
            _ => self.pnl,
        }
    }

    /// Win classification: per-contract P&L above the $5 threshold.
    pub fn is_win(&self) -> bool {
        self.per_contract_pnl() > WIN_THRESHOLD_PER_CONTRACT
    }

    /// Loss classification: per-contract P&L at or below zero.
    pub fn is_loss(&self) -> bool {
        self.per_contract_pnl() <= 0.0
    }

    /// Profitability split used by the learners (strictly positive P&L).
    pub fn is_profitable(&self) -> bool {
        self.per_contract_pnl() > 0.0
    }

    /// Feature value if present and finite.
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied().filter(|v| v.is_finite())
    }
}

// ---------------------------------------------------------------------------
// Risk evaluation request / response
// ---------------------------------------------------------------------------

fn default_quantity() -> u32 {
    1
}

/// Inbound risk evaluation request from the trading client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRequest {
    /// Live feature name → finite value.
    pub features: HashMap<String, f64>,

    pub instrument: String,

    pub direction: Direction,

    #[serde(default)]
    pub entry_type: Option<String>,

    /// Query instant; defaults to "now" when the client omits it.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub entry_signal_id: Option<String>,

    /// Number of contracts. Drives √quantity risk scaling.
    #[serde(default = "default_quantity")]
    pub quantity: u32,

    /// Caller cap on the suggested stop loss (currency).
    #[serde(default)]
    pub max_stop_loss: Option<f64>,

    /// Caller cap on the suggested take profit (currency).
    #[serde(default)]
    pub max_take_profit: Option<f64>,

    /// Soft deadline in milliseconds from receipt. When exceeded the
    /// coordinator short-circuits to the rule-based safety response.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// Which evaluation path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMethod {
    GraduatedRanges,
    RobustZones,
    RobustZonesWaiting,
    RobustZonesFallback,
    GraduatedRangesFallback,
    RuleBased,
    RuleBasedNoMemory,
    ErrorNoFallback,
}

impl EvalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraduatedRanges => "graduated_ranges",
            Self::RobustZones => "robust_zones",
            Self::RobustZonesWaiting => "robust_zones_waiting",
            Self::RobustZonesFallback => "robust_zones_fallback",
            Self::GraduatedRangesFallback => "graduated_ranges_fallback",
            Self::RuleBased => "rule_based",
            Self::RuleBasedNoMemory => "rule_based_no_memory",
            Self::ErrorNoFallback => "error_no_fallback",
        }
    }
}

impl std::fmt::Display for EvalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tail-window summary attached to every successful response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTradesSummary {
    pub consecutive_losses: u32,
    pub recent_win_rate: f64,
    pub total_recent_trades: u32,
    pub trendfollowing_error: bool,
}

/// Soft-floor trailing-exit hint derived from profitable similar patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullbackDetails {
    pub soft_floor: f64,
    pub step_size: f64,
    pub max_profit_estimate: f64,
    pub threshold_drop_percent: f64,
}

impl Default for PullbackDetails {
    fn default() -> Self {
        Self {
            soft_floor: 10.0,
            step_size: 5.0,
            max_profit_estimate: 0.0,
            threshold_drop_percent: 15.0,
        }
    }
}

/// Successful risk evaluation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResponse {
    pub approved: bool,
    /// Always in [0, 1]; `approved` is exactly `confidence >= 0.5`.
    pub confidence: f64,
    /// Currency per contract, after caps and size scaling.
    pub suggested_sl: f64,
    pub suggested_tp: f64,
    pub method: EvalMethod,
    /// Ordered human-readable rationale. Never empty on success.
    pub reasons: Vec<String>,
    #[serde(rename = "recentTrades")]
    pub recent_trades: RecentTradesSummary,
    #[serde(rename = "pullbackDetails")]
    pub pullback_details: PullbackDetails,
    /// Elapsed milliseconds spent inside the coordinator.
    pub duration: u64,
}

/// Error response. Carries no numeric risk fields: callers must treat the
/// evaluation as unusable rather than trade on synthesised values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalFailure {
    pub error: String,
    pub message: String,
    pub method: EvalMethod,
}

impl EvalFailure {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            method: EvalMethod::ErrorNoFallback,
        }
    }
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Engine-level error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Recoverable; the caller falls through to the next evaluator.
    InsufficientData(String),
    /// Recoverable at steady state (snapshot retained); fatal at cold start.
    StoreUnavailable(String),
    /// Per-record; the offending record is skipped.
    FeatureParse(String),
    /// Wrapped and surfaced as `error_no_fallback`.
    EvaluatorInternal(String),
    DeadlineExceeded,
    /// Hard failure at startup.
    ConfigInvalid(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData(msg) => write!(f, "INSUFFICIENT_DATA: {msg}"),
            Self::StoreUnavailable(msg) => write!(f, "STORE_UNAVAILABLE: {msg}"),
            Self::FeatureParse(msg) => write!(f, "FEATURE_PARSE_ERROR: {msg}"),
            Self::EvaluatorInternal(msg) => write!(f, "EVALUATOR_INTERNAL_ERROR: {msg}"),
            Self::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            Self::ConfigInvalid(msg) => write!(f, "CONFIG_INVALID: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(pnl: f64, per_contract: Option<f64>) -> TradeOutcome {
        TradeOutcome {
            entry_signal_id: "sig-1".to_string(),
            instrument: "MGC AUG25".to_string(),
            direction: Direction::Long,
            entry_type: None,
            timestamp: Utc::now(),
            data_type: None,
            features: HashMap::new(),
            pnl,
            pnl_per_contract: per_contract,
            max_profit: None,
            max_loss: None,
            exit_reason: None,
            was_good_exit: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    // ---- win / loss classification ---------------------------------------

    #[test]
    fn per_contract_preferred_over_raw_pnl() {
        let o = outcome(120.0, Some(12.0));
        assert_eq!(o.per_contract_pnl(), 12.0);
    }

    #[test]
    fn raw_pnl_fallback_when_per_contract_absent() {
        let o = outcome(8.0, None);
        assert_eq!(o.per_contract_pnl(), 8.0);
        assert!(o.is_win());
    }

    #[test]
    fn non_finite_per_contract_falls_back() {
        let o = outcome(-3.0, Some(f64::NAN));
        assert_eq!(o.per_contract_pnl(), -3.0);
        assert!(o.is_loss());
    }

    #[test]
    fn small_positive_pnl_is_neither_win_nor_loss() {
        let o = outcome(0.0, Some(3.0));
        assert!(!o.is_win());
        assert!(!o.is_loss());
        assert!(o.is_profitable());
    }

    // ---- serde ----------------------------------------------------------

    #[test]
    fn outcome_parses_camel_case_wire_format() {
        let json = r#"{
            "entrySignalId": "abc",
            "instrument": "MGC AUG25",
            "direction": "long",
            "timestamp": "2025-07-01T14:30:00Z",
            "dataType": "TRAINING",
            "features": {"rsi_14": 45.0},
            "pnl": 55.0,
            "pnlPerContract": 11.0,
            "maxProfit": 18.0
        }"#;
        let o: TradeOutcome = serde_json::from_str(json).unwrap();
        assert_eq!(o.data_type, Some(DataType::Training));
        assert_eq!(o.pnl_per_contract, Some(11.0));
        assert_eq!(o.feature("rsi_14"), Some(45.0));
        assert!(o.feature("missing").is_none());
    }

    #[test]
    fn method_tags_render_as_wire_strings() {
        assert_eq!(EvalMethod::RobustZonesWaiting.as_str(), "robust_zones_waiting");
        assert_eq!(EvalMethod::RuleBasedNoMemory.as_str(), "rule_based_no_memory");
        assert_eq!(
            serde_json::to_string(&EvalMethod::ErrorNoFallback).unwrap(),
            "\"error_no_fallback\""
        );
    }

    #[test]
    fn request_defaults_quantity_to_one() {
        let json = r#"{"features": {}, "instrument": "MGC", "direction": "short"}"#;
        let r: RiskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(r.quantity, 1);
        assert!(r.max_stop_loss.is_none());
    }
}
