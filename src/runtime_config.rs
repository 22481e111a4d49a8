// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian risk engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_store_base_url() -> String {
    "http://127.0.0.1:3015".to_string()
}

fn default_store_timeout_secs() -> u64 {
    10
}

fn default_listen_addr() -> String {
    "0.0.0.0:7380".to_string()
}

fn default_audit_dir() -> String {
    "audit".to_string()
}

fn default_reload_poll_secs() -> u64 {
    30
}

fn default_graduation_interval_minutes() -> i64 {
    30
}

fn default_min_partition_vectors() -> usize {
    10
}

fn default_min_feature_samples() -> usize {
    5
}

fn default_min_selection_samples() -> usize {
    30
}

fn default_min_correlation() -> f64 {
    0.12
}

fn default_max_graduated_features() -> usize {
    15
}

fn default_min_profitable_samples() -> usize {
    10
}

fn default_recent_window_size() -> usize {
    100
}

fn default_min_trades_for_update() -> usize {
    20
}

fn default_zone_evolution_interval_secs() -> u64 {
    900
}

fn default_target_wait_trades() -> u32 {
    10
}

fn default_recent_trade_window() -> usize {
    10
}

fn default_recent_ring_capacity() -> usize {
    20
}

fn default_recent_window_hours() -> i64 {
    24
}

fn default_point_value() -> f64 {
    10.0
}

// =============================================================================
// Enumerated settings
// =============================================================================

/// Which evaluator the coordinator tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryEvaluator {
    RobustZones,
    GraduatedRanges,
    RuleBased,
}

impl Default for PrimaryEvaluator {
    fn default() -> Self {
        Self::RobustZones
    }
}

/// How the recent-trade modulator bounds its tail window.
///
/// `Auto` selects `Sequence` when no record in the partition carries a
/// data-type tag (backtest replays), `WallClock` otherwise. The selector is
/// explicit configuration, never inferred from timestamps alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Auto,
    Sequence,
    WallClock,
}

impl Default for WindowMode {
    fn default() -> Self {
        Self::Auto
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- External services ---------------------------------------------------

    /// Base URL of the durable vector store.
    #[serde(default = "default_store_base_url")]
    pub store_base_url: String,

    /// Request timeout for store calls, in seconds.
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    /// Base URL of the optional external predictor. When absent the
    /// coordinator never fabricates predictions.
    #[serde(default)]
    pub predictor_base_url: Option<String>,

    /// Bind address for the REST/WebSocket surface.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Bearer token guarding the authenticated endpoints. Usually injected
    /// via `MERIDIAN_ADMIN_TOKEN` at startup; when unset, every
    /// authenticated route refuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,

    /// Directory receiving daily-rotated audit files.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,

    // --- Memory manager ------------------------------------------------------

    /// Store poll cadence in seconds (stats read, reload on growth).
    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,

    /// Bar-time advance (minutes) that triggers a graduation recompute.
    #[serde(default = "default_graduation_interval_minutes")]
    pub graduation_interval_minutes: i64,

    /// Minimum vectors in a partition before any graduation is attempted.
    #[serde(default = "default_min_partition_vectors")]
    pub min_partition_vectors: usize,

    // --- Graduation learner --------------------------------------------------

    /// A feature must appear (finite) in at least this many vectors to be
    /// scored at all.
    #[serde(default = "default_min_feature_samples")]
    pub min_feature_samples: usize,

    /// Sample-size floor for a feature to survive selection.
    #[serde(default = "default_min_selection_samples")]
    pub min_selection_samples: usize,

    /// |Pearson correlation| floor for a feature to survive selection.
    #[serde(default = "default_min_correlation")]
    pub min_correlation: f64,

    /// Upper bound on graduated features per partition.
    #[serde(default = "default_max_graduated_features")]
    pub max_graduated_features: usize,

    /// Profitable samples required before ranges are derived for a feature.
    #[serde(default = "default_min_profitable_samples")]
    pub min_profitable_samples: usize,

    // --- Robust zones --------------------------------------------------------

    /// Rolling window of most recent trades used for zone updates.
    #[serde(default = "default_recent_window_size")]
    pub recent_window_size: usize,

    /// Minimum trades in the rolling window before a zone update runs.
    #[serde(default = "default_min_trades_for_update")]
    pub min_trades_for_update: usize,

    /// Wall-clock cadence of the zone evolution loop, in seconds.
    #[serde(default = "default_zone_evolution_interval_secs")]
    pub zone_evolution_interval_secs: u64,

    /// Trades to sit out in the `wait` phase after an adjustment.
    #[serde(default = "default_target_wait_trades")]
    pub target_wait_trades: u32,

    // --- Recent-trade modulator ----------------------------------------------

    /// Tail-window length analysed by the modulator.
    #[serde(default = "default_recent_trade_window")]
    pub recent_trade_window: usize,

    /// Capacity of the per-partition recent-outcome ring.
    #[serde(default = "default_recent_ring_capacity")]
    pub recent_ring_capacity: usize,

    /// Trailing wall-clock window (hours) in live mode.
    #[serde(default = "default_recent_window_hours")]
    pub recent_window_hours: i64,

    #[serde(default)]
    pub recent_window_mode: WindowMode,

    // --- Coordinator ---------------------------------------------------------

    #[serde(default)]
    pub primary_evaluator: PrimaryEvaluator,

    /// Currency value of one point per contract (micro-futures convention).
    #[serde(default = "default_point_value")]
    pub point_value: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_base_url: default_store_base_url(),
            store_timeout_secs: default_store_timeout_secs(),
            predictor_base_url: None,
            listen_addr: default_listen_addr(),
            admin_token: None,
            audit_dir: default_audit_dir(),
            reload_poll_secs: default_reload_poll_secs(),
            graduation_interval_minutes: default_graduation_interval_minutes(),
            min_partition_vectors: default_min_partition_vectors(),
            min_feature_samples: default_min_feature_samples(),
            min_selection_samples: default_min_selection_samples(),
            min_correlation: default_min_correlation(),
            max_graduated_features: default_max_graduated_features(),
            min_profitable_samples: default_min_profitable_samples(),
            recent_window_size: default_recent_window_size(),
            min_trades_for_update: default_min_trades_for_update(),
            zone_evolution_interval_secs: default_zone_evolution_interval_secs(),
            target_wait_trades: default_target_wait_trades(),
            recent_trade_window: default_recent_trade_window(),
            recent_ring_capacity: default_recent_ring_capacity(),
            recent_window_hours: default_recent_window_hours(),
            recent_window_mode: WindowMode::Auto,
            primary_evaluator: PrimaryEvaluator::RobustZones,
            point_value: default_point_value(),
        }
    }
}

impl RuntimeConfig {
    /// Read and parse the JSON config at `path`. A missing or malformed
    /// file is the caller's decision to handle — startup warns and runs on
    /// defaults, while an explicit reload surfaces the error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            store = %config.store_base_url,
            primary = ?config.primary_evaluator,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Write the configuration back to `path`. The content lands in a
    /// `.tmp` sibling first and is renamed into place, so a crash mid-write
    /// can never leave a half-written config behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Validate cross-field constraints. Called once at startup; any failure
    /// here is fatal.
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.reload_poll_secs == 0 {
            return Err(EngineError::ConfigInvalid(
                "reload_poll_secs must be >= 1".to_string(),
            ));
        }
        if self.graduation_interval_minutes <= 0 {
            return Err(EngineError::ConfigInvalid(
                "graduation_interval_minutes must be positive".to_string(),
            ));
        }
        if self.max_graduated_features == 0 || self.max_graduated_features > 64 {
            return Err(EngineError::ConfigInvalid(
                "max_graduated_features must be in 1..=64".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_correlation) {
            return Err(EngineError::ConfigInvalid(
                "min_correlation must be in [0, 1]".to_string(),
            ));
        }
        if self.min_trades_for_update > self.recent_window_size {
            return Err(EngineError::ConfigInvalid(
                "min_trades_for_update cannot exceed recent_window_size".to_string(),
            ));
        }
        if self.recent_trade_window > self.recent_ring_capacity {
            return Err(EngineError::ConfigInvalid(
                "recent_trade_window cannot exceed recent_ring_capacity".to_string(),
            ));
        }
        if self.point_value <= 0.0 || !self.point_value.is_finite() {
            return Err(EngineError::ConfigInvalid(
                "point_value must be a positive finite number".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.reload_poll_secs, 30);
        assert_eq!(cfg.graduation_interval_minutes, 30);
        assert_eq!(cfg.max_graduated_features, 15);
        assert_eq!(cfg.recent_window_size, 100);
        assert_eq!(cfg.min_trades_for_update, 20);
        assert_eq!(cfg.target_wait_trades, 10);
        assert_eq!(cfg.recent_trade_window, 10);
        assert_eq!(cfg.primary_evaluator, PrimaryEvaluator::RobustZones);
        assert!((cfg.min_correlation - 0.12).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.min_partition_vectors, 10);
        assert_eq!(cfg.min_selection_samples, 30);
        assert_eq!(cfg.recent_window_mode, WindowMode::Auto);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "primary_evaluator": "graduated_ranges", "recent_window_mode": "sequence" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.primary_evaluator, PrimaryEvaluator::GraduatedRanges);
        assert_eq!(cfg.recent_window_mode, WindowMode::Sequence);
        assert_eq!(cfg.reload_poll_secs, 30);
    }

    #[test]
    fn validation_rejects_zero_poll() {
        let cfg = RuntimeConfig {
            reload_poll_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn validation_rejects_window_inversion() {
        let cfg = RuntimeConfig {
            recent_window_size: 10,
            min_trades_for_update: 20,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
