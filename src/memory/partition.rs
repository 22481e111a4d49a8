// =============================================================================
// Partitions — outcome vectors keyed by (normalized instrument, direction)
// =============================================================================
//
// A partition holds the ordered (oldest-first) history of trade outcomes for
// one base instrument and direction. Partitions are immutable once built; the
// memory manager replaces them wholesale on reload.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::features::FeatureRegistry;
use crate::types::{DataType, Direction, TradeOutcome};

// ---------------------------------------------------------------------------
// Instrument normalisation
// ---------------------------------------------------------------------------

/// Normalise a raw instrument symbol to its base form: first
/// whitespace-delimited token, upper-cased. `"MGC AUG25"` → `"MGC"`.
/// Missing or empty input yields `"UNKNOWN"`.
///
/// Idempotent: normalising an already-normalised symbol is a no-op.
pub fn normalize_instrument(raw: &str) -> String {
    match raw.trim().split_whitespace().next() {
        Some(token) if !token.is_empty() => token.to_uppercase(),
        _ => "UNKNOWN".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Partition key
// ---------------------------------------------------------------------------

/// Identity of a partition. Construction normalises the instrument, so two
/// keys built from "MGC AUG25" and "MGC SEP25" collide on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PartitionKey {
    pub instrument: String,
    pub direction: Direction,
}

impl PartitionKey {
    pub fn new(raw_instrument: &str, direction: Direction) -> Self {
        Self {
            instrument: normalize_instrument(raw_instrument),
            direction,
        }
    }
}

// Display is used in log fields and audit records: "MGC/long".
impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instrument, self.direction)
    }
}

// ---------------------------------------------------------------------------
// Stored vector
// ---------------------------------------------------------------------------

/// An outcome vector as held in memory: the wire record plus its dense
/// feature array (indexed by the snapshot's feature registry).
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub outcome: TradeOutcome,
    /// Registry-indexed values; NaN marks absent or non-finite entries.
    pub dense: Vec<f64>,
}

impl VectorRecord {
    pub fn new(outcome: TradeOutcome, registry: &FeatureRegistry) -> Self {
        let dense = registry.densify(&outcome.features);
        Self { outcome, dense }
    }

    /// Dense feature value by id, if present and finite.
    pub fn value(&self, id: u16) -> Option<f64> {
        self.dense
            .get(id as usize)
            .copied()
            .filter(|v| v.is_finite())
    }
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// Ordered outcome history for one `(instrument, direction)` key.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: PartitionKey,
    /// Oldest-first; readers wanting the tail iterate from the end.
    vectors: Vec<Arc<VectorRecord>>,
    /// Whether any record carries a data-type tag (window-mode selection).
    tagged: bool,
}

impl Partition {
    /// Build a partition from pre-deduplicated outcomes. Sorts by timestamp
    /// ascending; ties keep arrival order.
    pub fn build(
        key: PartitionKey,
        mut outcomes: Vec<TradeOutcome>,
        registry: &FeatureRegistry,
    ) -> Self {
        outcomes.sort_by_key(|o| o.timestamp);
        let tagged = outcomes.iter().any(|o| o.data_type.is_some());
        let vectors = outcomes
            .into_iter()
            .map(|o| Arc::new(VectorRecord::new(o, registry)))
            .collect();
        Self { key, vectors, tagged }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// All vectors, oldest-first.
    pub fn vectors(&self) -> &[Arc<VectorRecord>] {
        &self.vectors
    }

    /// Vectors eligible for recency queries: tagged RECENT, or untagged
    /// legacy records.
    pub fn recent_vectors(&self) -> impl Iterator<Item = &Arc<VectorRecord>> {
        self.vectors.iter().filter(|v| {
            matches!(v.outcome.data_type, Some(DataType::Recent) | None)
        })
    }

    /// Vectors eligible for training: TRAINING, RECENT, or untagged.
    pub fn training_vectors(&self) -> impl Iterator<Item = &Arc<VectorRecord>> {
        self.vectors.iter().filter(|v| {
            !matches!(v.outcome.data_type, Some(DataType::OutOfSample))
        })
    }

    /// Most recent observed bar time.
    pub fn latest_bar_time(&self) -> Option<DateTime<Utc>> {
        self.vectors.last().map(|v| v.outcome.timestamp)
    }

    /// True when at least one record carries a data-type tag. Drives the
    /// auto window-mode selector.
    pub fn has_tagged_records(&self) -> bool {
        self.tagged
    }

    /// Last `n` vectors, newest-last.
    pub fn tail(&self, n: usize) -> &[Arc<VectorRecord>] {
        let start = self.vectors.len().saturating_sub(n);
        &self.vectors[start..]
    }
}
