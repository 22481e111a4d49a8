// =============================================================================
// Memory Manager — single source of truth for the in-RAM dataset
// =============================================================================
//
// Owns every outcome vector the engine knows about, partitioned by
// (normalized instrument, direction), together with the published graduation
// tables. Publication is copy-on-write: writers assemble a complete
// `MemorySnapshot` off to the side and swap one `Arc` under a brief write
// lock. Readers clone the `Arc` once per request and observe either the old
// or the new snapshot in full, never a mix.
//
// Background duties (driven from main):
//   - Reload poll: read store stats every `reload_poll_secs`; on growth,
//     bulk-fetch and republish.
//   - Graduation debounce: when a partition's observed bar time advances by
//     `graduation_interval_minutes`, enqueue it on the recompute channel.
//   - Recompute worker: drains the channel, rebuilding one table at a time;
//     a failure in one partition never touches the others.
//
// Store failures after the initial load degrade (previous snapshot retained,
// `store_unreachable` flag raised) — they never crash the engine.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::graduation::learner::{self, GraduationTable};
use crate::memory::features::FeatureRegistry;
use crate::memory::partition::{Partition, PartitionKey, VectorRecord};
use crate::runtime_config::RuntimeConfig;
use crate::store::{VectorFilters, VectorStoreClient};
use crate::types::{DataType, Direction, EngineError, TradeOutcome};

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of the whole dataset at one instant. Cheap to clone by
/// `Arc`; a request captures one and reads nothing else for its lifetime.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    /// Monotonic reload counter; bumped on every republish from store data.
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub registry: Arc<FeatureRegistry>,
    pub partitions: HashMap<PartitionKey, Arc<Partition>>,
    pub tables: HashMap<PartitionKey, Arc<GraduationTable>>,
    pub total_vectors: usize,
    /// Vectors carrying no data-type tag (legacy records in use — exposed so
    /// operators can decide whether to filter stricter).
    pub untagged_vectors: usize,
}

impl MemorySnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            loaded_at: Utc::now(),
            registry: Arc::new(FeatureRegistry::default()),
            partitions: HashMap::new(),
            tables: HashMap::new(),
            total_vectors: 0,
            untagged_vectors: 0,
        }
    }

    pub fn partition(&self, instrument: &str, direction: Direction) -> Option<&Arc<Partition>> {
        self.partitions.get(&PartitionKey::new(instrument, direction))
    }

    pub fn table(&self, instrument: &str, direction: Direction) -> Option<&Arc<GraduationTable>> {
        self.tables.get(&PartitionKey::new(instrument, direction))
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct MemoryManager {
    store: Arc<VectorStoreClient>,
    config: Arc<RwLock<RuntimeConfig>>,

    snapshot: RwLock<Arc<MemorySnapshot>>,

    /// Bar time at the last graduation recompute, per partition.
    last_recompute_bar: Mutex<HashMap<PartitionKey, DateTime<Utc>>>,

    /// Store total at the last successful poll, for growth detection.
    last_store_total: AtomicU64,

    reload_count: AtomicU64,
    recompute_count: AtomicU64,
    store_unreachable: AtomicBool,

    recompute_tx: mpsc::UnboundedSender<PartitionKey>,
}

impl MemoryManager {
    /// Create the manager plus the receiving end of its recompute queue
    /// (handed to `run_recompute_worker`).
    pub fn new(
        store: Arc<VectorStoreClient>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PartitionKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            store,
            config,
            snapshot: RwLock::new(Arc::new(MemorySnapshot::empty())),
            last_recompute_bar: Mutex::new(HashMap::new()),
            last_store_total: AtomicU64::new(0),
            reload_count: AtomicU64::new(0),
            recompute_count: AtomicU64::new(0),
            store_unreachable: AtomicBool::new(false),
            recompute_tx: tx,
        });
        (manager, rx)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Current snapshot. One clone of an `Arc`; never blocks on writers for
    /// longer than the pointer swap.
    pub fn snapshot(&self) -> Arc<MemorySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn lookup_graduation(
        &self,
        instrument: &str,
        direction: Direction,
    ) -> Option<Arc<GraduationTable>> {
        self.snapshot().table(instrument, direction).cloned()
    }

    /// Ordered outcome history (oldest-first) for one partition.
    pub fn vectors_for(&self, instrument: &str, direction: Direction) -> Vec<Arc<VectorRecord>> {
        self.snapshot()
            .partition(instrument, direction)
            .map(|p| p.vectors().to_vec())
            .unwrap_or_default()
    }

    /// As `vectors_for`, restricted to RECENT-tagged or untagged records.
    pub fn recent_vectors_for(
        &self,
        instrument: &str,
        direction: Direction,
    ) -> Vec<Arc<VectorRecord>> {
        self.snapshot()
            .partition(instrument, direction)
            .map(|p| p.recent_vectors().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::Relaxed)
    }

    pub fn recompute_count(&self) -> u64 {
        self.recompute_count.load(Ordering::Relaxed)
    }

    pub fn store_unreachable(&self) -> bool {
        self.store_unreachable.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Initial load
    // -------------------------------------------------------------------------

    /// One-shot startup load. Prefers TRAINING ∪ RECENT vectors; if the
    /// store returns none under that filter, re-pulls unfiltered. An empty
    /// store is valid (the engine starts degraded on rule-based responses);
    /// only a store error fails initialisation.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let filtered = VectorFilters {
            data_types: vec![DataType::Training, DataType::Recent],
            ..Default::default()
        };

        let mut outcomes = self
            .store
            .fetch_vectors(&filtered)
            .await
            .map_err(|e| EngineError::StoreUnavailable(format!("initial fetch failed: {e:#}")))?;

        if outcomes.is_empty() {
            debug!("filtered initial fetch empty — re-pulling unfiltered");
            outcomes = self
                .store
                .fetch_vectors(&VectorFilters::default())
                .await
                .map_err(|e| {
                    EngineError::StoreUnavailable(format!("unfiltered fetch failed: {e:#}"))
                })?;
        }

        if let Ok(stats) = self.store.stats().await {
            self.last_store_total.store(stats.total_vectors, Ordering::Relaxed);
        }

        let snapshot = self.apply_dataset(outcomes, true);
        info!(
            partitions = snapshot.partitions.len(),
            tables = snapshot.tables.len(),
            vectors = snapshot.total_vectors,
            untagged = snapshot.untagged_vectors,
            "memory initialised"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reload
    // -------------------------------------------------------------------------

    /// Bulk re-fetch and republish. On store failure the previous snapshot
    /// is retained and the unreachable flag raised.
    pub async fn reload(&self) {
        let filters = VectorFilters {
            data_types: vec![DataType::Training, DataType::Recent],
            ..Default::default()
        };

        let mut outcomes = match self.store.fetch_vectors(&filters).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "reload fetch failed — retaining previous snapshot");
                self.store_unreachable.store(true, Ordering::Relaxed);
                return;
            }
        };

        if outcomes.is_empty() {
            match self.store.fetch_vectors(&VectorFilters::default()).await {
                Ok(o) => outcomes = o,
                Err(e) => {
                    warn!(error = %e, "unfiltered reload fetch failed — retaining previous snapshot");
                    self.store_unreachable.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }

        self.store_unreachable.store(false, Ordering::Relaxed);
        let snapshot = self.apply_dataset(outcomes, false);
        self.reload_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            version = snapshot.version,
            vectors = snapshot.total_vectors,
            "reload published"
        );
    }

    /// Poll the store and run due maintenance. Called on the reload cadence.
    pub async fn on_background_tick(&self) {
        match self.store.stats().await {
            Ok(stats) => {
                let known = self.last_store_total.load(Ordering::Relaxed);
                if stats.total_vectors > known {
                    debug!(known, total = stats.total_vectors, "store grew — reloading");
                    self.reload().await;
                    self.last_store_total.store(stats.total_vectors, Ordering::Relaxed);
                }
                self.store_unreachable.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "store stats poll failed");
                self.store_unreachable.store(true, Ordering::Relaxed);
            }
        }

        self.enqueue_due_recomputes();
    }

    /// Enqueue a recompute for every partition whose bar time advanced past
    /// the graduation interval. Also used by the explicit recompute API with
    /// `force` semantics via `request_recompute`.
    fn enqueue_due_recomputes(&self) {
        let interval = Duration::minutes(self.config.read().graduation_interval_minutes);
        let snapshot = self.snapshot();
        let last_map = self.last_recompute_bar.lock();

        for (key, partition) in &snapshot.partitions {
            let Some(latest) = partition.latest_bar_time() else {
                continue;
            };
            let due = match last_map.get(key) {
                Some(last) => latest.signed_duration_since(*last) >= interval,
                None => true,
            };
            if due {
                let _ = self.recompute_tx.send(key.clone());
            }
        }
    }

    /// Explicit recompute request for one partition (admin surface).
    pub fn request_recompute(&self, instrument: &str, direction: Direction) {
        let _ = self
            .recompute_tx
            .send(PartitionKey::new(instrument, direction));
    }

    // -------------------------------------------------------------------------
    // Graduation recompute
    // -------------------------------------------------------------------------

    /// Rebuild one partition's graduation table and publish it. Errors are
    /// contained to the partition.
    pub fn recompute_partition(&self, key: &PartitionKey) {
        let snapshot = self.snapshot();
        let Some(partition) = snapshot.partitions.get(key) else {
            return;
        };

        let config = self.config.read().clone();
        let version = snapshot.version;

        // Record the attempt even when no table results, so undersized
        // partitions are not re-enqueued on every tick.
        if let Some(bar) = partition.latest_bar_time() {
            self.last_recompute_bar.lock().insert(key.clone(), bar);
        }

        match learner::build_table(partition, &snapshot.registry, &config, version) {
            Some(table) => {
                self.publish_table(key.clone(), Arc::new(table));
                self.recompute_count.fetch_add(1, Ordering::Relaxed);
                debug!(partition = %key, "graduation table republished");
            }
            None => {
                debug!(partition = %key, "partition below graduation threshold — no table");
            }
        }
    }

    /// Copy-on-write insert of one table into a fresh snapshot.
    fn publish_table(&self, key: PartitionKey, table: Arc<GraduationTable>) {
        let mut guard = self.snapshot.write();
        let mut next = (**guard).clone();
        next.tables.insert(key, table);
        *guard = Arc::new(next);
    }

    // -------------------------------------------------------------------------
    // Dataset assembly
    // -------------------------------------------------------------------------

    /// Build and publish a snapshot from raw store rows.
    ///
    /// Deduplicates by `entrySignalId` (first occurrence wins, so feeding
    /// the same outcome twice changes nothing). When `compute_all_tables`
    /// is false, existing tables are carried forward and brand-new keys
    /// with enough data are enqueued for recompute instead — reload stays
    /// cheap and recompute stays on the bar-time cadence.
    pub fn apply_dataset(
        &self,
        outcomes: Vec<TradeOutcome>,
        compute_all_tables: bool,
    ) -> Arc<MemorySnapshot> {
        let config = self.config.read().clone();
        let prev = self.snapshot();

        // Dedup by entry-signal id.
        let mut seen = HashSet::with_capacity(outcomes.len());
        let mut unique = Vec::with_capacity(outcomes.len());
        let mut untagged = 0usize;
        for outcome in outcomes {
            if !seen.insert(outcome.entry_signal_id.clone()) {
                continue;
            }
            if outcome.data_type.is_none() {
                untagged += 1;
            }
            unique.push(outcome);
        }

        // One registry per snapshot: every feature name observed anywhere.
        let registry = Arc::new(FeatureRegistry::from_names(
            unique
                .iter()
                .flat_map(|o| o.features.keys().cloned())
                .collect::<Vec<_>>(),
        ));

        // Group by partition key.
        let mut grouped: HashMap<PartitionKey, Vec<TradeOutcome>> = HashMap::new();
        for outcome in unique {
            let key = PartitionKey::new(&outcome.instrument, outcome.direction);
            grouped.entry(key).or_default().push(outcome);
        }

        let mut partitions = HashMap::with_capacity(grouped.len());
        let mut total = 0usize;
        for (key, group) in grouped {
            total += group.len();
            let partition = Arc::new(Partition::build(key.clone(), group, &registry));
            partitions.insert(key, partition);
        }

        let version = prev.version + 1;

        // Tables: full compute at startup, carry-forward on reload.
        let mut tables = HashMap::new();
        let mut new_keys = Vec::new();
        for (key, partition) in &partitions {
            if compute_all_tables {
                if let Some(table) =
                    learner::build_table(partition, &registry, &config, version)
                {
                    if let Some(bar) = partition.latest_bar_time() {
                        self.last_recompute_bar.lock().insert(key.clone(), bar);
                    }
                    tables.insert(key.clone(), Arc::new(table));
                }
            } else if let Some(existing) = prev.tables.get(key) {
                tables.insert(key.clone(), existing.clone());
            } else if partition.len() >= config.min_partition_vectors {
                new_keys.push(key.clone());
            }
        }

        let snapshot = Arc::new(MemorySnapshot {
            version,
            loaded_at: Utc::now(),
            registry,
            partitions,
            tables,
            total_vectors: total,
            untagged_vectors: untagged,
        });

        *self.snapshot.write() = snapshot.clone();

        for key in new_keys {
            let _ = self.recompute_tx.send(key);
        }

        snapshot
    }
}

// =============================================================================
// Background loops
// =============================================================================

/// Reload poll loop. Spawn once at startup:
///
///   tokio::spawn(run_reload_loop(Arc::clone(&memory)));
pub async fn run_reload_loop(manager: Arc<MemoryManager>) {
    let poll_secs = manager.config.read().reload_poll_secs;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(poll_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        manager.on_background_tick().await;
    }
}

/// Recompute worker: drains the queue one partition at a time so that a
/// heavy recompute never blocks request handling (evaluators only read
/// published snapshots).
pub async fn run_recompute_worker(
    manager: Arc<MemoryManager>,
    mut rx: mpsc::UnboundedReceiver<PartitionKey>,
) {
    while let Some(key) = rx.recv().await {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.recompute_partition(&key);
        }));
        if result.is_err() {
            error!(partition = %key, "graduation recompute panicked — partition skipped");
        }
    }
}
