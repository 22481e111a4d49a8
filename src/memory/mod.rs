pub mod features;
pub mod manager;
pub mod partition;

// Re-export the high-traffic types (e.g. `use crate::memory::PartitionKey`).
pub use features::FeatureRegistry;
pub use manager::{MemoryManager, MemorySnapshot};
pub use partition::{normalize_instrument, Partition, PartitionKey, VectorRecord};
