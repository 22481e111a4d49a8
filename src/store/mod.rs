pub mod client;
pub mod predictor;

pub use client::{StoreStats, VectorFilters, VectorStoreClient};
pub use predictor::{Prediction, PredictorClient};
