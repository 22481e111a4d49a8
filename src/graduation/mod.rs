pub mod learner;
pub mod stats;

pub use learner::{FeatureSignal, GraduatedFeature, GraduationTable, ValueRange};
