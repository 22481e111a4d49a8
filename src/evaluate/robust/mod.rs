pub mod adjustment;
pub mod evaluator;
pub mod exploration;
pub mod stability;
pub mod zone;

pub use evaluator::{RobustEvaluation, RobustZoneEvaluator, ZoneKey};
pub use zone::RobustZone;
