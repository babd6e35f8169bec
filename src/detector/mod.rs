pub mod engine;
pub mod patterns;
pub mod sources;

pub use engine::{DetectionEvent, Detector, DetectorStats, SourceKind};
pub use patterns::{builtin_patterns, DetectionPattern, PatternRegistry, PatternSpec};
