//! Common records shared between `teach_classify` and its consumers.
pub mod records;

pub use records::{
    AnalysisResult, ClassCounts, PredictionEntry, ProjectMeta, TileDetection,
};

/// Error type.
pub type Error = Box<dyn std::error::Error>;
