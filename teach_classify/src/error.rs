//! Error kinds reported by the engine.
//!
use std::path::PathBuf;

use crate::{engine::Operation, trainer::ReadinessReport};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The feature extractor artifact could not be loaded; nothing can run until a retry succeeds.
    #[error("failed to load feature extractor from {}: {reason}", .path.display())]
    ExtractorLoad { path: PathBuf, reason: String },

    #[error("feature extractor not loaded")]
    ExtractorNotReady,

    #[error("To train: {0}")]
    Readiness(ReadinessReport),

    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    #[error("persistence failure for '{handle}': {reason}")]
    Persistence { handle: String, reason: String },

    #[error("no trained classifier")]
    NotTrained,

    #[error("engine busy: {0} in progress")]
    Busy(Operation),

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn persistence(handle: &str, reason: impl ToString) -> Self {
        Self::Persistence {
            handle: handle.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        Self::ConfigurationMismatch(reason.into())
    }
}
