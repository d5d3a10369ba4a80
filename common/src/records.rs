//! Records exchanged between the engine, its stores and its front ends.
//!
use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// One ranked class of a top-k prediction.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PredictionEntry {
    pub class_name: String,
    pub probability: f32,
}

impl PredictionEntry {
    pub fn new(class_name: impl Into<String>, probability: f32) -> Self {
        Self {
            class_name: class_name.into(),
            probability,
        }
    }
}

/// A grid tile whose dominant class scored at or above the confidence threshold.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TileDetection {
    /// `[ymin, xmin, ymax, xmax]` in pixels of the analyzed image.
    pub bbox: [u32; 4],
    pub class_name: String,
    pub score: f32,
}

/// Estimated number of objects per class name.
pub type ClassCounts = BTreeMap<String, usize>;

/// Project name and ordered class labels stored next to a trained head.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProjectMeta {
    pub project: String,
    pub classes: Vec<String>,
}

/// Outcome of analyzing one image, as kept in the history.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub timestamp: DateTime<Utc>,
    pub project: String,
    /// Where the image came from, e.g. `photo:cats.jpg` or `camera`.
    pub source: String,
    pub topk: Vec<PredictionEntry>,
    /// `None` when grid counting was disabled for this analysis.
    pub counts: Option<ClassCounts>,
    /// Lossy preview as a `data:` URL.
    pub preview_data_url: String,
}

impl AnalysisResult {
    /// The most probable class, if any prediction was made.
    pub fn best(&self) -> Option<&PredictionEntry> {
        self.topk.first()
    }

    /// Total number of accepted tiles over all classes.
    pub fn total_count(&self) -> usize {
        self.counts
            .as_ref()
            .map(|counts| counts.values().sum())
            .unwrap_or(0)
    }
}

/// One-line summary: `apple 81% · pear 12% | apple:3 · pear:1`.
impl fmt::Display for AnalysisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let top = self
            .topk
            .iter()
            .map(|p| format!("{} {:.0}%", p.class_name, p.probability * 100.0))
            .join(" · ");
        write!(f, "{top}")?;

        if let Some(counts) = self.counts.as_ref().filter(|c| !c.is_empty()) {
            let counts = counts
                .iter()
                .map(|(name, count)| format!("{name}:{count}"))
                .join(" · ");
            write!(f, " | {counts}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    fn result(counts: Option<ClassCounts>) -> AnalysisResult {
        AnalysisResult {
            timestamp: Utc::now(),
            project: "fruit".into(),
            source: "photo:bowl.jpg".into(),
            topk: vec![
                PredictionEntry::new("apple", 0.814),
                PredictionEntry::new("pear", 0.121),
            ],
            counts,
            preview_data_url: "data:image/jpeg;base64,".into(),
        }
    }

    #[test]
    fn summary_lists_predictions_and_counts() {
        let counts = ClassCounts::from([("apple".to_owned(), 3), ("pear".to_owned(), 1)]);
        let result = result(Some(counts));

        assert_eq!(result.to_string(), "apple 81% · pear 12% | apple:3 · pear:1");
        assert_eq!(result.total_count(), 4);
        assert_eq!(result.best().map(|p| p.class_name.as_str()), Some("apple"));
    }

    #[test]
    fn summary_omits_empty_counts() {
        assert_eq!(
            result(Some(ClassCounts::new())).to_string(),
            "apple 81% · pear 12%"
        );
        assert_eq!(result(None).to_string(), "apple 81% · pear 12%");
        assert_eq!(result(None).total_count(), 0);
    }

    #[test]
    fn missing_counts_stay_absent_in_json() -> Result<(), Error> {
        let serialized = serde_json::to_string(&result(None))?;
        let deserialized: AnalysisResult = serde_json::from_str(&serialized)?;

        assert_eq!(deserialized.counts, None);
        assert_eq!(deserialized.topk.len(), 2);

        Ok(())
    }
}
