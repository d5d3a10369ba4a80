//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it changes:
//!
//! ```json
//! { "training": { "epochs": 20 }, "inference": { "grid_cells": 4 } }
//! ```
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Project name recorded with saved heads and analysis results.
    pub project: String,
    /// Side length of the square tensors fed to the extractor.
    pub input_size: u32,
    pub training: TrainingConfig,
    pub inference: InferenceConfig,
    pub extractor: ExtractorConfig,
    pub render: RenderConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub hidden_units: usize,
    pub dropout: f32,
    /// Randomly flip captured samples horizontally.
    pub augment: bool,
    pub min_classes: usize,
    pub min_samples_per_class: usize,
    /// Fixes weight initialization, shuffling and dropout masks.
    pub seed: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub top_k: usize,
    pub count_by_grid: bool,
    /// Tiles per side of the counting grid.
    pub grid_cells: u32,
    /// Minimum top-1 probability for a tile to be counted.
    pub grid_threshold: f32,
}

/// Memory layout the extractor network expects.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Nchw,
    Nhwc,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub path: PathBuf,
    /// Fetched into `path` when the file does not exist yet.
    pub url: Option<String>,
    pub layout: Layout,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Node names tried in order as the embedding output.
    pub embedding_taps: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RenderConfig {
    /// TrueType font for tile labels. Boxes are drawn without labels when unset.
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub box_color: [u8; 3],
    pub fill_alpha: f32,
    pub label_fg: [u8; 3],
    /// JPEG quality of the preview kept in the history.
    pub preview_quality: u8,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for saved heads and the history. Defaults to the user data directory.
    pub dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: "MyProject".into(),
            input_size: 224,
            training: TrainingConfig::default(),
            inference: InferenceConfig::default(),
            extractor: ExtractorConfig::default(),
            render: RenderConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 8,
            batch_size: 16,
            learning_rate: 1e-3,
            hidden_units: 256,
            dropout: 0.2,
            augment: true,
            min_classes: 2,
            min_samples_per_class: 1,
            seed: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            count_by_grid: true,
            grid_cells: 6,
            grid_threshold: 0.6,
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("model.onnx"),
            url: None,
            layout: Layout::Nchw,
            // Mean/std of the ImageNet training set
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            embedding_taps: vec!["reshape_1".into(), "global_average_pooling2d_1".into()],
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            font_size: 14.0,
            box_color: [132, 182, 255],
            fill_alpha: 0.15,
            label_fg: [11, 15, 20],
            preview_quality: 60,
        }
    }
}

impl Config {
    /// Read a JSON configuration file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::mismatch(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        let i = &self.inference;
        let checks = [
            (self.input_size > 0, "input_size must be positive"),
            (t.epochs > 0, "training.epochs must be positive"),
            (t.batch_size > 0, "training.batch_size must be positive"),
            (t.hidden_units > 0, "training.hidden_units must be positive"),
            (
                t.learning_rate > 0.0 && t.learning_rate.is_finite(),
                "training.learning_rate must be a positive number",
            ),
            (
                (0.0..1.0).contains(&t.dropout),
                "training.dropout must be in [0, 1)",
            ),
            (t.min_classes > 0, "training.min_classes must be positive"),
            (i.grid_cells > 0, "inference.grid_cells must be positive"),
            (
                (0.0..=1.0).contains(&i.grid_threshold),
                "inference.grid_threshold must be in [0, 1]",
            ),
            (
                self.extractor.std.iter().all(|s| *s > 0.0),
                "extractor.std must be positive",
            ),
            (
                (1..=100).contains(&self.render.preview_quality),
                "render.preview_quality must be in [1, 100]",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(Error::mismatch(*reason)),
            None => Ok(()),
        }
    }

    /// Directory for saved heads and history.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("teach_classify")
        })
    }
}
