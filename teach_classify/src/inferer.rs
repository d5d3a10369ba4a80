//! Whole-image top-k classification and grid-based tile counting.
use common::{ClassCounts, PredictionEntry, TileDetection};
use image::RgbImage;
use itertools::{iproduct, Itertools};
use ndarray::ArrayView1;

use crate::{
    codec,
    extractor::Embedder,
    head::argmax,
    tensor::flatten,
    trainer::TrainedModel,
    Error, ImageTensor, Matrix, Result,
};

/// Tally of accepted tiles plus the tiles themselves, in row-major grid order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GridCount {
    pub counts: ClassCounts,
    pub detections: Vec<TileDetection>,
}

/// Runs images through the frozen extractor and a trained head.
pub struct Inferer<'a> {
    embedder: &'a dyn Embedder,
    model: &'a TrainedModel,
    input_size: u32,
}

impl<'a> Inferer<'a> {
    pub fn new(embedder: &'a dyn Embedder, model: &'a TrainedModel, input_size: u32) -> Self {
        Self {
            embedder,
            model,
            input_size,
        }
    }

    /// The `k` most probable classes of the whole image.
    ///
    /// `k` is clamped to `[1, C]`. Entries are sorted by descending probability, ties by
    /// ascending class index.
    pub fn classify(&self, image: &RgbImage, k: usize) -> Result<Vec<PredictionEntry>> {
        check_image(image)?;
        let probabilities = self.predict(codec::encode(image, self.input_size))?;

        let entries = top_k(probabilities.row(0), k)
            .into_iter()
            .map(|(index, p)| PredictionEntry::new(self.model.label(index), p))
            .collect();

        Ok(entries)
    }

    /// Classify each of the `cells × cells` tiles independently and count the tiles whose top
    /// class scores at least `threshold`.
    ///
    /// Tiles are `W / cells` by `H / cells` pixels; remainder pixels on the right and bottom
    /// edges are not covered.
    pub fn count_by_grid(&self, image: &RgbImage, cells: u32, threshold: f32) -> Result<GridCount> {
        if cells == 0 {
            return Err(Error::mismatch("grid needs at least one cell per side"));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::mismatch(format!(
                "grid threshold {threshold} is outside [0, 1]"
            )));
        }
        check_image(image)?;

        let (width, height) = image.dimensions();
        let (cell_w, cell_h) = (width / cells, height / cells);
        if cell_w == 0 || cell_h == 0 {
            log::warn!("{width}x{height} image is smaller than a {cells}x{cells} grid");
        }

        let mut detections = Vec::new();
        for (row, col) in iproduct!(0..cells, 0..cells) {
            let (x, y) = (col * cell_w, row * cell_h);
            let tile = codec::crop_then_encode(image, x, y, cell_w, cell_h, self.input_size);
            let probabilities = self.predict(tile)?;
            let (index, score) = argmax(probabilities.row(0));
            let class_name = self.model.label(index);

            log::debug!(
                "tile ({row}, {col}) at {x},{y}: {class_name} {:.1}%",
                score * 100.0
            );

            if score >= threshold {
                detections.push(TileDetection {
                    bbox: [y, x, y + cell_h, x + cell_w],
                    class_name,
                    score,
                });
            }
        }

        let counts = detections
            .iter()
            .fold(ClassCounts::new(), |mut counts, detection| {
                *counts.entry(detection.class_name.clone()).or_insert(0) += 1;
                counts
            });

        Ok(GridCount { counts, detections })
    }

    /// encode → embed → flatten → predict. Every intermediate is dropped before returning.
    fn predict(&self, tensor: ImageTensor) -> Result<Matrix> {
        let flat = {
            let raw = self.embedder.embed(&tensor)?;
            flatten(&raw)
        };
        drop(tensor);

        self.model.head().predict(&flat)
    }
}

/// Indices and values of the `k` largest entries, `k` clamped to `[1, len]`.
pub fn top_k(probabilities: ArrayView1<f32>, k: usize) -> Vec<(usize, f32)> {
    let k = k.clamp(1, probabilities.len().max(1));

    probabilities
        .iter()
        .copied()
        .enumerate()
        .sorted_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)))
        .take(k)
        .collect()
}

fn check_image(image: &RgbImage) -> Result<()> {
    match image.width() == 0 || image.height() == 0 {
        true => Err(Error::mismatch("cannot analyze an empty image")),
        false => Ok(()),
    }
}
