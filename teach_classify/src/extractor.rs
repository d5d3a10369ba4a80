//! Frozen feature extractor.
//!
//! A pretrained ONNX network is loaded once with tract and turned into an [`Embedder`]. If the
//! network exposes one of the configured embedding taps (a pooling or reshape node in front of
//! the classification layer), its output becomes the embedding. Otherwise the network's own
//! output is used.
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, Axis, IxDyn};
use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::{
    config::{ExtractorConfig, Layout},
    tensor::Tracked,
    Error, ImageTensor, RawEmbeddings, Result,
};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
type Shape = SmallVec<[usize; 4]>;

/// Maps a batch of image tensors `[N, H, W, 3]` to embeddings `[N, …]`.
pub trait Embedder: Send + Sync {
    fn embed(&self, batch: &ImageTensor) -> Result<RawEmbeddings>;

    /// Human readable description of the embedding source.
    fn describe(&self) -> String;
}

/// A network exposing named internal outputs plus a default output.
pub trait NamedOutputs {
    fn has_output(&self, name: &str) -> bool;
}

/// Where the embedding is taken from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Tap {
    Named(String),
    DefaultOutput,
}

/// Pick the first candidate the network knows, falling back to its default output.
pub fn select_tap(network: &impl NamedOutputs, candidates: &[String]) -> Tap {
    candidates
        .iter()
        .find(|name| network.has_output(name))
        .map(|name| Tap::Named(name.clone()))
        .unwrap_or(Tap::DefaultOutput)
}

impl NamedOutputs for InferenceModel {
    fn has_output(&self, name: &str) -> bool {
        self.node_by_name(name).is_ok()
    }
}

/// ONNX network run with tract.
pub struct OnnxExtractor {
    model: NnModel,
    tap: Tap,
    size: usize,
    layout: Layout,
    mean: [f32; 3],
    std: [f32; 3],
}

impl OnnxExtractor {
    /// Load, truncate and optimize the network for square inputs of side `size`.
    pub fn load(config: &ExtractorConfig, size: u32) -> Result<Self> {
        let path = config.path.as_path();
        let (model, tap) =
            load_model(path, config, size as usize).map_err(|e| Error::ExtractorLoad {
                path: PathBuf::from(path),
                reason: format!("{e:#}"),
            })?;

        log::info!("Feature extractor {} ready ({:?})", path.display(), tap);

        Ok(Self {
            model,
            tap,
            size: size as usize,
            layout: config.layout,
            mean: config.mean,
            std: config.std,
        })
    }

    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    /// Normalize one image of the batch into the network's input layout.
    fn preproc(&self, batch: &ImageTensor, index: usize) -> Tensor {
        let image = batch.index_axis(Axis(0), index);
        let (mean, std) = (self.mean, self.std);
        let normalize = move |v: f32, c: usize| (v / 255.0 - mean[c]) / std[c];

        match self.layout {
            Layout::Nchw => tract_ndarray::Array4::from_shape_fn(
                (1, 3, self.size, self.size),
                |(_, c, y, x)| normalize(image[[y, x, c]], c),
            )
            .into(),
            Layout::Nhwc => tract_ndarray::Array4::from_shape_fn(
                (1, self.size, self.size, 3),
                |(_, y, x, c)| normalize(image[[y, x, c]], c),
            )
            .into(),
        }
    }

    /// Run one normalized image and return the output shape and values.
    fn run(&self, input: Tensor) -> Result<(Shape, Vec<f32>)> {
        let raw_nn_out = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| Error::Inference(format!("{e:#}")))?;
        let output = raw_nn_out
            .first()
            .ok_or_else(|| Error::Inference("network produced no output".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| Error::Inference(format!("{e:#}")))?;

        Ok((view.shape().iter().copied().collect(), view.iter().cloned().collect()))
    }
}

impl Embedder for OnnxExtractor {
    fn embed(&self, batch: &ImageTensor) -> Result<RawEmbeddings> {
        let (n, h, w, _) = batch.dim();
        if h != self.size || w != self.size {
            return Err(Error::mismatch(format!(
                "extractor expects {0}x{0} inputs, got {h}x{w}",
                self.size
            )));
        }

        let mut item_shape = Shape::new();
        let mut data = Vec::new();
        for index in 0..n {
            let (shape, values) = self.run(self.preproc(batch, index))?;
            // Per-image outputs carry a batch axis of one
            item_shape = shape.into_iter().skip(1).collect();
            data.extend(values);
        }

        let mut shape = Shape::from_slice(&[n]);
        shape.extend(item_shape);
        let embeddings = ArrayD::from_shape_vec(IxDyn(&shape), data)
            .map_err(|e| Error::Inference(format!("unexpected embedding shape: {e}")))?;

        Ok(Tracked::new(embeddings))
    }

    fn describe(&self) -> String {
        match &self.tap {
            Tap::Named(name) => format!("onnx tap '{name}'"),
            Tap::DefaultOutput => "onnx default output".into(),
        }
    }
}

/// Network-free embedder: each image becomes its per-channel mean on a 0–1 scale, shaped
/// `[N, 1, 1, 3]` like a pooled feature map. Handy for smoke runs without an ONNX artifact.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStats;

impl Embedder for ChannelStats {
    fn embed(&self, batch: &ImageTensor) -> Result<RawEmbeddings> {
        let (n, h, w, c) = batch.dim();
        if h == 0 || w == 0 {
            return Err(Error::mismatch("cannot embed an empty image"));
        }

        let pixels = (h * w) as f32;
        let embeddings = ArrayD::from_shape_fn(IxDyn(&[n, 1, 1, c]), |index| {
            let image = batch.index_axis(Axis(0), index[0]);
            let channel = image.index_axis(Axis(2), index[3]);
            channel.sum() / pixels / 255.0
        });

        Ok(Tracked::new(embeddings))
    }

    fn describe(&self) -> String {
        "channel means".into()
    }
}

fn load_model(path: &Path, config: &ExtractorConfig, size: usize) -> TractResult<(NnModel, Tap)> {
    let mut model = tract_onnx::onnx().model_for_path(path)?;

    let tap = select_tap(&model, &config.embedding_taps);
    if let Tap::Named(name) = &tap {
        model.set_output_names([name.as_str()])?;
    }

    let shape = match config.layout {
        Layout::Nchw => tvec!(1, 3, size, size),
        Layout::Nhwc => tvec!(1, size, size, 3),
    };
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), shape);
    let model = model
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok((model, tap))
}
