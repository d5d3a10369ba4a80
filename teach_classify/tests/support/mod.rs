//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;

use image::{Rgb, RgbImage};
use ndarray::{arr1, arr2, Array1, Array2};
use teach_classify::{
    config::TrainingConfig,
    extractor::ChannelStats,
    head::{ClassifierHead, HeadParams},
    persistence::{FileModelStore, ModelStore},
    trainer::TrainedModel,
    Config, Engine, Result,
};

/// Small tensors and a short, seeded training schedule.
pub fn config() -> Config {
    Config {
        input_size: 8,
        training: TrainingConfig {
            epochs: 40,
            batch_size: 4,
            learning_rate: 0.05,
            hidden_units: 16,
            seed: Some(7),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn solid(value: u8) -> RgbImage {
    RgbImage::from_pixel(16, 16, Rgb([value, value, value]))
}

/// Engine with a channel-mean embedder and the given classes, each fed `per_class` samples of
/// a distinct grey level.
pub fn taught_engine(classes: &[(&str, u8)], per_class: u8) -> Result<Engine> {
    let engine = Engine::with_embedder(config(), ChannelStats)?;
    for (name, level) in classes {
        engine.add_class(name)?;
        for i in 0..per_class {
            engine.add_sample(name, &solid(level.saturating_add(i)))?;
        }
    }
    Ok(engine)
}

/// Hand-set head over channel means: dark images are `labels[0]`, bright ones `labels[1]`,
/// both with near-certainty.
pub fn brightness_model(labels: [&str; 2]) -> TrainedModel {
    let params = HeadParams {
        w1: arr2(&[[1.0], [1.0], [1.0]]),
        b1: Array1::zeros(1),
        w2: arr2(&[[-4.0, 4.0]]),
        b2: arr1(&[6.0, -6.0]),
        dropout: 0.0,
    };
    let head = ClassifierHead::from_params(params).unwrap();
    TrainedModel::new(labels.iter().map(|l| l.to_string()).collect(), head).unwrap()
}

/// Hand-set head giving every class the same probability.
pub fn undecided_model(labels: &[&str]) -> TrainedModel {
    let params = HeadParams {
        w1: Array2::zeros((3, 2)),
        b1: Array1::zeros(2),
        w2: Array2::zeros((2, labels.len())),
        b2: Array1::zeros(labels.len()),
        dropout: 0.0,
    };
    let head = ClassifierHead::from_params(params).unwrap();
    TrainedModel::new(labels.iter().map(|l| l.to_string()).collect(), head).unwrap()
}

/// Engine running `model`, installed through a file store in `dir`.
pub fn engine_running(model: &TrainedModel, dir: &Path) -> Result<Engine> {
    let store = FileModelStore::new(dir);
    store.save("fixture", "fixture", model)?;

    let engine = Engine::with_embedder(config(), ChannelStats)?;
    engine.load_model(&store, "fixture")?;
    Ok(engine)
}
