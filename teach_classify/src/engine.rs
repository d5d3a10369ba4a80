//! The engine ties the sample store, the frozen extractor and the current head together.
//!
//! It owns exactly one extractor (loaded once, retried until it succeeds) and at most one
//! trained head, replaced wholesale after every successful training run or load. Training and
//! inference are mutually exclusive: a call made while another one runs fails with
//! [`Error::Busy`] instead of waiting.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use common::{AnalysisResult, PredictionEntry};
use image::RgbImage;
use rand::{rngs::StdRng, SeedableRng};
use rusttype::Font;

use crate::{
    aggregate, codec,
    config::Config,
    extractor::{Embedder, OnnxExtractor},
    inferer::{GridCount, Inferer},
    persistence::ModelStore,
    project::Project,
    render,
    trainer::{ReadinessReport, TrainedModel, Trainer, TrainingReport, TrainingState},
    Error, Result,
};

/// Long-running operations guarded by the busy flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Training,
    Classification,
    GridCounting,
    Analysis,
    Loading,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Training => "training",
            Operation::Classification => "classification",
            Operation::GridCounting => "grid counting",
            Operation::Analysis => "analysis",
            Operation::Loading => "model loading",
        };
        f.write_str(name)
    }
}

/// Which operation, if any, is running.
#[derive(Debug, Default)]
struct BusyFlag(Mutex<Option<Operation>>);

impl BusyFlag {
    fn acquire(&self, operation: Operation) -> Result<BusyGuard<'_>> {
        let mut running = lock(&self.0);
        if let Some(other) = *running {
            return Err(Error::Busy(other));
        }
        *running = Some(operation);

        Ok(BusyGuard(self))
    }
}

/// Clears the busy flag when dropped, on success and error paths alike.
struct BusyGuard<'a>(&'a BusyFlag);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0 .0) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub struct Engine {
    config: Config,
    embedder: OnceLock<Box<dyn Embedder>>,
    project: Mutex<Project>,
    model: Mutex<Option<Arc<TrainedModel>>>,
    state: Mutex<TrainingState>,
    busy: BusyFlag,
    /// Drives sample augmentation.
    rng: Mutex<StdRng>,
    font: Option<Font<'static>>,
}

impl Engine {
    /// Create an engine without an extractor. Call [`Engine::load_extractor`] before training.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let font = match &config.render.font_path {
            Some(path) => match render::load_font(path) {
                Ok(font) => Some(font),
                Err(e) => {
                    log::warn!("Tile labels disabled, font unavailable: {e}");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            project: Mutex::new(Project::new(config.project.clone())),
            rng: Mutex::new(rng_for(config.training.seed)),
            embedder: OnceLock::new(),
            model: Mutex::new(None),
            state: Mutex::new(TrainingState::Idle),
            busy: BusyFlag::default(),
            font,
            config,
        })
    }

    /// Create an engine around an already constructed embedder.
    pub fn with_embedder(config: Config, embedder: impl Embedder + 'static) -> Result<Self> {
        let engine = Self::new(config)?;
        if engine.embedder.set(Box::new(embedder)).is_err() {
            log::debug!("Embedder already installed");
        }

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load the ONNX extractor named in the configuration unless one is already loaded.
    ///
    /// A failure leaves the engine not ready; calling again retries.
    pub fn load_extractor(&self) -> Result<()> {
        if self.embedder.get().is_some() {
            return Ok(());
        }

        let extractor = OnnxExtractor::load(&self.config.extractor, self.config.input_size)?;
        if self.embedder.set(Box::new(extractor)).is_err() {
            log::debug!("Extractor was loaded concurrently, keeping the first one");
        }

        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.embedder.get().is_some()
    }

    pub fn state(&self) -> TrainingState {
        *lock(&self.state)
    }

    pub fn is_trained(&self) -> bool {
        lock(&self.model).is_some()
    }

    /// The installed head, shared with any inference currently using it.
    pub fn model(&self) -> Option<Arc<TrainedModel>> {
        lock(&self.model).clone()
    }

    pub fn project_name(&self) -> String {
        lock(&self.project).name().to_owned()
    }

    pub fn set_project_name(&self, name: &str) {
        lock(&self.project).set_name(name);
    }

    /// Add a class, returning its label index. Existing classes are kept as they are.
    pub fn add_class(&self, name: &str) -> Result<usize> {
        lock(&self.project)
            .add_class(name)
            .ok_or_else(|| Error::mismatch("class names must not be blank"))
    }

    pub fn class_names(&self) -> Vec<String> {
        lock(&self.project).class_names()
    }

    pub fn sample_count(&self, class: &str) -> usize {
        lock(&self.project).sample_count(class)
    }

    /// Encode `image` as a training sample of `class`, augmented when configured.
    ///
    /// Returns the class's new sample count.
    pub fn add_sample(&self, class: &str, image: &RgbImage) -> Result<usize> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::mismatch("cannot use an empty image as a sample"));
        }
        if lock(&self.project).class_index(class).is_none() {
            return Err(Error::UnknownClass(class.to_owned()));
        }

        let size = self.config.input_size;
        let sample = match self.config.training.augment {
            true => codec::encode_augmented(image, size, &mut *lock(&self.rng)),
            false => codec::encode(image, size),
        };

        lock(&self.project).push_sample(class, sample)
    }

    /// Release the samples of one class.
    pub fn clear_class(&self, class: &str) -> Result<()> {
        lock(&self.project).clear_samples(class)
    }

    /// Drop every class, sample and the installed head.
    pub fn reset(&self) {
        lock(&self.project).clear_classes();
        *lock(&self.model) = None;
        self.set_state(TrainingState::Idle);
        log::info!("Project reset");
    }

    /// Check whether training could start now.
    pub fn readiness(&self) -> Result<(), ReadinessReport> {
        let project = lock(&self.project);
        self.trainer().check_readiness(&project)
    }

    /// Train a fresh head on every stored sample and install it.
    ///
    /// On failure the previously installed head, if any, stays in place.
    pub fn train(&self) -> Result<TrainingReport> {
        let _busy = self.busy.acquire(Operation::Training)?;
        let project = lock(&self.project);
        let mut rng = rng_for(self.config.training.seed);

        let outcome = self
            .trainer()
            .train(&project, &mut rng, |state| self.set_state(state));

        match outcome {
            Ok((model, report)) => {
                log::info!(
                    "Trained on {} samples of {} classes",
                    report.samples,
                    model.labels().len()
                );
                *lock(&self.model) = Some(Arc::new(model));
                self.set_state(TrainingState::Ready);
                Ok(report)
            }
            Err(e) => {
                log::warn!("Training failed: {e}");
                self.settle_state();
                Err(e)
            }
        }
    }

    /// Top-k classes of the whole image.
    pub fn classify(&self, image: &RgbImage, k: usize) -> Result<Vec<PredictionEntry>> {
        self.infer(Operation::Classification, |inferer| inferer.classify(image, k))
    }

    /// Grid counting with the configured cell count and threshold.
    pub fn count_by_grid(&self, image: &RgbImage) -> Result<GridCount> {
        let inference = &self.config.inference;
        self.count_by_grid_with(image, inference.grid_cells, inference.grid_threshold)
    }

    pub fn count_by_grid_with(
        &self,
        image: &RgbImage,
        cells: u32,
        threshold: f32,
    ) -> Result<GridCount> {
        self.infer(Operation::GridCounting, |inferer| {
            inferer.count_by_grid(image, cells, threshold)
        })
    }

    /// Classify and, when enabled, grid-count `image`.
    ///
    /// Returns the composed record and a copy of the image with the accepted tiles drawn on it.
    pub fn analyze(&self, image: &RgbImage, source: &str) -> Result<(AnalysisResult, RgbImage)> {
        let inference = &self.config.inference;

        let (topk, grid) = self.infer(Operation::Analysis, |inferer| {
            let topk = inferer.classify(image, inference.top_k)?;
            let grid = match inference.count_by_grid {
                true => Some(inferer.count_by_grid(
                    image,
                    inference.grid_cells,
                    inference.grid_threshold,
                )?),
                false => None,
            };
            Ok((topk, grid))
        })?;

        let mut annotated = image.clone();
        let counts = grid.map(|grid| {
            render::annotate(
                &mut annotated,
                &grid.detections,
                &self.config.render,
                self.font.as_ref(),
            );
            grid.counts
        });

        let result = aggregate::compose(
            &self.project_name(),
            source,
            topk,
            counts,
            &annotated,
            self.config.render.preview_quality,
        )?;
        log::info!("Analyzed {source}: {result}");

        Ok((result, annotated))
    }

    /// Save the installed head and the project's labels under `handle`.
    pub fn save_model(&self, store: &dyn ModelStore, handle: &str) -> Result<()> {
        let model = self.model().ok_or(Error::NotTrained)?;
        store.save(handle, &self.project_name(), &model)
    }

    /// Install a saved head. Its labels replace the project's classes and samples.
    ///
    /// Nothing changes in memory if loading fails.
    pub fn load_model(&self, store: &dyn ModelStore, handle: &str) -> Result<()> {
        let _busy = self.busy.acquire(Operation::Loading)?;
        let (project_name, model) = store.load(handle)?;

        {
            let mut project = lock(&self.project);
            project.clear_classes();
            project.set_name(&project_name);
            for label in model.labels() {
                project.add_class(label);
            }
        }
        *lock(&self.model) = Some(Arc::new(model));
        self.set_state(TrainingState::Ready);

        Ok(())
    }

    pub fn delete_model(&self, store: &dyn ModelStore, handle: &str) -> Result<()> {
        store.delete(handle)
    }

    fn trainer(&self) -> Trainer<'_> {
        let embedder = self.embedder.get().map(|embedder| embedder.as_ref());
        Trainer::new(embedder, &self.config.training)
    }

    fn infer<T>(&self, operation: Operation, run: impl FnOnce(&Inferer) -> Result<T>) -> Result<T> {
        let _busy = self.busy.acquire(operation)?;
        let embedder = self.embedder.get().ok_or(Error::ExtractorNotReady)?;
        let model = self.model().ok_or(Error::NotTrained)?;

        run(&Inferer::new(
            embedder.as_ref(),
            &model,
            self.config.input_size,
        ))
    }

    fn set_state(&self, state: TrainingState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::info!("Training state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Back to `Ready` if a head is installed, `Idle` otherwise.
    fn settle_state(&self) {
        match self.is_trained() {
            true => self.set_state(TrainingState::Ready),
            false => self.set_state(TrainingState::Idle),
        }
    }
}

#[cfg(test)]
mod test {
    use image::Rgb;

    use super::*;
    use crate::{config::TrainingConfig, extractor::ChannelStats};

    fn config() -> Config {
        Config {
            input_size: 8,
            training: TrainingConfig {
                epochs: 3,
                batch_size: 4,
                hidden_units: 8,
                seed: Some(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn solid(value: u8) -> RgbImage {
        RgbImage::from_pixel(12, 12, Rgb([value, value, value]))
    }

    #[test]
    fn busy_flag_rejects_second_operation() -> Result<()> {
        let flag = BusyFlag::default();

        let guard = flag.acquire(Operation::Training)?;
        assert!(matches!(
            flag.acquire(Operation::Classification),
            Err(Error::Busy(Operation::Training))
        ));
        drop(guard);

        flag.acquire(Operation::Classification)?;
        Ok(())
    }

    #[test]
    fn busy_error_names_the_running_operation() {
        let message = Error::Busy(Operation::GridCounting).to_string();
        assert_eq!(message, "engine busy: grid counting in progress");
    }

    #[test]
    fn inference_needs_extractor_and_head() -> Result<()> {
        let bare = Engine::new(config())?;
        assert!(matches!(
            bare.classify(&solid(0), 1),
            Err(Error::ExtractorNotReady)
        ));

        let engine = Engine::with_embedder(config(), ChannelStats)?;
        assert!(matches!(
            engine.classify(&solid(0), 1),
            Err(Error::NotTrained)
        ));
        Ok(())
    }

    #[test]
    fn training_installs_a_head() -> Result<()> {
        let engine = Engine::with_embedder(config(), ChannelStats)?;
        engine.add_class("dark")?;
        engine.add_class("light")?;
        engine.add_sample("dark", &solid(5))?;
        engine.add_sample("light", &solid(250))?;

        let report = engine.train()?;

        assert_eq!(report.samples, 2);
        assert_eq!(engine.state(), TrainingState::Ready);
        assert!(engine.is_trained());
        Ok(())
    }

    #[test]
    fn failed_training_keeps_previous_head() -> Result<()> {
        let engine = Engine::with_embedder(config(), ChannelStats)?;
        engine.add_class("dark")?;
        engine.add_class("light")?;
        engine.add_sample("dark", &solid(5))?;
        engine.add_sample("light", &solid(250))?;
        engine.train()?;
        let before = engine.model();

        engine.add_class("grey")?;
        assert!(matches!(engine.train(), Err(Error::Readiness(_))));

        assert_eq!(engine.state(), TrainingState::Ready);
        let after = engine.model();
        assert!(matches!((before, after), (Some(a), Some(b)) if Arc::ptr_eq(&a, &b)));
        Ok(())
    }

    #[test]
    fn samples_need_a_known_class_and_pixels() -> Result<()> {
        let engine = Engine::with_embedder(config(), ChannelStats)?;
        engine.add_class("a")?;

        assert!(matches!(
            engine.add_sample("b", &solid(1)),
            Err(Error::UnknownClass(_))
        ));
        assert!(matches!(
            engine.add_sample("a", &RgbImage::new(0, 4)),
            Err(Error::ConfigurationMismatch(_))
        ));
        assert!(engine.add_class("  ").is_err());
        Ok(())
    }

    #[test]
    fn padded_class_names_are_accepted_everywhere() -> Result<()> {
        let engine = Engine::with_embedder(config(), ChannelStats)?;
        engine.add_class("pear ")?;

        assert_eq!(engine.add_sample("pear ", &solid(40))?, 1);
        assert_eq!(engine.sample_count(" pear"), 1);
        engine.clear_class("pear ")?;
        assert_eq!(engine.sample_count("pear"), 0);
        assert_eq!(engine.class_names(), vec!["pear"]);
        Ok(())
    }

    #[test]
    fn reset_forgets_everything() -> Result<()> {
        let engine = Engine::with_embedder(config(), ChannelStats)?;
        engine.add_class("dark")?;
        engine.add_class("light")?;
        engine.add_sample("dark", &solid(5))?;
        engine.add_sample("light", &solid(250))?;
        engine.train()?;

        engine.reset();

        assert!(!engine.is_trained());
        assert!(engine.class_names().is_empty());
        assert_eq!(engine.state(), TrainingState::Idle);
        Ok(())
    }
}
