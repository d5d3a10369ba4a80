//! Training orchestration: readiness gate, dataset construction and head fitting.
use std::fmt;

use itertools::Itertools;
use ndarray::{concatenate, Axis};
use rand::Rng;

use crate::{
    config::TrainingConfig,
    extractor::Embedder,
    head::{ClassifierHead, EpochStats, FitOptions},
    project::Project,
    tensor::{flatten, one_hot, Tracked},
    Error, ImageTensor, Result,
};

/// Progress of a training run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrainingState {
    Idle,
    Validating,
    Embedding,
    Fitting,
    Ready,
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingState::Idle => "idle",
            TrainingState::Validating => "validating",
            TrainingState::Embedding => "embedding",
            TrainingState::Fitting => "fitting",
            TrainingState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// A precondition of training that is not met.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Requirement {
    MinClasses { required: usize, actual: usize },
    SamplesPerClass { required: usize, missing: Vec<String> },
    AnySamples,
    ExtractorLoaded,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::MinClasses { required, actual } => {
                write!(f, "add at least {required} classes (currently {actual}).")
            }
            Requirement::SamplesPerClass { required, missing } => write!(
                f,
                "each class needs ≥{required} sample(s); missing for: {}.",
                missing.join(", ")
            ),
            Requirement::AnySamples => write!(f, "add at least one sample."),
            Requirement::ExtractorLoaded => write!(f, "wait for the feature extractor to load."),
        }
    }
}

/// Every unmet training precondition, in a stable order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadinessReport {
    pub unmet: Vec<Requirement>,
}

impl fmt::Display for ReadinessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unmet.iter().join(" "))
    }
}

/// A fitted head together with the labels of its output columns.
#[derive(Debug)]
pub struct TrainedModel {
    labels: Vec<String>,
    head: ClassifierHead,
}

impl TrainedModel {
    pub fn new(labels: Vec<String>, head: ClassifierHead) -> Result<Self> {
        if labels.len() != head.num_classes() {
            return Err(Error::mismatch(format!(
                "{} class labels for a head with {} outputs",
                labels.len(),
                head.num_classes()
            )));
        }

        Ok(Self { labels, head })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    /// Label of output column `index`.
    pub fn label(&self, index: usize) -> String {
        self.labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}

/// Summary of a successful run.
#[derive(Clone, Debug)]
pub struct TrainingReport {
    pub samples: usize,
    pub embedding_width: usize,
    pub epochs: Vec<EpochStats>,
}

/// Drives one training run against a project with a borrowed extractor.
pub struct Trainer<'a> {
    embedder: Option<&'a dyn Embedder>,
    config: &'a TrainingConfig,
}

impl<'a> Trainer<'a> {
    pub fn new(embedder: Option<&'a dyn Embedder>, config: &'a TrainingConfig) -> Self {
        Self { embedder, config }
    }

    /// Check every precondition and report all that fail.
    pub fn check_readiness(&self, project: &Project) -> Result<(), ReadinessReport> {
        let mut unmet = Vec::new();

        if project.num_classes() < self.config.min_classes {
            unmet.push(Requirement::MinClasses {
                required: self.config.min_classes,
                actual: project.num_classes(),
            });
        }
        let missing = project.classes_missing_samples(self.config.min_samples_per_class);
        if !missing.is_empty() {
            unmet.push(Requirement::SamplesPerClass {
                required: self.config.min_samples_per_class,
                missing,
            });
        }
        if project.total_samples() == 0 {
            unmet.push(Requirement::AnySamples);
        }
        if self.embedder.is_none() {
            unmet.push(Requirement::ExtractorLoaded);
        }

        match unmet.is_empty() {
            true => Ok(()),
            false => Err(ReadinessReport { unmet }),
        }
    }

    /// Validate, embed every sample and fit a fresh head.
    ///
    /// `on_state` observes each transition. Intermediate tensors are released before
    /// returning; the project's samples are left in place for later runs.
    pub fn train<R: Rng + ?Sized>(
        &self,
        project: &Project,
        rng: &mut R,
        mut on_state: impl FnMut(TrainingState),
    ) -> Result<(TrainedModel, TrainingReport)> {
        on_state(TrainingState::Validating);
        self.check_readiness(project).map_err(Error::Readiness)?;
        let embedder = self.embedder.ok_or(Error::ExtractorNotReady)?;
        let num_classes = project.num_classes();

        on_state(TrainingState::Embedding);
        let (embeddings, targets) = {
            let (batch, labels) = build_dataset(project)?;
            log::info!(
                "Extracting features of {} samples with {}",
                labels.len(),
                embedder.describe()
            );
            let raw = embedder.embed(&batch)?;
            (flatten(&raw), one_hot(&labels, num_classes))
        };

        on_state(TrainingState::Fitting);
        let mut head = ClassifierHead::build(
            embeddings.ncols(),
            num_classes,
            self.config.hidden_units,
            self.config.dropout,
            rng,
        )?;
        let options = FitOptions {
            epochs: self.config.epochs,
            batch_size: self.config.batch_size,
            learning_rate: self.config.learning_rate,
        };
        let epochs = head.fit(&embeddings, &targets, options, rng)?;

        let report = TrainingReport {
            samples: embeddings.nrows(),
            embedding_width: embeddings.ncols(),
            epochs,
        };
        drop(targets);
        drop(embeddings);

        let model = TrainedModel::new(project.class_names(), head)?;
        Ok((model, report))
    }
}

/// Concatenate all samples in class order, labelling each with its class index.
fn build_dataset(project: &Project) -> Result<(ImageTensor, Vec<usize>)> {
    let mut views = Vec::new();
    let mut labels = Vec::new();
    for (label, samples) in project.labelled_samples() {
        for sample in samples {
            views.push(sample.view());
            labels.push(label);
        }
    }

    let batch = concatenate(Axis(0), &views)
        .map_err(|e| Error::mismatch(format!("samples differ in shape: {e}")))?;

    Ok((Tracked::new(batch), labels))
}

#[cfg(test)]
mod test {
    use ndarray::Array4;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::extractor::ChannelStats;

    fn solid(value: f32) -> ImageTensor {
        Tracked::new(Array4::from_elem((1, 4, 4, 3), value))
    }

    fn config() -> TrainingConfig {
        TrainingConfig {
            epochs: 2,
            batch_size: 4,
            hidden_units: 4,
            seed: Some(9),
            ..Default::default()
        }
    }

    #[test]
    fn single_class_reports_class_count() {
        let mut project = Project::new("p");
        project.add_class("a");
        let config = config();
        let trainer = Trainer::new(Some(&ChannelStats), &config);

        let report = trainer.check_readiness(&project).unwrap_err();

        assert_eq!(
            report.unmet[0],
            Requirement::MinClasses {
                required: 2,
                actual: 1
            }
        );
        assert!(report.to_string().contains("add at least 2 classes"));
    }

    #[test]
    fn empty_class_is_named_alone() -> Result<()> {
        let mut project = Project::new("p");
        project.add_class("full");
        project.add_class("empty");
        project.push_sample("full", solid(1.0))?;
        let config = config();
        let trainer = Trainer::new(Some(&ChannelStats), &config);

        let report = trainer.check_readiness(&project).unwrap_err();

        assert_eq!(
            report.unmet,
            vec![Requirement::SamplesPerClass {
                required: 1,
                missing: vec!["empty".into()]
            }]
        );
        let message = report.to_string();
        assert!(message.contains("empty"));
        assert!(!message.contains("full"));

        Ok(())
    }

    #[test]
    fn all_unmet_requirements_are_reported_together() {
        let project = Project::new("p");
        let config = config();
        let trainer = Trainer::new(None, &config);

        let report = trainer.check_readiness(&project).unwrap_err();

        assert_eq!(
            report.unmet,
            vec![
                Requirement::MinClasses {
                    required: 2,
                    actual: 0
                },
                Requirement::AnySamples,
                Requirement::ExtractorLoaded,
            ]
        );
    }

    #[test]
    fn dataset_follows_class_order() -> Result<()> {
        let mut project = Project::new("p");
        project.add_class("b");
        project.add_class("a");
        project.push_sample("a", solid(2.0))?;
        project.push_sample("b", solid(1.0))?;
        project.push_sample("a", solid(3.0))?;

        let (batch, labels) = build_dataset(&project)?;

        assert_eq!(labels, vec![0, 1, 1]);
        assert_eq!(batch.dim(), (3, 4, 4, 3));
        assert_eq!(batch[[0, 0, 0, 0]], 1.0);
        assert_eq!(batch[[2, 0, 0, 0]], 3.0);

        Ok(())
    }

    #[test]
    fn training_walks_through_states() -> Result<()> {
        let mut project = Project::new("p");
        project.add_class("dark");
        project.add_class("light");
        project.push_sample("dark", solid(10.0))?;
        project.push_sample("light", solid(240.0))?;
        let config = config();
        let trainer = Trainer::new(Some(&ChannelStats), &config);
        let mut rng = StdRng::seed_from_u64(3);
        let mut states = Vec::new();

        let (model, report) = trainer.train(&project, &mut rng, |s| states.push(s))?;

        assert_eq!(
            states,
            vec![
                TrainingState::Validating,
                TrainingState::Embedding,
                TrainingState::Fitting
            ]
        );
        assert_eq!(model.labels(), ["dark", "light"]);
        assert_eq!(model.head().num_classes(), 2);
        assert_eq!(report.samples, 2);
        assert_eq!(report.epochs.len(), 2);
        assert_eq!(project.total_samples(), 2);

        Ok(())
    }

    #[test]
    fn failed_validation_stops_before_embedding() {
        let project = Project::new("p");
        let config = config();
        let trainer = Trainer::new(Some(&ChannelStats), &config);
        let mut rng = StdRng::seed_from_u64(3);
        let mut states = Vec::new();

        let result = trainer.train(&project, &mut rng, |s| states.push(s));

        assert!(matches!(result, Err(Error::Readiness(_))));
        assert_eq!(states, vec![TrainingState::Validating]);
    }
}
