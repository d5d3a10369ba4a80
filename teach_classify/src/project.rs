//! In-memory sample store.
//!
//! Classes keep their insertion order; a class's position is its training label and its column
//! in probability vectors.
use crate::{Error, ImageTensor, Result};

/// One `[1, S, S, 3]` tensor captured for a class. Never mutated after creation.
pub type Sample = ImageTensor;

#[derive(Debug)]
struct ClassSamples {
    name: String,
    samples: Vec<Sample>,
}

#[derive(Debug)]
pub struct Project {
    name: String,
    classes: Vec<ClassSamples>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the project. Blank names fall back to `MyProject`.
    pub fn set_name(&mut self, name: &str) {
        self.name = match name.trim() {
            "" => "MyProject".to_owned(),
            trimmed => trimmed.to_owned(),
        };
    }

    /// Add a class unless it exists. Returns its label index.
    pub fn add_class(&mut self, name: &str) -> Option<usize> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(index) = self.class_index(name) {
            return Some(index);
        }

        self.classes.push(ClassSamples {
            name: name.to_owned(),
            samples: Vec::new(),
        });
        Some(self.classes.len() - 1)
    }

    /// Label index of a class. Names are matched the way `add_class` stores them.
    pub fn class_index(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.classes.iter().position(|c| c.name == name)
    }

    /// Class names in label order.
    pub fn class_names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn push_sample(&mut self, class: &str, sample: Sample) -> Result<usize> {
        let entry = self.entry_mut(class)?;
        entry.samples.push(sample);

        Ok(entry.samples.len())
    }

    pub fn sample_count(&self, class: &str) -> usize {
        self.class_index(class)
            .map(|index| self.classes[index].samples.len())
            .unwrap_or(0)
    }

    pub fn total_samples(&self) -> usize {
        self.classes.iter().map(|c| c.samples.len()).sum()
    }

    /// Classes with fewer than `min` samples, in label order.
    pub fn classes_missing_samples(&self, min: usize) -> Vec<String> {
        self.classes
            .iter()
            .filter(|c| c.samples.len() < min)
            .map(|c| c.name.clone())
            .collect()
    }

    /// `(label, samples)` per class in label order.
    pub fn labelled_samples(&self) -> impl Iterator<Item = (usize, &[Sample])> {
        self.classes
            .iter()
            .enumerate()
            .map(|(label, c)| (label, c.samples.as_slice()))
    }

    /// Drop the samples of one class, keeping the class itself.
    pub fn clear_samples(&mut self, class: &str) -> Result<()> {
        self.entry_mut(class)?.samples.clear();

        Ok(())
    }

    /// Remove every class together with its samples.
    pub fn clear_classes(&mut self) {
        self.classes.clear();
    }

    fn entry_mut(&mut self, class: &str) -> Result<&mut ClassSamples> {
        match self.class_index(class) {
            Some(index) => Ok(&mut self.classes[index]),
            None => Err(Error::UnknownClass(class.to_owned())),
        }
    }
}
