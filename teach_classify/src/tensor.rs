//! Tensor buffers registered with the global [`METER`].
//!
//! Every numeric buffer produced by the encode/embed/predict pipeline is wrapped in a
//! [`Tracked`] value. Dropping the value releases the buffer, so scopes bound the live set on
//! both success and error paths and tests can assert that nothing is retained.
use std::ops::{Deref, DerefMut};

use ndarray::{Array2, Array4, ArrayD, Axis};

use crate::meter::METER;

/// An owned buffer counted as live until dropped.
#[derive(Debug)]
pub struct Tracked<T> {
    inner: T,
}

impl<T> Tracked<T> {
    pub fn new(inner: T) -> Self {
        METER.tick_alloc();
        Self { inner }
    }
}

impl<T: Clone> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        METER.tick_release();
    }
}

/// Images as `[N, H, W, 3]`, channel values on the 0–255 scale.
pub type ImageTensor = Tracked<Array4<f32>>;

/// Raw extractor output, `[N, …]`.
pub type RawEmbeddings = Tracked<ArrayD<f32>>;

/// Row-per-image matrices: flattened embeddings `[N, D]`, one-hot labels and probabilities
/// `[N, C]`.
pub type Matrix = Tracked<Array2<f32>>;

/// Collapse every axis after the batch axis into one.
pub fn flatten(raw: &RawEmbeddings) -> Matrix {
    let rows = raw.shape().first().copied().unwrap_or(0);
    let width = if rows == 0 { 0 } else { raw.len() / rows };
    let flat = raw.iter().cloned().collect::<Vec<_>>();

    // `len == rows * width` by construction
    let matrix = Array2::from_shape_vec((rows, width), flat)
        .unwrap_or_else(|_| Array2::zeros((rows, width)));

    Tracked::new(matrix)
}

/// One-hot encode class indices into `[N, num_classes]`.
pub fn one_hot(labels: &[usize], num_classes: usize) -> Matrix {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (mut row, &label) in encoded.axis_iter_mut(Axis(0)).zip(labels) {
        if label < num_classes {
            row[label] = 1.0;
        }
    }

    Tracked::new(encoded)
}
