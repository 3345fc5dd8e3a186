//! Losses and metrics over batches of class probabilities and integer labels.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::{
    errors::{EngineError, EngineResult},
    ImagePrecision,
};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking the logarithm.
pub const EPSILON: ImagePrecision = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// Cross-entropy between predicted class probabilities and integer class labels.
    SparseCategoricalCrossentropy,
}

impl Default for Loss {
    fn default() -> Self {
        Loss::SparseCategoricalCrossentropy
    }
}

impl Loss {
    pub fn name(&self) -> &'static str {
        match self {
            Loss::SparseCategoricalCrossentropy => "sparse_categorical_crossentropy",
        }
    }

    /// Mean loss over the batch.
    pub fn compute(
        &self,
        predictions: ArrayView2<ImagePrecision>,
        labels: &[usize],
    ) -> EngineResult<ImagePrecision> {
        check_labels(predictions, labels)?;
        let batch = labels.len();
        if batch == 0 {
            return Ok(0.);
        }
        let total: ImagePrecision = labels
            .iter()
            .enumerate()
            .map(|(row, &label)| -clip(predictions[[row, label]]).ln())
            .sum();
        Ok(total / batch as ImagePrecision)
    }

    /// Gradient of the mean loss with respect to the predictions.
    pub fn gradient(
        &self,
        predictions: ArrayView2<ImagePrecision>,
        labels: &[usize],
    ) -> EngineResult<Array2<ImagePrecision>> {
        check_labels(predictions, labels)?;
        let batch = labels.len().max(1) as ImagePrecision;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (row, &label) in labels.iter().enumerate() {
            let p = predictions[[row, label]];
            // The clip has no gradient outside its range.
            if p > EPSILON && p < 1. - EPSILON {
                grad[[row, label]] = -1. / (p * batch);
            }
        }
        Ok(grad)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Fraction of samples whose highest scoring class equals the label.
    Accuracy,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
        }
    }

    /// Mean metric over the batch.
    pub fn compute(
        &self,
        predictions: ArrayView2<ImagePrecision>,
        labels: &[usize],
    ) -> EngineResult<ImagePrecision> {
        check_labels(predictions, labels)?;
        if labels.is_empty() {
            return Ok(0.);
        }
        match self {
            Metric::Accuracy => {
                let hits = predictions
                    .outer_iter()
                    .zip(labels)
                    .filter(|(row, label)| argmax(row.view()) == **label)
                    .count();
                Ok(hits as ImagePrecision / labels.len() as ImagePrecision)
            }
        }
    }
}

fn clip(p: ImagePrecision) -> ImagePrecision {
    p.max(EPSILON).min(1. - EPSILON)
}

/// Index of the first maximal element.
fn argmax(row: ArrayView1<ImagePrecision>) -> usize {
    let mut best = 0;
    for (i, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = i;
        }
    }
    best
}

fn check_labels(predictions: ArrayView2<ImagePrecision>, labels: &[usize]) -> EngineResult<()> {
    let (rows, classes) = predictions.dim();
    if rows != labels.len() {
        return Err(EngineError::DataMismatch(format!(
            "{} predictions but {} labels",
            rows,
            labels.len()
        )));
    }
    if let Some(label) = labels.iter().find(|&&label| label >= classes) {
        return Err(EngineError::DataMismatch(format!(
            "label {} out of range for {} classes",
            label, classes
        )));
    }
    Ok(())
}
