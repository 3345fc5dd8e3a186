//! This module provides the activation functions for our neural networks,
//! namely Relu and Softmax, plus the identity used by linear dense layers.
//!
//! All activation functions are exposed through the [`Activation`] enum, which knows
//! both directions, as well as free functions for the forward computation.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::{errors::EngineResult, models::InternalDataRepresentation, ImagePrecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    /// Normalizes over the last axis.
    Softmax,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Softmax => "softmax",
        }
    }

    pub fn activate(
        &self,
        x: &InternalDataRepresentation,
    ) -> EngineResult<InternalDataRepresentation> {
        Ok(match self {
            Activation::Linear => x.clone(),
            Activation::Relu => relu(x),
            Activation::Softmax => {
                let rows = softmax(last_axis_rows(x)?.view());
                rows.into_shape(x.raw_dim())?
            }
        })
    }

    /// Gradient with respect to the activation input, expressed through the
    /// activation *output* so that the forward input does not need to be kept.
    pub fn backward(
        &self,
        output: &InternalDataRepresentation,
        grad: &InternalDataRepresentation,
    ) -> EngineResult<InternalDataRepresentation> {
        Ok(match self {
            Activation::Linear => grad.clone(),
            Activation::Relu => {
                let mut grad_input = grad.clone();
                Zip::from(&mut grad_input)
                    .and(output)
                    .for_each(|g, &y| {
                        if y <= 0. {
                            *g = 0.;
                        }
                    });
                grad_input
            }
            Activation::Softmax => {
                let y = last_axis_rows(output)?;
                let dy = last_axis_rows(grad)?;
                let weighted = (&dy * &y).sum_axis(Axis(1)).insert_axis(Axis(1));
                ((&dy - &weighted) * &y).into_shape(output.raw_dim())?
            }
        })
    }
}

/// Views a tensor as rows over its last axis.
fn last_axis_rows(x: &InternalDataRepresentation) -> EngineResult<Array2<ImagePrecision>> {
    let features = x.shape().last().copied().unwrap_or(1);
    let rows = if features == 0 { 0 } else { x.len() / features };
    Ok(x
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, features))?)
}

/// Row-wise softmax, shifted by the row maximum for numerical stability.
pub fn softmax(x: ArrayView2<ImagePrecision>) -> Array2<ImagePrecision> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(ImagePrecision::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}
