//! Batch normalization over the last (channel) axis.
//!
//! During training the layer normalizes with the statistics of the current batch and the
//! moving averages are updated afterwards; at inference time the moving averages are used.
use ndarray::*;

use crate::{
    errors::{EngineError, EngineResult},
    models::InternalDataRepresentation,
    ImagePrecision, WeightPrecision,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormLayer {
    epsilon: f32,
    momentum: f32,
}

/// Per-channel statistics of one training batch, kept for the backward pass.
#[derive(Debug, Clone)]
pub struct BatchStatistics {
    pub mean: Array1<ImagePrecision>,
    pub variance: Array1<ImagePrecision>,
}

impl Default for BatchNormLayer {
    fn default() -> Self {
        Self::new(1e-3, 0.99)
    }
}

impl BatchNormLayer {
    pub fn new(epsilon: f32, momentum: f32) -> Self {
        Self { epsilon, momentum }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn normalize_inference(
        &self,
        x: &InternalDataRepresentation,
        gamma: ArrayView1<WeightPrecision>,
        beta: ArrayView1<WeightPrecision>,
        moving_mean: ArrayView1<WeightPrecision>,
        moving_variance: ArrayView1<WeightPrecision>,
    ) -> EngineResult<InternalDataRepresentation> {
        let rows = channel_rows(x)?;
        let inv_std = moving_variance.mapv(|v| 1. / (v + self.epsilon).sqrt());
        let normalized = (rows - &moving_mean) * &inv_std * &gamma + &beta;
        Ok(normalized.into_shape(x.raw_dim())?)
    }

    pub fn normalize_training(
        &self,
        x: &InternalDataRepresentation,
        gamma: ArrayView1<WeightPrecision>,
        beta: ArrayView1<WeightPrecision>,
    ) -> EngineResult<(InternalDataRepresentation, BatchStatistics)> {
        let rows = channel_rows(x)?;
        let mean = rows
            .mean_axis(Axis(0))
            .ok_or_else(|| EngineError::DataMismatch("batch norm over an empty batch".into()))?;
        let variance = rows.var_axis(Axis(0), 0.);
        let inv_std = variance.mapv(|v| 1. / (v + self.epsilon).sqrt());
        let normalized = (rows - &mean) * &inv_std * &gamma + &beta;
        Ok((
            normalized.into_shape(x.raw_dim())?,
            BatchStatistics { mean, variance },
        ))
    }

    /// Returns the gradients with respect to the input, gamma and beta of a training-mode pass.
    pub fn backward(
        &self,
        x: &InternalDataRepresentation,
        gamma: ArrayView1<WeightPrecision>,
        statistics: &BatchStatistics,
        grad: &InternalDataRepresentation,
    ) -> EngineResult<(
        InternalDataRepresentation,
        Array1<WeightPrecision>,
        Array1<WeightPrecision>,
    )> {
        let rows = channel_rows(x)?;
        let grad_rows = channel_rows(grad)?;
        let count = rows.len_of(Axis(0)) as ImagePrecision;

        let inv_std = statistics.variance.mapv(|v| 1. / (v + self.epsilon).sqrt());
        let x_hat = (rows - &statistics.mean) * &inv_std;

        let grad_gamma = (&grad_rows * &x_hat).sum_axis(Axis(0));
        let grad_beta = grad_rows.sum_axis(Axis(0));

        let grad_x_hat = grad_rows * &gamma;
        let sum_grad = grad_x_hat.sum_axis(Axis(0));
        let sum_grad_x_hat = (&grad_x_hat * &x_hat).sum_axis(Axis(0));
        let grad_input =
            (grad_x_hat * count - &sum_grad - x_hat * &sum_grad_x_hat) * &(inv_std / count);

        Ok((grad_input.into_shape(x.raw_dim())?, grad_gamma, grad_beta))
    }

    /// Moves the running statistics towards the statistics of the last batch.
    pub fn update_moving(
        &self,
        moving: &mut ArrayD<WeightPrecision>,
        batch_value: &Array1<ImagePrecision>,
    ) {
        let momentum = self.momentum;
        Zip::from(moving)
            .and(batch_value.view().into_dyn())
            .for_each(|m, &b| *m = momentum * *m + (1. - momentum) * b);
    }
}

/// Views the tensor as (positions x channels).
fn channel_rows(x: &InternalDataRepresentation) -> EngineResult<Array2<ImagePrecision>> {
    let channels = x.shape().last().copied().unwrap_or(1);
    let rows = if channels == 0 { 0 } else { x.len() / channels };
    Ok(x
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, channels))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_normalization_is_standardized() {
        let layer = BatchNormLayer::new(0., 0.99);
        let x = array![[1., 10.], [3., 30.]].into_dyn();
        let gamma = array![1., 2.];
        let beta = array![0., 1.];

        let (y, stats) = layer
            .normalize_training(&x, gamma.view(), beta.view())
            .unwrap();

        assert_eq!(stats.mean, array![2., 20.]);
        assert_eq!(stats.variance, array![1., 100.]);
        assert_eq!(y, array![[-1., -1.], [1., 3.]].into_dyn());
    }

    #[test]
    fn test_inference_uses_moving_statistics() {
        let layer = BatchNormLayer::new(0., 0.99);
        let x = Array::from_shape_vec((2, 1, 1, 1), vec![4., 0.])
            .unwrap()
            .into_dyn();

        let y = layer
            .normalize_inference(
                &x,
                array![1.].view(),
                array![0.].view(),
                array![2.].view(),
                array![4.].view(),
            )
            .unwrap();

        assert_eq!(y.iter().copied().collect::<Vec<f32>>(), vec![1., -1.]);
        assert_eq!(y.shape(), &[2, 1, 1, 1]);
    }

    #[test]
    fn test_update_moving() {
        let layer = BatchNormLayer::new(1e-3, 0.9);
        let mut moving = array![0., 10.].into_dyn();
        layer.update_moving(&mut moving, &array![10., 0.]);
        assert!((moving[[0]] - 1.).abs() < 1e-6);
        assert!((moving[[1]] - 9.).abs() < 1e-6);
    }

    #[test]
    fn test_backward_against_finite_differences() {
        let layer = BatchNormLayer::new(1e-3, 0.99);
        let x = array![[0.5, -1.0], [1.5, 2.0], [-0.3, 0.7], [0.9, -0.4]].into_dyn();
        let gamma = array![1.3, 0.7];
        let beta = array![0.1, -0.2];
        // Loss is <y, w> for a fixed w, so dL/dy = w.
        let w = array![[0.2, -0.5], [1.0, 0.3], [-0.7, 0.8], [0.4, 0.1]].into_dyn();
        let loss = |x: &ArrayD<f32>| {
            let (y, _) = layer
                .normalize_training(x, gamma.view(), beta.view())
                .unwrap();
            (&y * &w).sum()
        };

        let (_, stats) = layer
            .normalize_training(&x, gamma.view(), beta.view())
            .unwrap();
        let (grad_x, grad_gamma, grad_beta) =
            layer.backward(&x, gamma.view(), &stats, &w).unwrap();

        let h = 1e-2;
        for idx in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus.as_slice_mut().unwrap()[idx] += h;
            minus.as_slice_mut().unwrap()[idx] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2. * h);
            let analytic = grad_x.as_slice().unwrap()[idx];
            assert!(
                (numeric - analytic).abs() < 1e-2,
                "input {}: numeric {} analytic {}",
                idx,
                numeric,
                analytic
            );
        }

        assert_eq!(grad_beta, w.sum_axis(Axis(0)).into_dimensionality::<Ix1>().unwrap());
        assert_eq!(grad_gamma.len(), 2);
    }
}
