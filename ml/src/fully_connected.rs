use crate::{
    activation_functions::Activation, errors::EngineResult, ImagePrecision, WeightPrecision,
};
use ndarray::*;

/// Rust implementation of a feed forward layer.
/// The weight matrix shall have dimension (in that order)
/// input units x output units (to comply with the order in which keras weights are saved).
#[derive(Debug, Clone, PartialEq)]
pub struct FeedforwardLayer {
    units: usize,
    activation: Activation,
}

impl FeedforwardLayer {
    pub fn new(units: usize, activation: Activation) -> Self {
        Self { units, activation }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn forward_pass(
        &self,
        data: ArrayView2<ImagePrecision>,
        weights: ArrayView2<WeightPrecision>,
        bias: ArrayView1<WeightPrecision>,
    ) -> EngineResult<Array2<ImagePrecision>> {
        let pre_activation = data.dot(&weights) + &bias;
        Ok(self
            .activation
            .activate(&pre_activation.into_dyn())?
            .into_dimensionality::<Ix2>()?)
    }

    /// Returns the gradients with respect to the data, the weights and the bias.
    pub fn backward(
        &self,
        data: ArrayView2<ImagePrecision>,
        output: ArrayView2<ImagePrecision>,
        weights: ArrayView2<WeightPrecision>,
        grad: ArrayView2<ImagePrecision>,
    ) -> EngineResult<(
        Array2<ImagePrecision>,
        Array2<WeightPrecision>,
        Array1<WeightPrecision>,
    )> {
        let grad_pre_activation = self
            .activation
            .backward(&output.to_owned().into_dyn(), &grad.to_owned().into_dyn())?
            .into_dimensionality::<Ix2>()?;

        let grad_weights = data.t().dot(&grad_pre_activation);
        let grad_bias = grad_pre_activation.sum_axis(Axis(0));
        let grad_data = grad_pre_activation.dot(&weights.t());
        Ok((grad_data, grad_weights, grad_bias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_forward() {
        let layer = FeedforwardLayer::new(2, Activation::Linear);
        let data = array![[1., 2., 3.]];
        let weights = array![[1., 0.], [0., 1.], [1., -1.]];
        let out = layer
            .forward_pass(data.view(), weights.view(), array![0.5, 0.].view())
            .unwrap();
        assert_eq!(out, array![[4.5, -1.]]);
    }

    #[test]
    fn test_relu_forward_and_backward() {
        let layer = FeedforwardLayer::new(2, Activation::Relu);
        let data = array![[1., 2., 3.]];
        let weights = array![[1., 0.], [0., 1.], [1., -1.]];
        let bias = array![0., 0.];
        let out = layer
            .forward_pass(data.view(), weights.view(), bias.view())
            .unwrap();
        assert_eq!(out, array![[4., 0.]]);

        let (grad_data, grad_weights, grad_bias) = layer
            .backward(data.view(), out.view(), weights.view(), array![[1., 1.]].view())
            .unwrap();
        // The second unit is inactive and passes no gradient.
        assert_eq!(grad_bias, array![1., 0.]);
        assert_eq!(grad_weights, array![[1., 0.], [2., 0.], [3., 0.]]);
        assert_eq!(grad_data, array![[1., 0., 1.]]);
    }
}
