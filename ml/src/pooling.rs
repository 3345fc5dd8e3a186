//! Max and mean pooling over the spatial axes of channels-last data, with valid padding.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::{
    errors::{EngineError, EngineResult},
    ImagePrecision,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Max,
    Mean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingLayer {
    kind: PoolKind,
    pool_size: (usize, usize),
    stride: (usize, usize),
}

impl PoolingLayer {
    pub fn new(kind: PoolKind, pool_size: (usize, usize), stride: (usize, usize)) -> Self {
        debug_assert!(stride.0 > 0 && stride.1 > 0, "Stride of 0 passed");
        Self {
            kind,
            pool_size,
            stride,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn pool_size(&self) -> (usize, usize) {
        self.pool_size
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    /// Spatial output size, `None` if the window does not fit into the input.
    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        if height < self.pool_size.0 || width < self.pool_size.1 {
            return None;
        }
        Some((
            (height - self.pool_size.0) / self.stride.0 + 1,
            (width - self.pool_size.1) / self.stride.1 + 1,
        ))
    }

    fn checked_output_size(&self, height: usize, width: usize) -> EngineResult<(usize, usize)> {
        self.output_size(height, width)
            .ok_or_else(|| EngineError::IncompatibleShapes {
                op: "pool2d",
                details: format!(
                    "window {}x{} does not fit into {}x{} input",
                    self.pool_size.0, self.pool_size.1, height, width
                ),
            })
    }

    fn window<'a>(
        &self,
        image: &'a ArrayView3<'_, ImagePrecision>,
        i: usize,
        j: usize,
    ) -> ArrayView3<'a, ImagePrecision> {
        let top = i * self.stride.0;
        let left = j * self.stride.1;
        image.slice(s![
            top..top + self.pool_size.0,
            left..left + self.pool_size.1,
            ..
        ])
    }

    pub fn pool(&self, images: ArrayView4<ImagePrecision>) -> EngineResult<Array4<ImagePrecision>> {
        let (batch, height, width, channels) = images.dim();
        let (new_h, new_w) = self.checked_output_size(height, width)?;
        let window_size = (self.pool_size.0 * self.pool_size.1) as ImagePrecision;

        let mut output = Array4::zeros((batch, new_h, new_w, channels));
        for (image, mut out) in images.outer_iter().zip(output.outer_iter_mut()) {
            for i in 0..new_h {
                for j in 0..new_w {
                    let window = self.window(&image, i, j);
                    for c in 0..channels {
                        let values = window.index_axis(Axis(2), c);
                        out[[i, j, c]] = match self.kind {
                            PoolKind::Max => values
                                .fold(ImagePrecision::NEG_INFINITY, |a, &b| a.max(b)),
                            PoolKind::Mean => values.sum() / window_size,
                        };
                    }
                }
            }
        }
        Ok(output)
    }

    /// Gradient with respect to the input. Max pooling routes the gradient to the first
    /// maximal element of each window, mean pooling spreads it evenly.
    pub fn backward(
        &self,
        images: ArrayView4<ImagePrecision>,
        grad: ArrayView4<ImagePrecision>,
    ) -> EngineResult<Array4<ImagePrecision>> {
        let (_, height, width, channels) = images.dim();
        let (new_h, new_w) = self.checked_output_size(height, width)?;
        let window_size = (self.pool_size.0 * self.pool_size.1) as ImagePrecision;

        let mut grad_images = Array4::zeros(images.raw_dim());
        for ((image, g), mut grad_image) in images
            .outer_iter()
            .zip(grad.outer_iter())
            .zip(grad_images.outer_iter_mut())
        {
            for i in 0..new_h {
                for j in 0..new_w {
                    let top = i * self.stride.0;
                    let left = j * self.stride.1;
                    for c in 0..channels {
                        let upstream = g[[i, j, c]];
                        match self.kind {
                            PoolKind::Max => {
                                let window = self.window(&image, i, j);
                                let mut best = (0, 0);
                                let mut best_value = ImagePrecision::NEG_INFINITY;
                                for ((wi, wj), &value) in
                                    window.index_axis(Axis(2), c).indexed_iter()
                                {
                                    if value > best_value {
                                        best_value = value;
                                        best = (wi, wj);
                                    }
                                }
                                grad_image[[top + best.0, left + best.1, c]] += upstream;
                            }
                            PoolKind::Mean => {
                                grad_image
                                    .slice_mut(s![
                                        top..top + self.pool_size.0,
                                        left..left + self.pool_size.1,
                                        c
                                    ])
                                    .mapv_inplace(|v| v + upstream / window_size);
                            }
                        }
                    }
                }
            }
        }
        Ok(grad_images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(image: Array2<f32>) -> Array4<f32> {
        let (h, w) = image.dim();
        image.into_shape((1, h, w, 1)).unwrap()
    }

    fn sample() -> Array4<f32> {
        single(array![
            [1., 2., 5., 0.],
            [3., 4., 1., 1.],
            [0., 0., 2., 2.],
            [8., 0., 2., 6.]
        ])
    }

    #[test]
    fn test_max_pool() {
        let layer = PoolingLayer::new(PoolKind::Max, (2, 2), (2, 2));
        assert_eq!(
            layer.pool(sample().view()).unwrap(),
            single(array![[4., 5.], [8., 6.]])
        );
    }

    #[test]
    fn test_mean_pool() {
        let layer = PoolingLayer::new(PoolKind::Mean, (2, 2), (2, 2));
        assert_eq!(
            layer.pool(sample().view()).unwrap(),
            single(array![[2.5, 1.75], [2., 3.]])
        );
    }

    #[test]
    fn test_odd_input_drops_last_row() {
        let layer = PoolingLayer::new(PoolKind::Max, (2, 2), (2, 2));
        assert_eq!(layer.output_size(5, 5), Some((2, 2)));
        assert_eq!(layer.output_size(1, 5), None);
        assert!(layer.pool(Array4::zeros((1, 1, 4, 1)).view()).is_err());
    }

    #[test]
    fn test_batched_overlapping_windows() {
        let images = ndarray::concatenate![Axis(0), sample(), sample().mapv(|v| -v)];
        let layer = PoolingLayer::new(PoolKind::Max, (3, 3), (1, 1));
        let pooled = layer.pool(images.view()).unwrap();
        assert_eq!(pooled.dim(), (2, 2, 2, 1));
        assert_eq!(
            pooled.index_axis(Axis(0), 0),
            array![[5., 5.], [8., 6.]].insert_axis(Axis(2))
        );
        assert_eq!(
            pooled.index_axis(Axis(0), 1),
            array![[0., 0.], [0., 0.]].insert_axis(Axis(2))
        );

        for image in images.outer_iter() {
            let window = layer.window(&image, 1, 1);
            assert_eq!(window.dim(), (3, 3, 1));
        }
        let grad = layer
            .backward(images.view(), Array4::ones((2, 2, 2, 1)).view())
            .unwrap();
        assert_eq!(grad.sum(), 8.);
    }

    #[test]
    fn test_max_pool_backward_routes_to_maximum() {
        let layer = PoolingLayer::new(PoolKind::Max, (2, 2), (2, 2));
        let grad = single(array![[1., 2.], [3., 4.]]);
        let grad_input = layer.backward(sample().view(), grad.view()).unwrap();
        assert_eq!(
            grad_input,
            single(array![
                [0., 0., 2., 0.],
                [0., 1., 0., 0.],
                [0., 0., 0., 0.],
                [3., 0., 0., 4.]
            ])
        );
    }

    #[test]
    fn test_mean_pool_backward_spreads_evenly() {
        let layer = PoolingLayer::new(PoolKind::Mean, (2, 2), (2, 2));
        let grad = single(array![[4., 8.], [0., 4.]]);
        let grad_input = layer.backward(sample().view(), grad.view()).unwrap();
        assert_eq!(
            grad_input,
            single(array![
                [1., 1., 2., 2.],
                [1., 1., 2., 2.],
                [0., 0., 1., 1.],
                [0., 0., 1., 1.]
            ])
        );
    }
}
