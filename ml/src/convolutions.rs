use crate::{
    errors::{EngineError, EngineResult},
    ImagePrecision, WeightPrecision,
};
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Zero-pads so that the output has `ceil(input / stride)` rows and columns.
    /// Extra padding goes to the bottom/right, as in TensorFlow.
    Same,
    /// No padding, windows that do not fit are dropped.
    Valid,
}

impl Padding {
    pub fn name(&self) -> &'static str {
        match self {
            Padding::Same => "same",
            Padding::Valid => "valid",
        }
    }
}

/// Rust implementation of a convolutional layer.
/// Data is expected in channels-last layout (batch x height x width x channels) and the
/// kernel shall have dimension (in that order)
/// kernel height x kernel width x input channels x output channels
/// (to comply with the order in which keras weights are saved).
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionLayer {
    kernel_height: usize,
    kernel_width: usize,
    stride: (usize, usize),
    padding: Padding,
}

impl ConvolutionLayer {
    pub fn new(
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
    ) -> ConvolutionLayer {
        debug_assert!(stride.0 > 0 && stride.1 > 0, "Stride of 0 passed");

        ConvolutionLayer {
            kernel_height: kernel_size.0,
            kernel_width: kernel_size.1,
            stride,
            padding,
        }
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        (self.kernel_height, self.kernel_width)
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Spatial output size for an input of the given size, `None` if the kernel does not fit.
    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let out = |size: usize, kernel: usize, stride: usize| match self.padding {
            Padding::Same => Some((size + stride - 1) / stride),
            Padding::Valid if size >= kernel => Some((size - kernel) / stride + 1),
            Padding::Valid => None,
        };
        Some((
            out(height, self.kernel_height, self.stride.0)?,
            out(width, self.kernel_width, self.stride.1)?,
        ))
    }

    /// Padding added before the first row and the first column.
    fn padding_offsets(&self, height: usize, width: usize) -> (usize, usize) {
        match self.padding {
            Padding::Valid => (0, 0),
            Padding::Same => {
                let before = |size: usize, kernel: usize, stride: usize| {
                    let out = (size + stride - 1) / stride;
                    ((out - 1) * stride + kernel).saturating_sub(size) / 2
                };
                (
                    before(height, self.kernel_height, self.stride.0),
                    before(width, self.kernel_width, self.stride.1),
                )
            }
        }
    }

    fn checked_output_size(&self, height: usize, width: usize) -> EngineResult<(usize, usize)> {
        self.output_size(height, width)
            .ok_or_else(|| EngineError::IncompatibleShapes {
                op: "conv2d",
                details: format!(
                    "kernel {}x{} does not fit into {}x{} input with valid padding",
                    self.kernel_height, self.kernel_width, height, width
                ),
            })
    }

    /// Performs a convolution on a batch of images using this layers hyperparameters.
    /// Every image is unrolled im2col style, so a single matrix product computes all
    /// output positions at once.
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    pub fn convolve(
        &self,
        images: ArrayView4<ImagePrecision>,
        kernel: ArrayView4<WeightPrecision>,
        bias: ArrayView1<WeightPrecision>,
    ) -> EngineResult<Array4<ImagePrecision>> {
        let (batch, height, width, _) = images.dim();
        let (new_h, new_w) = self.checked_output_size(height, width)?;
        let filters = kernel.len_of(Axis(3));
        let kernel_standard = kernel.as_standard_layout();
        let filter_col = kernel_standard
            .view()
            .into_shape((kernel.len() / filters, filters))?;

        let mut output = Array4::zeros((batch, new_h, new_w, filters));
        for (image, mut out) in images.outer_iter().zip(output.outer_iter_mut()) {
            let im_col = self.im2col(image, new_h, new_w);
            let response = im_col.dot(&filter_col) + &bias;
            out.assign(&response.into_shape((new_h, new_w, filters))?);
        }
        Ok(output)
    }

    /// Returns the gradients with respect to the images, the kernel and the bias.
    pub fn backward(
        &self,
        images: ArrayView4<ImagePrecision>,
        kernel: ArrayView4<WeightPrecision>,
        grad: ArrayView4<ImagePrecision>,
    ) -> EngineResult<(
        Array4<ImagePrecision>,
        Array4<WeightPrecision>,
        Array1<WeightPrecision>,
    )> {
        let (_, height, width, channels) = images.dim();
        let (new_h, new_w) = self.checked_output_size(height, width)?;
        let filters = kernel.len_of(Axis(3));
        let kernel_standard = kernel.as_standard_layout();
        let filter_col = kernel_standard
            .view()
            .into_shape((kernel.len() / filters, filters))?;
        let grad = grad.as_standard_layout();

        let mut grad_images = Array4::zeros(images.raw_dim());
        let mut grad_filter = Array2::zeros(filter_col.raw_dim());
        let mut grad_bias = Array1::zeros(filters);

        for ((image, g), mut grad_image) in images
            .outer_iter()
            .zip(grad.outer_iter())
            .zip(grad_images.outer_iter_mut())
        {
            let im_col = self.im2col(image, new_h, new_w);
            let g = g.into_shape((new_h * new_w, filters))?;

            grad_filter += &im_col.t().dot(&g);
            grad_bias += &g.sum_axis(Axis(0));

            let grad_col = g.dot(&filter_col.t());
            grad_image.assign(&self.col2im(grad_col.view(), height, width, channels, new_h, new_w));
        }

        let grad_kernel = grad_filter.into_shape(kernel.raw_dim())?;
        Ok((grad_images, grad_kernel, grad_bias))
    }

    /// Unrolls every receptive field of a (height x width x channels) image into one row.
    /// Column order is (kernel row, kernel column, channel), matching the kernel layout.
    fn im2col(
        &self,
        image: ArrayView3<ImagePrecision>,
        new_h: usize,
        new_w: usize,
    ) -> Array2<ImagePrecision> {
        let (height, width, channels) = image.dim();
        let (pad_top, pad_left) = self.padding_offsets(height, width);
        let mut img_matrix = Array2::zeros((
            new_h * new_w,
            self.kernel_height * self.kernel_width * channels,
        ));

        for i in 0..new_h {
            for j in 0..new_w {
                let row = i * new_w + j;
                for ki in 0..self.kernel_height {
                    let y = (i * self.stride.0 + ki) as isize - pad_top as isize;
                    if y < 0 || y >= height as isize {
                        continue;
                    }
                    for kj in 0..self.kernel_width {
                        let x = (j * self.stride.1 + kj) as isize - pad_left as isize;
                        if x < 0 || x >= width as isize {
                            continue;
                        }
                        let offset = (ki * self.kernel_width + kj) * channels;
                        let pixel = image.slice(s![y as usize, x as usize, ..]);
                        img_matrix
                            .slice_mut(s![row, offset..offset + channels])
                            .assign(&pixel);
                    }
                }
            }
        }
        img_matrix
    }

    /// Adjoint of `im2col`: scatters the rows back, summing overlapping contributions.
    fn col2im(
        &self,
        mat: ArrayView2<ImagePrecision>,
        height: usize,
        width: usize,
        channels: usize,
        new_h: usize,
        new_w: usize,
    ) -> Array3<ImagePrecision> {
        let (pad_top, pad_left) = self.padding_offsets(height, width);
        let mut img_mat = Array3::zeros((height, width, channels));

        for i in 0..new_h {
            for j in 0..new_w {
                let row = i * new_w + j;
                for ki in 0..self.kernel_height {
                    let y = (i * self.stride.0 + ki) as isize - pad_top as isize;
                    if y < 0 || y >= height as isize {
                        continue;
                    }
                    for kj in 0..self.kernel_width {
                        let x = (j * self.stride.1 + kj) as isize - pad_left as isize;
                        if x < 0 || x >= width as isize {
                            continue;
                        }
                        let offset = (ki * self.kernel_width + kj) * channels;
                        let mut pixel = img_mat.slice_mut(s![y as usize, x as usize, ..]);
                        pixel += &mat.slice(s![row, offset..offset + channels]);
                    }
                }
            }
        }
        img_mat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wraps a single-channel 2d image into a batch of one.
    fn single(image: Array2<f32>) -> Array4<f32> {
        let (h, w) = image.dim();
        image.into_shape((1, h, w, 1)).unwrap()
    }

    #[test]
    fn test_2d_conv_valid() {
        let test_img = single(array![[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]]);
        let kernel = Array::from_shape_vec((2, 2, 1, 1), vec![0., 1., -1., 0.]).unwrap();
        let conv_layer = ConvolutionLayer::new((2, 2), (1, 1), Padding::Valid);

        let convolved_image = conv_layer
            .convolve(test_img.view(), kernel.view(), array![0.].view())
            .unwrap();

        assert_eq!(convolved_image, single(array![[1., 0.], [1., 0.]]));
    }

    #[test]
    fn test_2d_conv_with_stride() {
        let test_img = single(array![[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]]);
        let kernel = Array::from_shape_vec((1, 1, 1, 1), vec![1.]).unwrap();
        let conv_layer = ConvolutionLayer::new((1, 1), (2, 2), Padding::Valid);

        let convolved_image = conv_layer
            .convolve(test_img.view(), kernel.view(), array![0.].view())
            .unwrap();

        assert_eq!(convolved_image, single(array![[0., 0.], [-1., 0.]]));
    }

    #[test]
    fn test_2d_conv_same_padding_keeps_size() {
        let test_img = single(array![[1., 2., 3.], [4., 5., 6.], [7., 8., 9.]]);
        let kernel = Array::from_elem((3, 3, 1, 1), 1.);
        let conv_layer = ConvolutionLayer::new((3, 3), (1, 1), Padding::Same);

        let convolved_image = conv_layer
            .convolve(test_img.view(), kernel.view(), array![1.].view())
            .unwrap();

        // Every output is the sum of its (zero padded) 3x3 neighbourhood plus the bias.
        let expected = single(array![
            [13., 22., 17.],
            [28., 46., 34.],
            [25., 40., 29.]
        ]);
        assert_eq!(convolved_image, expected);
    }

    #[test]
    fn test_2d_conv_multiple_channels() {
        // 2x2 image with 2 channels, one 1x1 filter mixing them and a second one copying channel 0.
        let test_img =
            Array::from_shape_vec((1, 2, 2, 2), vec![1., 10., 2., 20., 3., 30., 4., 40.]).unwrap();
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 1., 1., 0.]).unwrap();
        let conv_layer = ConvolutionLayer::new((1, 1), (1, 1), Padding::Valid);

        let out = conv_layer
            .convolve(test_img.view(), kernel.view(), array![0., 0.].view())
            .unwrap();

        assert_eq!(out.dim(), (1, 2, 2, 2));
        assert_eq!(out.slice(s![0, .., .., 0]), array![[11., 22.], [33., 44.]]);
        assert_eq!(out.slice(s![0, .., .., 1]), array![[1., 2.], [3., 4.]]);
    }

    #[test]
    fn test_output_size() {
        let same = ConvolutionLayer::new((3, 3), (2, 2), Padding::Same);
        assert_eq!(same.output_size(28, 27), Some((14, 14)));

        let valid = ConvolutionLayer::new((3, 3), (1, 1), Padding::Valid);
        assert_eq!(valid.output_size(28, 28), Some((26, 26)));
        assert_eq!(valid.output_size(2, 28), None);
    }

    #[test]
    fn test_backward_matches_adjoint() {
        // For a linear map f, <f(x), g> == <x, f^T(g)>; the image gradient is exactly f^T(g).
        let conv_layer = ConvolutionLayer::new((3, 3), (2, 2), Padding::Same);
        let images = Array::from_shape_fn((2, 5, 4, 3), |(n, i, j, c)| {
            ((n * 7 + i * 5 + j * 3 + c) % 11) as f32 - 5.
        });
        let kernel = Array::from_shape_fn((3, 3, 3, 2), |(i, j, c, f)| {
            ((i * 3 + j * 2 + c + f * 5) % 7) as f32 / 7. - 0.5
        });
        let zero_bias = array![0., 0.];

        let out = conv_layer
            .convolve(images.view(), kernel.view(), zero_bias.view())
            .unwrap();
        let grad = Array::from_shape_fn(out.raw_dim(), |(n, i, j, f)| {
            ((n + i * 2 + j + f * 3) % 5) as f32 - 2.
        });
        let (grad_images, grad_kernel, grad_bias) = conv_layer
            .backward(images.view(), kernel.view(), grad.view())
            .unwrap();

        let lhs = (&out * &grad).sum();
        let rhs = (&images * &grad_images).sum();
        assert!((lhs - rhs).abs() < 1e-3 * lhs.abs().max(1.));

        // The output is linear in the kernel as well.
        let rhs_kernel = (&kernel * &grad_kernel).sum();
        assert!((lhs - rhs_kernel).abs() < 1e-3 * lhs.abs().max(1.));

        assert_eq!(grad_bias, grad.sum_axis(Axis(0)).sum_axis(Axis(0)).sum_axis(Axis(0)));
    }
}
