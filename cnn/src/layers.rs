//! The layer vocabulary of a topology: residual skip blocks and pooling blocks.
//!
//! Every block knows how to add itself to a [`GraphBuilder`] and how to print its canonical
//! token, the building block of the model identity.
use std::fmt;

use log::debug;
use ml::{
    activation_functions::Activation, convolutions::Padding, errors::EngineResult,
    graph::{GraphBuilder, TensorHandle}, pooling::PoolKind,
};

/// Separates a token from the options of its non-default parameters, e.g. `max_k3x3`.
pub const OPTION_SEPARATOR: char = '_';

const SKIP_KERNEL: (usize, usize) = (3, 3);
const SKIP_STRIDE: (usize, usize) = (1, 1);
const POOL_WINDOW: (usize, usize) = (2, 2);

/// Writes `_{prefix}{h}x{w}` unless `size` equals `default`.
fn write_size_option(
    f: &mut fmt::Formatter<'_>,
    prefix: char,
    size: (usize, usize),
    default: (usize, usize),
) -> fmt::Result {
    if size == default {
        return Ok(());
    }
    write!(f, "{}{}{}x{}", OPTION_SEPARATOR, prefix, size.0, size.1)
}

/// Hands out the `SkipLayer_{n}` group names of one compilation pass, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCounter {
    next: usize,
}

impl Default for GroupCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl GroupCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_group(&mut self) -> String {
        let name = format!("SkipLayer_{}", self.next);
        self.next += 1;
        name
    }
}

/// Residual block: two convolutions with batch normalization, added to a 1x1 projection of
/// the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkipBlock {
    feature_width_1: usize,
    feature_width_2: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: Padding,
}

impl SkipBlock {
    /// 3x3 kernels, stride 1 and same padding.
    pub fn new(feature_width_1: usize, feature_width_2: usize) -> Self {
        Self {
            feature_width_1,
            feature_width_2,
            kernel: SKIP_KERNEL,
            stride: SKIP_STRIDE,
            padding: Padding::Same,
        }
    }

    pub fn with_kernel(mut self, kernel: (usize, usize)) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn feature_width_1(&self) -> usize {
        self.feature_width_1
    }

    /// Width of the block output, the shortcut is projected to it.
    pub fn feature_width_2(&self) -> usize {
        self.feature_width_2
    }

    pub fn kernel(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Adds the block under the next group name of `counter`.
    ///
    /// Conv1 -> BatchNorm1 -> ReLU1 -> Conv2 -> BatchNorm2, added to the Reshape projection of
    /// the input and activated by ReLU2. Each branch normalizes before it activates.
    pub fn render(
        &self,
        graph: &mut GraphBuilder,
        input: &TensorHandle,
        counter: &mut GroupCounter,
    ) -> EngineResult<TensorHandle> {
        let group = counter.next_group();
        debug!("Rendering {} as {}", self, group);
        let name = |op: &str| format!("{}/{}", group, op);

        let branch = graph.conv2d(
            &name("Conv1"),
            input,
            self.feature_width_1,
            self.kernel,
            self.stride,
            self.padding,
        )?;
        let branch = graph.batch_norm(&name("BatchNorm1"), &branch)?;
        let branch = graph.activation(&name("ReLU1"), &branch, Activation::Relu)?;
        let branch = graph.conv2d(
            &name("Conv2"),
            &branch,
            self.feature_width_2,
            self.kernel,
            self.stride,
            self.padding,
        )?;
        let branch = graph.batch_norm(&name("BatchNorm2"), &branch)?;

        let shortcut = graph.conv2d(
            &name("Reshape"),
            input,
            self.feature_width_2,
            (1, 1),
            self.stride,
            Padding::Valid,
        )?;

        let sum = graph.add(&name("Add"), &[&shortcut, &branch])?;
        graph.activation(&name("ReLU2"), &sum, Activation::Relu)
    }
}

impl fmt::Display for SkipBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.feature_width_1, self.feature_width_2)?;
        write_size_option(f, 'k', self.kernel, SKIP_KERNEL)?;
        write_size_option(f, 's', self.stride, SKIP_STRIDE)?;
        if self.padding != Padding::Same {
            write!(f, "{}{}", OPTION_SEPARATOR, self.padding.name())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolingType {
    Max,
    Mean,
}

impl PoolingType {
    pub const ALL: [PoolingType; 2] = [PoolingType::Max, PoolingType::Mean];

    pub fn name(&self) -> &'static str {
        match self {
            PoolingType::Max => "max",
            PoolingType::Mean => "mean",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl From<PoolingType> for PoolKind {
    fn from(kind: PoolingType) -> Self {
        match kind {
            PoolingType::Max => PoolKind::Max,
            PoolingType::Mean => PoolKind::Mean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolBlock {
    pooling_type: PoolingType,
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl PoolBlock {
    /// 2x2 windows with stride 2.
    pub fn new(pooling_type: PoolingType) -> Self {
        Self {
            pooling_type,
            kernel: POOL_WINDOW,
            stride: POOL_WINDOW,
        }
    }

    pub fn with_kernel(mut self, kernel: (usize, usize)) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn pooling_type(&self) -> PoolingType {
        self.pooling_type
    }

    pub fn kernel(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn render(
        &self,
        graph: &mut GraphBuilder,
        input: &TensorHandle,
    ) -> EngineResult<TensorHandle> {
        debug!("Rendering {} pooling", self);
        match self.pooling_type {
            PoolingType::Max => graph.max_pool2d(input, self.kernel, self.stride),
            PoolingType::Mean => graph.mean_pool2d(input, self.kernel, self.stride),
        }
    }
}

impl fmt::Display for PoolBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pooling_type.name())?;
        write_size_option(f, 'k', self.kernel, POOL_WINDOW)?;
        write_size_option(f, 's', self.stride, POOL_WINDOW)
    }
}

/// One unit of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerSpec {
    Skip(SkipBlock),
    Pool(PoolBlock),
}

impl LayerSpec {
    pub fn render(
        &self,
        graph: &mut GraphBuilder,
        input: &TensorHandle,
        counter: &mut GroupCounter,
    ) -> EngineResult<TensorHandle> {
        match self {
            LayerSpec::Skip(block) => block.render(graph, input, counter),
            LayerSpec::Pool(block) => block.render(graph, input),
        }
    }
}

/// The canonical token, `"32-64"` for skip blocks and the pooling name for pool blocks.
/// Parameters that differ from the defaults are appended as options, e.g. `"32-64_k5x5_valid"`
/// or `"max_s1x1"`.
impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSpec::Skip(block) => fmt::Display::fmt(block, f),
            LayerSpec::Pool(block) => fmt::Display::fmt(block, f),
        }
    }
}

impl From<SkipBlock> for LayerSpec {
    fn from(block: SkipBlock) -> Self {
        LayerSpec::Skip(block)
    }
}

impl From<PoolBlock> for LayerSpec {
    fn from(block: PoolBlock) -> Self {
        LayerSpec::Pool(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml::errors::EngineError;

    #[test]
    fn test_group_counter_starts_at_one() {
        let mut counter = GroupCounter::new();
        assert_eq!(counter.next_group(), "SkipLayer_1");
        assert_eq!(counter.next_group(), "SkipLayer_2");
    }

    #[test]
    fn test_tokens() {
        assert_eq!(SkipBlock::new(32, 64).to_string(), "32-64");
        assert_eq!(PoolBlock::new(PoolingType::Max).to_string(), "max");
        assert_eq!(LayerSpec::from(PoolBlock::new(PoolingType::Mean)).to_string(), "mean");
        let wide = SkipBlock::new(32, 64)
            .with_kernel((5, 5))
            .with_padding(Padding::Valid);
        assert_eq!(wide.to_string(), "32-64_k5x5_valid");
        assert_eq!(
            SkipBlock::new(8, 8).with_stride((2, 1)).to_string(),
            "8-8_s2x1"
        );
        let overlapping = PoolBlock::new(PoolingType::Max)
            .with_kernel((3, 3))
            .with_stride((1, 1));
        assert_eq!(overlapping.to_string(), "max_k3x3_s1x1");
        // Explicit defaults keep the plain token.
        assert_eq!(
            SkipBlock::new(32, 64).with_kernel((3, 3)).to_string(),
            "32-64"
        );
        assert_eq!(
            PoolBlock::new(PoolingType::Mean).with_stride((2, 2)).to_string(),
            "mean"
        );
    }

    #[test]
    fn test_pooling_type_names() {
        assert_eq!(PoolingType::from_name("max"), Some(PoolingType::Max));
        assert_eq!(PoolingType::from_name("mean"), Some(PoolingType::Mean));
        assert_eq!(PoolingType::from_name("avg"), None);
        assert_eq!(PoolKind::from(PoolingType::Mean), PoolKind::Mean);
    }

    #[test]
    fn test_skip_block_render() {
        let mut graph = GraphBuilder::new(0);
        let mut counter = GroupCounter::new();
        let input = graph.input(&[8, 8, 3]).unwrap();
        let output = SkipBlock::new(16, 32)
            .render(&mut graph, &input, &mut counter)
            .unwrap();
        assert_eq!(output.shape(), &[8, 8, 32]);

        let second = SkipBlock::new(8, 4)
            .render(&mut graph, &output, &mut counter)
            .unwrap();
        assert_eq!(second.shape(), &[8, 8, 4]);
        assert_eq!(counter.next_group(), "SkipLayer_3");

        let model = graph.build(&input, &second).unwrap();
        let names = model.node_names();
        for op in &[
            "Conv1",
            "BatchNorm1",
            "ReLU1",
            "Conv2",
            "BatchNorm2",
            "Reshape",
            "Add",
            "ReLU2",
        ] {
            assert!(names.contains(&format!("SkipLayer_1/{}", op).as_str()));
            assert!(names.contains(&format!("SkipLayer_2/{}", op).as_str()));
        }
    }

    #[test]
    fn test_valid_padding_skip_block_does_not_fit_its_shortcut() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[8, 8, 3]).unwrap();
        let result = SkipBlock::new(4, 4).with_padding(Padding::Valid).render(
            &mut graph,
            &input,
            &mut GroupCounter::new(),
        );
        assert!(matches!(
            result,
            Err(EngineError::IncompatibleShapes { op: "add", .. })
        ));
    }

    #[test]
    fn test_pool_block_halves_spatial_dims() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[28, 28, 4]).unwrap();
        let pooled = LayerSpec::from(PoolBlock::new(PoolingType::Max))
            .render(&mut graph, &input, &mut GroupCounter::new())
            .unwrap();
        assert_eq!(pooled.shape(), &[14, 14, 4]);
        let pooled = PoolBlock::new(PoolingType::Mean)
            .render(&mut graph, &pooled)
            .unwrap();
        assert_eq!(pooled.shape(), &[7, 7, 4]);

        let model = graph.build(&input, &pooled).unwrap();
        assert_eq!(model.node_names()[1..], ["MaxPool_1", "MeanPool_1"]);
    }
}
