//! Construction of named computation graphs.
//!
//! A [`GraphBuilder`] hands out [`TensorHandle`]s for every node it creates. Shapes are
//! inferred per sample in channels-last layout (height x width x channels), so a handle
//! never carries the batch dimension. Node names are unique within one builder.
use std::collections::{HashMap, HashSet};

use log::debug;
use ndarray::ArrayD;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    activation_functions::Activation,
    convolutions::{ConvolutionLayer, Padding},
    errors::{EngineError, EngineResult},
    fully_connected::FeedforwardLayer,
    models::Model,
    normalization::BatchNormLayer,
    pooling::{PoolKind, PoolingLayer},
    WeightPrecision,
};

/// Symbolic output of a graph node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHandle {
    id: usize,
    shape: Vec<usize>,
}

impl TensorHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Per-sample shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Input,
    Conv2d {
        layer: ConvolutionLayer,
        kernel: usize,
        bias: usize,
    },
    BatchNorm {
        layer: BatchNormLayer,
        gamma: usize,
        beta: usize,
        moving_mean: usize,
        moving_variance: usize,
    },
    Activation(Activation),
    Add,
    Pool(PoolingLayer),
    Flatten,
    Dense {
        layer: FeedforwardLayer,
        kernel: usize,
        bias: usize,
    },
}

impl Op {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Op::Input => "InputLayer",
            Op::Conv2d { .. } => "Conv2D",
            Op::BatchNorm { .. } => "BatchNormalization",
            Op::Activation(_) => "Activation",
            Op::Add => "Add",
            Op::Pool(layer) => match layer.kind() {
                PoolKind::Max => "MaxPooling2D",
                PoolKind::Mean => "AveragePooling2D",
            },
            Op::Flatten => "Flatten",
            Op::Dense { .. } => "Dense",
        }
    }

    /// Indices of the parameters owned by this op.
    pub(crate) fn parameters(&self) -> Vec<usize> {
        match self {
            Op::Conv2d { kernel, bias, .. } | Op::Dense { kernel, bias, .. } => {
                vec![*kernel, *bias]
            }
            Op::BatchNorm {
                gamma,
                beta,
                moving_mean,
                moving_variance,
                ..
            } => vec![*gamma, *beta, *moving_mean, *moving_variance],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) op: Op,
    pub(crate) inputs: Vec<usize>,
    pub(crate) shape: Vec<usize>,
}

/// Weight tensor of the graph. Moving statistics are stored as non-trainable parameters.
#[derive(Debug, Clone)]
pub(crate) struct Parameter {
    pub(crate) name: String,
    pub(crate) value: ArrayD<WeightPrecision>,
    pub(crate) trainable: bool,
}

pub struct GraphBuilder {
    nodes: Vec<Node>,
    parameters: Vec<Parameter>,
    names: HashSet<String>,
    prefix_counters: HashMap<String, usize>,
    rng: StdRng,
}

impl GraphBuilder {
    /// The seed drives weight initialization and, later on, shuffling during training.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            parameters: Vec::new(),
            names: HashSet::new(),
            prefix_counters: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns `{prefix}_{n}` with the smallest `n >= 1` not handed out for this prefix yet
    /// and not used by any node.
    pub fn unique_name(&mut self, prefix: &str) -> String {
        let counter = self.prefix_counters.entry(prefix.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}_{}", prefix, counter);
            if !self.names.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Placeholder for a batch of samples of the given per-sample shape.
    pub fn input(&mut self, shape: &[usize]) -> EngineResult<TensorHandle> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(EngineError::InvalidArgument {
                op: "input",
                details: format!("shape {:?} has to be non-empty and positive", shape),
            });
        }
        let name = self.unique_name("Input");
        self.push_node(name, Op::Input, vec![], shape.to_vec())
    }

    pub fn conv2d(
        &mut self,
        name: &str,
        input: &TensorHandle,
        filters: usize,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
    ) -> EngineResult<TensorHandle> {
        self.check_handle(input)?;
        if filters == 0 || kernel_size.0 == 0 || kernel_size.1 == 0 {
            return Err(EngineError::InvalidArgument {
                op: "conv2d",
                details: format!(
                    "{}: filters and kernel size have to be positive, got {} and {:?}",
                    name, filters, kernel_size
                ),
            });
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(EngineError::InvalidArgument {
                op: "conv2d",
                details: format!("{}: stride {:?} has to be positive", name, stride),
            });
        }
        let (height, width, channels) = spatial(input, "conv2d")?;
        let layer = ConvolutionLayer::new(kernel_size, stride, padding);
        let (new_h, new_w) =
            layer
                .output_size(height, width)
                .ok_or_else(|| EngineError::IncompatibleShapes {
                    op: "conv2d",
                    details: format!(
                        "{}: kernel {:?} does not fit into input {:?}",
                        name,
                        kernel_size,
                        input.shape()
                    ),
                })?;

        self.check_name(name)?;
        let fan_in = kernel_size.0 * kernel_size.1 * channels;
        let fan_out = kernel_size.0 * kernel_size.1 * filters;
        let kernel = self.glorot_uniform(
            &format!("{}/kernel", name),
            &[kernel_size.0, kernel_size.1, channels, filters],
            fan_in,
            fan_out,
        );
        let bias = self.constant(&format!("{}/bias", name), filters, 0., true);
        self.push_node(
            name.to_string(),
            Op::Conv2d {
                layer,
                kernel,
                bias,
            },
            vec![input.id],
            vec![new_h, new_w, filters],
        )
    }

    /// Normalizes over the last axis.
    pub fn batch_norm(&mut self, name: &str, input: &TensorHandle) -> EngineResult<TensorHandle> {
        self.check_handle(input)?;
        self.check_name(name)?;
        let channels = input.shape.last().copied().unwrap_or(1);
        let gamma = self.constant(&format!("{}/gamma", name), channels, 1., true);
        let beta = self.constant(&format!("{}/beta", name), channels, 0., true);
        let moving_mean = self.constant(&format!("{}/moving_mean", name), channels, 0., false);
        let moving_variance =
            self.constant(&format!("{}/moving_variance", name), channels, 1., false);
        self.push_node(
            name.to_string(),
            Op::BatchNorm {
                layer: BatchNormLayer::default(),
                gamma,
                beta,
                moving_mean,
                moving_variance,
            },
            vec![input.id],
            input.shape.clone(),
        )
    }

    pub fn activation(
        &mut self,
        name: &str,
        input: &TensorHandle,
        activation: Activation,
    ) -> EngineResult<TensorHandle> {
        self.check_handle(input)?;
        self.check_name(name)?;
        self.push_node(
            name.to_string(),
            Op::Activation(activation),
            vec![input.id],
            input.shape.clone(),
        )
    }

    /// Element-wise sum, all inputs have to share one shape.
    pub fn add(&mut self, name: &str, inputs: &[&TensorHandle]) -> EngineResult<TensorHandle> {
        let first = inputs.first().ok_or_else(|| EngineError::InvalidArgument {
            op: "add",
            details: format!("{}: at least one input is required", name),
        })?;
        for input in inputs {
            self.check_handle(input)?;
            if input.shape != first.shape {
                return Err(EngineError::IncompatibleShapes {
                    op: "add",
                    details: format!(
                        "{}: cannot add {:?} and {:?}",
                        name, first.shape, input.shape
                    ),
                });
            }
        }
        self.check_name(name)?;
        self.push_node(
            name.to_string(),
            Op::Add,
            inputs.iter().map(|input| input.id).collect(),
            first.shape.clone(),
        )
    }

    /// Pooling with valid padding.
    pub fn pool2d(
        &mut self,
        name: &str,
        input: &TensorHandle,
        kind: PoolKind,
        pool_size: (usize, usize),
        stride: (usize, usize),
    ) -> EngineResult<TensorHandle> {
        self.check_handle(input)?;
        if pool_size.0 == 0 || pool_size.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(EngineError::InvalidArgument {
                op: "pool2d",
                details: format!(
                    "{}: pool size {:?} and stride {:?} have to be positive",
                    name, pool_size, stride
                ),
            });
        }
        let (height, width, channels) = spatial(input, "pool2d")?;
        let layer = PoolingLayer::new(kind, pool_size, stride);
        let (new_h, new_w) =
            layer
                .output_size(height, width)
                .ok_or_else(|| EngineError::IncompatibleShapes {
                    op: "pool2d",
                    details: format!(
                        "{}: window {:?} does not fit into input {:?}",
                        name,
                        pool_size,
                        input.shape()
                    ),
                })?;
        self.check_name(name)?;
        self.push_node(
            name.to_string(),
            Op::Pool(layer),
            vec![input.id],
            vec![new_h, new_w, channels],
        )
    }

    /// Max pooling under a generated `MaxPool_{n}` name.
    pub fn max_pool2d(
        &mut self,
        input: &TensorHandle,
        pool_size: (usize, usize),
        stride: (usize, usize),
    ) -> EngineResult<TensorHandle> {
        let name = self.unique_name("MaxPool");
        self.pool2d(&name, input, PoolKind::Max, pool_size, stride)
    }

    /// Mean pooling under a generated `MeanPool_{n}` name.
    pub fn mean_pool2d(
        &mut self,
        input: &TensorHandle,
        pool_size: (usize, usize),
        stride: (usize, usize),
    ) -> EngineResult<TensorHandle> {
        let name = self.unique_name("MeanPool");
        self.pool2d(&name, input, PoolKind::Mean, pool_size, stride)
    }

    pub fn flatten(&mut self, name: &str, input: &TensorHandle) -> EngineResult<TensorHandle> {
        self.check_handle(input)?;
        self.check_name(name)?;
        let size = input.shape.iter().product();
        self.push_node(name.to_string(), Op::Flatten, vec![input.id], vec![size])
    }

    /// Fully connected layer with a fused activation, expects a flat input.
    pub fn dense(
        &mut self,
        name: &str,
        input: &TensorHandle,
        units: usize,
        activation: Activation,
    ) -> EngineResult<TensorHandle> {
        self.check_handle(input)?;
        if input.shape.len() != 1 {
            return Err(EngineError::IncompatibleShapes {
                op: "dense",
                details: format!(
                    "{}: expected a flat input, got {:?}. Flatten it first.",
                    name, input.shape
                ),
            });
        }
        if units == 0 {
            return Err(EngineError::InvalidArgument {
                op: "dense",
                details: format!("{}: units have to be positive", name),
            });
        }
        self.check_name(name)?;
        let features = input.shape[0];
        let kernel = self.glorot_uniform(
            &format!("{}/kernel", name),
            &[features, units],
            features,
            units,
        );
        let bias = self.constant(&format!("{}/bias", name), units, 0., true);
        self.push_node(
            name.to_string(),
            Op::Dense {
                layer: FeedforwardLayer::new(units, activation),
                kernel,
                bias,
            },
            vec![input.id],
            vec![units],
        )
    }

    /// Finalizes the graph between `input` and `output`. Nodes the output does not depend on
    /// are not executed.
    pub fn build(self, input: &TensorHandle, output: &TensorHandle) -> EngineResult<Model> {
        self.check_handle(input)?;
        self.check_handle(output)?;
        if !matches!(self.nodes[input.id].op, Op::Input) {
            return Err(EngineError::InvalidArgument {
                op: "build",
                details: format!("{} is not an input node", self.nodes[input.id].name),
            });
        }

        let mut needed = vec![false; self.nodes.len()];
        let mut stack = vec![output.id];
        while let Some(id) = stack.pop() {
            if needed[id] {
                continue;
            }
            needed[id] = true;
            stack.extend(self.nodes[id].inputs.iter().copied());
        }
        if !needed[input.id] {
            return Err(EngineError::InvalidArgument {
                op: "build",
                details: format!(
                    "{} does not depend on {}",
                    self.nodes[output.id].name, self.nodes[input.id].name
                ),
            });
        }
        if let Some(other) = (0..self.nodes.len())
            .find(|&id| needed[id] && id != input.id && matches!(self.nodes[id].op, Op::Input))
        {
            return Err(EngineError::InvalidArgument {
                op: "build",
                details: format!("graph depends on a second input {}", self.nodes[other].name),
            });
        }

        // Nodes are created after their inputs, so creation order is a topological order.
        let order = (0..self.nodes.len()).filter(|&id| needed[id]).collect();
        Ok(Model::new(
            self.nodes,
            self.parameters,
            input.id,
            output.id,
            order,
            self.rng,
        ))
    }

    fn check_handle(&self, handle: &TensorHandle) -> EngineResult<()> {
        match self.nodes.get(handle.id) {
            Some(node) if node.shape == handle.shape => Ok(()),
            _ => Err(EngineError::UnknownTensor(handle.id)),
        }
    }

    fn check_name(&self, name: &str) -> EngineResult<()> {
        if self.names.contains(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn push_node(
        &mut self,
        name: String,
        op: Op,
        inputs: Vec<usize>,
        shape: Vec<usize>,
    ) -> EngineResult<TensorHandle> {
        self.check_name(&name)?;
        debug!("{} ({}) -> {:?}", name, op.type_name(), shape);
        let id = self.nodes.len();
        self.names.insert(name.clone());
        self.nodes.push(Node {
            name,
            op,
            inputs,
            shape: shape.clone(),
        });
        Ok(TensorHandle { id, shape })
    }

    fn glorot_uniform(
        &mut self,
        name: &str,
        shape: &[usize],
        fan_in: usize,
        fan_out: usize,
    ) -> usize {
        let limit = (6. / (fan_in + fan_out) as WeightPrecision).sqrt();
        let rng = &mut self.rng;
        let value = ArrayD::from_shape_simple_fn(shape, || rng.gen_range(-limit..limit));
        self.push_parameter(name, value, true)
    }

    fn constant(
        &mut self,
        name: &str,
        size: usize,
        value: WeightPrecision,
        trainable: bool,
    ) -> usize {
        self.push_parameter(name, ArrayD::from_elem(vec![size], value), trainable)
    }

    fn push_parameter(
        &mut self,
        name: &str,
        value: ArrayD<WeightPrecision>,
        trainable: bool,
    ) -> usize {
        self.parameters.push(Parameter {
            name: name.to_string(),
            value,
            trainable,
        });
        self.parameters.len() - 1
    }
}

fn spatial(input: &TensorHandle, op: &'static str) -> EngineResult<(usize, usize, usize)> {
    match input.shape() {
        &[height, width, channels] => Ok((height, width, channels)),
        other => Err(EngineError::IncompatibleShapes {
            op,
            details: format!("expected a (height, width, channels) input, got {:?}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_inference() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[8, 8, 3]).unwrap();
        let same = graph
            .conv2d("same", &input, 4, (3, 3), (1, 1), Padding::Same)
            .unwrap();
        assert_eq!(same.shape(), &[8, 8, 4]);
        let valid = graph
            .conv2d("valid", &same, 2, (3, 3), (1, 1), Padding::Valid)
            .unwrap();
        assert_eq!(valid.shape(), &[6, 6, 2]);
        let strided = graph
            .conv2d("strided", &same, 2, (1, 1), (2, 2), Padding::Valid)
            .unwrap();
        assert_eq!(strided.shape(), &[4, 4, 2]);
        let pooled = graph.max_pool2d(&valid, (2, 2), (2, 2)).unwrap();
        assert_eq!(pooled.shape(), &[3, 3, 2]);
        let flat = graph.flatten("flatten", &pooled).unwrap();
        assert_eq!(flat.shape(), &[18]);
        let dense = graph
            .dense("dense", &flat, 5, Activation::Softmax)
            .unwrap();
        assert_eq!(dense.shape(), &[5]);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[4, 4, 1]).unwrap();
        graph
            .conv2d("conv", &input, 2, (3, 3), (1, 1), Padding::Same)
            .unwrap();
        let err = graph
            .conv2d("conv", &input, 2, (3, 3), (1, 1), Padding::Same)
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateName(name) if name == "conv"));
    }

    #[test]
    fn test_unique_names_skip_taken_ones() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[4, 4, 1]).unwrap();
        graph.batch_norm("MaxPool_1", &input).unwrap();
        let pooled = graph.max_pool2d(&input, (2, 2), (2, 2)).unwrap();
        assert_eq!(graph.nodes[pooled.id()].name, "MaxPool_2");
        assert_eq!(graph.unique_name("MeanPool"), "MeanPool_1");
        assert_eq!(graph.unique_name("MeanPool"), "MeanPool_2");
    }

    #[test]
    fn test_add_requires_matching_shapes() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[4, 4, 1]).unwrap();
        let a = graph
            .conv2d("a", &input, 2, (3, 3), (1, 1), Padding::Same)
            .unwrap();
        let b = graph
            .conv2d("b", &input, 3, (3, 3), (1, 1), Padding::Same)
            .unwrap();
        assert!(matches!(
            graph.add("sum", &[&a, &b]),
            Err(EngineError::IncompatibleShapes { op: "add", .. })
        ));
        assert!(graph.add("empty", &[]).is_err());
    }

    #[test]
    fn test_kernel_too_large() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[2, 2, 1]).unwrap();
        assert!(graph
            .conv2d("conv", &input, 1, (3, 3), (1, 1), Padding::Valid)
            .is_err());
        assert!(graph.max_pool2d(&input, (3, 3), (1, 1)).is_err());
    }

    #[test]
    fn test_dense_requires_flat_input() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[2, 2, 1]).unwrap();
        assert!(graph.dense("dense", &input, 3, Activation::Linear).is_err());
    }

    #[test]
    fn test_foreign_handles_are_rejected() {
        let mut graph = GraphBuilder::new(0);
        let mut other = GraphBuilder::new(0);
        let input = graph.input(&[4, 4, 1]).unwrap();
        other.input(&[2, 2, 1]).unwrap();
        let foreign = other.flatten("flat", &input);
        assert!(matches!(foreign, Err(EngineError::UnknownTensor(_))));
        let stranger = TensorHandle {
            id: 7,
            shape: vec![1],
        };
        assert!(graph.flatten("flat", &stranger).is_err());
    }

    #[test]
    fn test_parameter_initialization() {
        let mut graph = GraphBuilder::new(3);
        let input = graph.input(&[4, 4, 2]).unwrap();
        graph
            .conv2d("conv", &input, 3, (3, 3), (1, 1), Padding::Same)
            .unwrap();
        let normalized = graph.batch_norm("bn", &input).unwrap();
        assert_eq!(normalized.shape(), &[4, 4, 2]);

        let kernel = &graph.parameters[0];
        assert_eq!(kernel.name, "conv/kernel");
        assert_eq!(kernel.value.shape(), &[3, 3, 2, 3]);
        let limit = (6f32 / (18 + 27) as f32).sqrt();
        assert!(kernel.value.iter().all(|w| w.abs() <= limit));
        assert!(kernel.value.iter().any(|&w| w != 0.));
        assert!(graph.parameters[1].value.iter().all(|&b| b == 0.));

        let names: Vec<&str> = graph.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names[2..],
            [
                "bn/gamma",
                "bn/beta",
                "bn/moving_mean",
                "bn/moving_variance"
            ]
        );
        assert!(!graph.parameters[4].trainable);
        assert!(graph.parameters[5].value.iter().all(|&v| v == 1.));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let build = || {
            let mut graph = GraphBuilder::new(11);
            let input = graph.input(&[3, 3, 1]).unwrap();
            graph
                .conv2d("conv", &input, 2, (3, 3), (1, 1), Padding::Same)
                .unwrap();
            graph.parameters[0].value.clone()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_build_requires_connected_input() {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[4, 4, 1]).unwrap();
        let second = graph.input(&[4, 4, 1]).unwrap();
        let flat = graph.flatten("flat", &second).unwrap();
        assert!(graph.build(&input, &flat).is_err());
    }
}
