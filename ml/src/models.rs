//! Executable models built by a [`crate::graph::GraphBuilder`].
//!
//! A model owns its nodes and parameters. After [`Model::compile`] binds an optimizer, a loss
//! and metrics, it can be trained with [`Model::fit`] and scored with [`Model::evaluate`].
use std::{collections::HashMap, fmt, path::Path};

use log::{debug, info};
use ndarray::*;
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::{
    callbacks::{Callback, Logs},
    errors::{EngineError, EngineResult},
    graph::{Node, Op, Parameter},
    losses::{Loss, Metric},
    normalization::BatchStatistics,
    optimizers::{Optimizer, OptimizerConfig},
    weight_loader::WeightFormat,
    ImagePrecision, WeightPrecision,
};

/// Batched activations, the first axis is the sample axis.
pub type InternalDataRepresentation = ArrayD<ImagePrecision>;

#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub batch_size: usize,
    pub epochs: usize,
    /// Fraction of samples, taken from the end, held out for validation.
    pub validation_split: f32,
    pub shuffle: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 1,
            validation_split: 0.,
            shuffle: true,
        }
    }
}

/// Epoch logs collected by [`Model::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub epochs: Vec<Logs>,
}

impl History {
    pub fn last(&self) -> Option<&Logs> {
        self.epochs.last()
    }

    /// Values of one key over all epochs.
    pub fn values(&self, key: &str) -> Vec<f32> {
        self.epochs
            .iter()
            .filter_map(|logs| logs.get(key).copied())
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Compilation {
    optimizer: Optimizer,
    loss: Loss,
    metrics: Vec<Metric>,
}

/// Values of one forward pass.
struct Trace {
    values: Vec<Option<InternalDataRepresentation>>,
    statistics: HashMap<usize, BatchStatistics>,
}

impl Trace {
    fn value(&self, id: usize) -> EngineResult<&InternalDataRepresentation> {
        self.values
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(EngineError::UnknownTensor(id))
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    nodes: Vec<Node>,
    parameters: Vec<Parameter>,
    input: usize,
    output: usize,
    /// Nodes the output depends on, in topological order.
    order: Vec<usize>,
    compilation: Option<Compilation>,
    rng: StdRng,
}

impl Model {
    pub(crate) fn new(
        nodes: Vec<Node>,
        parameters: Vec<Parameter>,
        input: usize,
        output: usize,
        order: Vec<usize>,
        rng: StdRng,
    ) -> Self {
        Self {
            nodes,
            parameters,
            input,
            output,
            order,
            compilation: None,
            rng,
        }
    }

    /// Binds optimizer, loss and metrics. Recompiling resets the optimizer state.
    pub fn compile(
        &mut self,
        optimizer: &OptimizerConfig,
        loss: Loss,
        metrics: &[Metric],
    ) -> EngineResult<()> {
        if self.output_shape().len() != 1 {
            return Err(EngineError::IncompatibleShapes {
                op: "compile",
                details: format!(
                    "{} expects one class score vector per sample, model outputs {:?}",
                    loss.name(),
                    self.output_shape()
                ),
            });
        }
        debug!(
            "Compiling with {} optimizer, {} loss and metrics {:?}",
            optimizer.name(),
            loss.name(),
            metrics.iter().map(Metric::name).collect::<Vec<_>>()
        );
        self.compilation = Some(Compilation {
            optimizer: Optimizer::new(optimizer.clone(), &self.parameters),
            loss,
            metrics: metrics.to_vec(),
        });
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.compilation.is_some()
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.nodes[self.input].shape
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.nodes[self.output].shape
    }

    /// Names of the executed nodes in execution order.
    pub fn node_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&id| self.nodes[id].name.as_str())
            .collect()
    }

    /// All weights by name, moving statistics included.
    pub fn weights(&self) -> impl Iterator<Item = (&str, &ArrayD<WeightPrecision>)> {
        self.parameters
            .iter()
            .map(|p| (p.name.as_str(), &p.value))
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.iter().map(|p| p.value.len()).sum()
    }

    pub fn trainable_parameter_count(&self) -> usize {
        self.parameters
            .iter()
            .filter(|p| p.trainable)
            .map(|p| p.value.len())
            .sum()
    }

    /// Number of optimizer steps taken since the last compile.
    pub fn iterations(&self) -> i32 {
        self.compilation
            .as_ref()
            .map_or(0, |compilation| compilation.optimizer.iterations())
    }

    /// Layer table in the style of keras' `model.summary()`, see the `Display` impl.
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// Runs the model in inference mode, batch by batch.
    pub fn predict(
        &self,
        x: &InternalDataRepresentation,
        batch_size: usize,
    ) -> EngineResult<InternalDataRepresentation> {
        self.check_inputs(x)?;
        let samples = x.len_of(Axis(0));
        if samples == 0 {
            return Err(EngineError::DataMismatch("no samples to predict".into()));
        }
        let outputs = batches(samples, batch_size)?
            .map(|range| {
                let batch = x.slice_axis(Axis(0), Slice::from(range)).to_owned();
                self.infer(&batch)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// Loss and metrics over the given samples, in inference mode.
    pub fn evaluate(
        &self,
        x: &InternalDataRepresentation,
        y: &[usize],
        batch_size: usize,
    ) -> EngineResult<Logs> {
        let compilation = self
            .compilation
            .as_ref()
            .ok_or(EngineError::NotCompiled("evaluate"))?;
        self.check_samples(x, y)?;
        let samples = y.len();
        let mut totals = vec![0.; compilation.metrics.len() + 1];
        for range in batches(samples, batch_size)? {
            let count = (range.end - range.start) as f32;
            let batch = x.slice_axis(Axis(0), Slice::from(range.clone())).to_owned();
            let predictions = self.infer(&batch)?.into_dimensionality::<Ix2>()?;
            let labels = &y[range];
            totals[0] += compilation.loss.compute(predictions.view(), labels)? * count;
            for (total, metric) in totals[1..].iter_mut().zip(&compilation.metrics) {
                *total += metric.compute(predictions.view(), labels)? * count;
            }
        }
        Ok(compilation.logs(&totals, samples as f32))
    }

    /// Trains the model. The trailing `validation_split` fraction of the samples is held out
    /// and scored after every epoch under `val_`-prefixed keys.
    pub fn fit(
        &mut self,
        x: &InternalDataRepresentation,
        y: &[usize],
        options: &FitOptions,
        callbacks: &mut [&mut dyn Callback],
    ) -> EngineResult<History> {
        if self.compilation.is_none() {
            return Err(EngineError::NotCompiled("fit"));
        }
        self.check_samples(x, y)?;
        if !(0. ..1.).contains(&options.validation_split) {
            return Err(EngineError::InvalidArgument {
                op: "fit",
                details: format!(
                    "validation split {} has to lie in [0, 1)",
                    options.validation_split
                ),
            });
        }
        let samples = y.len();
        let train_samples = (samples as f64 * (1. - options.validation_split as f64)) as usize;
        if train_samples == 0 {
            return Err(EngineError::DataMismatch(format!(
                "no training samples left out of {} after the validation split",
                samples
            )));
        }
        let x_val = x
            .slice_axis(Axis(0), Slice::from(train_samples..))
            .to_owned();
        let y_val = &y[train_samples..];
        info!(
            "Training on {} samples, validating on {} samples",
            train_samples,
            y_val.len()
        );

        for callback in callbacks.iter_mut() {
            callback.on_train_begin(self)?;
        }
        let mut history = History::default();
        for epoch in 0..options.epochs {
            for callback in callbacks.iter_mut() {
                callback.on_epoch_begin(epoch)?;
            }

            let mut indices: Vec<usize> = (0..train_samples).collect();
            if options.shuffle {
                indices.shuffle(&mut self.rng);
            }
            let mut totals = vec![];
            let mut seen = 0.;
            let mut logs = Logs::new();
            for (batch, range) in batches(train_samples, options.batch_size)?.enumerate() {
                let batch_indices = &indices[range];
                let batch_x = x.select(Axis(0), batch_indices);
                let batch_y: Vec<usize> = batch_indices.iter().map(|&i| y[i]).collect();
                let step = self.train_step(&batch_x, &batch_y)?;

                let count = batch_y.len() as f32;
                totals.resize(step.len(), 0.);
                for (total, value) in totals.iter_mut().zip(&step) {
                    *total += value * count;
                }
                seen += count;
                logs = self.compilation()?.logs(&totals, seen);
                for callback in callbacks.iter_mut() {
                    callback.on_batch_end(batch, &logs)?;
                }
            }

            if !y_val.is_empty() {
                let val_logs = self.evaluate(&x_val, y_val, options.batch_size)?;
                logs.extend(
                    val_logs
                        .into_iter()
                        .map(|(key, value)| (format!("val_{}", key), value)),
                );
            }
            info!("Epoch {}/{}: {}", epoch + 1, options.epochs, format_logs(&logs));
            for callback in callbacks.iter_mut() {
                callback.on_epoch_end(epoch, &logs, self)?;
            }
            history.epochs.push(logs);
        }
        for callback in callbacks.iter_mut() {
            callback.on_train_end(history.last())?;
        }
        Ok(history)
    }

    /// Writes every parameter, moving statistics included.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P, format: WeightFormat) -> EngineResult<()> {
        let weights: Vec<_> = self.weights().collect();
        format.save(&path, &weights)?;
        debug!("Saved {} weights to {}", weights.len(), path.as_ref().display());
        Ok(())
    }

    /// Restores every parameter. Fails without modifying the model if a weight is missing
    /// or has the wrong shape.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P, format: WeightFormat) -> EngineResult<()> {
        let mut loader = format.loader(&path)?;
        let values = self
            .parameters
            .iter()
            .map(|p| loader.get_weight(&p.name, p.value.shape()))
            .collect::<Result<Vec<_>, _>>()?;
        for (parameter, value) in self.parameters.iter_mut().zip(values) {
            parameter.value = value;
        }
        info!("Loaded weights from {}", path.as_ref().display());
        Ok(())
    }

    fn compilation(&self) -> EngineResult<&Compilation> {
        self.compilation
            .as_ref()
            .ok_or(EngineError::NotCompiled("fit"))
    }

    fn check_inputs(&self, x: &InternalDataRepresentation) -> EngineResult<()> {
        if x.ndim() == 0 || &x.shape()[1..] != self.input_shape() {
            return Err(EngineError::DataMismatch(format!(
                "expected samples of shape {:?}, got a batch of shape {:?}",
                self.input_shape(),
                x.shape()
            )));
        }
        Ok(())
    }

    fn check_samples(&self, x: &InternalDataRepresentation, y: &[usize]) -> EngineResult<()> {
        self.check_inputs(x)?;
        if x.len_of(Axis(0)) != y.len() {
            return Err(EngineError::DataMismatch(format!(
                "{} samples but {} labels",
                x.len_of(Axis(0)),
                y.len()
            )));
        }
        if y.is_empty() {
            return Err(EngineError::DataMismatch("no samples".into()));
        }
        Ok(())
    }

    fn infer(&self, x: &InternalDataRepresentation) -> EngineResult<InternalDataRepresentation> {
        let mut trace = self.forward(x, false)?;
        trace.values[self.output]
            .take()
            .ok_or(EngineError::UnknownTensor(self.output))
    }

    /// One optimizer step on one batch, returns the loss followed by the metrics.
    fn train_step(&mut self, x: &InternalDataRepresentation, y: &[usize]) -> EngineResult<Vec<f32>> {
        let trace = self.forward(x, true)?;
        let predictions = trace
            .value(self.output)?
            .view()
            .into_dimensionality::<Ix2>()?;

        let compilation = self.compilation()?;
        let mut step = vec![compilation.loss.compute(predictions, y)?];
        for metric in &compilation.metrics {
            step.push(metric.compute(predictions, y)?);
        }
        let grad = compilation.loss.gradient(predictions, y)?;
        let gradients = self.backward(&trace, grad.into_dyn())?;

        let compilation = self
            .compilation
            .as_mut()
            .ok_or(EngineError::NotCompiled("fit"))?;
        compilation.optimizer.apply(&mut self.parameters, gradients)?;
        self.update_moving_statistics(&trace);
        Ok(step)
    }

    fn forward(&self, x: &InternalDataRepresentation, training: bool) -> EngineResult<Trace> {
        self.check_inputs(x)?;
        let mut trace = Trace {
            values: vec![None; self.nodes.len()],
            statistics: HashMap::new(),
        };
        for &id in &self.order {
            let node = &self.nodes[id];
            let value = match &node.op {
                Op::Input => x.clone(),
                Op::Conv2d {
                    layer,
                    kernel,
                    bias,
                } => {
                    let input = trace.value(node.inputs[0])?.view().into_dimensionality::<Ix4>()?;
                    layer
                        .convolve(input, self.view4(*kernel)?, self.view1(*bias)?)?
                        .into_dyn()
                }
                Op::BatchNorm {
                    layer,
                    gamma,
                    beta,
                    moving_mean,
                    moving_variance,
                } => {
                    let input = trace.value(node.inputs[0])?;
                    if training {
                        let (normalized, statistics) = layer.normalize_training(
                            input,
                            self.view1(*gamma)?,
                            self.view1(*beta)?,
                        )?;
                        trace.statistics.insert(id, statistics);
                        normalized
                    } else {
                        layer.normalize_inference(
                            input,
                            self.view1(*gamma)?,
                            self.view1(*beta)?,
                            self.view1(*moving_mean)?,
                            self.view1(*moving_variance)?,
                        )?
                    }
                }
                Op::Activation(activation) => activation.activate(trace.value(node.inputs[0])?)?,
                Op::Add => {
                    let mut sum = trace.value(node.inputs[0])?.clone();
                    for &other in &node.inputs[1..] {
                        sum += trace.value(other)?;
                    }
                    sum
                }
                Op::Pool(layer) => {
                    let input = trace.value(node.inputs[0])?.view().into_dimensionality::<Ix4>()?;
                    layer.pool(input)?.into_dyn()
                }
                Op::Flatten => {
                    let input = trace.value(node.inputs[0])?;
                    let samples = input.len_of(Axis(0));
                    let shape = IxDyn(&[samples, node.shape[0]]);
                    input.as_standard_layout().into_owned().into_shape(shape)?
                }
                Op::Dense {
                    layer,
                    kernel,
                    bias,
                } => {
                    let input = trace.value(node.inputs[0])?.view().into_dimensionality::<Ix2>()?;
                    layer
                        .forward_pass(input, self.view2(*kernel)?, self.view1(*bias)?)?
                        .into_dyn()
                }
            };
            trace.values[id] = Some(value);
        }
        Ok(trace)
    }

    /// Gradients of all parameters, given the gradient of the output.
    fn backward(
        &self,
        trace: &Trace,
        grad_output: InternalDataRepresentation,
    ) -> EngineResult<Vec<Option<ArrayD<WeightPrecision>>>> {
        let mut grads: Vec<Option<InternalDataRepresentation>> = vec![None; self.nodes.len()];
        let mut param_grads = vec![None; self.parameters.len()];
        grads[self.output] = Some(grad_output);

        for &id in self.order.iter().rev() {
            let grad = match grads[id].take() {
                Some(grad) => grad,
                None => continue,
            };
            let node = &self.nodes[id];
            match &node.op {
                Op::Input => {}
                Op::Conv2d {
                    layer,
                    kernel,
                    bias,
                } => {
                    let input = trace.value(node.inputs[0])?.view().into_dimensionality::<Ix4>()?;
                    let (grad_input, grad_kernel, grad_bias) = layer.backward(
                        input,
                        self.view4(*kernel)?,
                        grad.view().into_dimensionality::<Ix4>()?,
                    )?;
                    accumulate(&mut grads[node.inputs[0]], grad_input.into_dyn());
                    accumulate(&mut param_grads[*kernel], grad_kernel.into_dyn());
                    accumulate(&mut param_grads[*bias], grad_bias.into_dyn());
                }
                Op::BatchNorm {
                    layer, gamma, beta, ..
                } => {
                    let statistics = trace
                        .statistics
                        .get(&id)
                        .ok_or_else(|| EngineError::InvalidArgument {
                            op: "backward",
                            details: format!("no batch statistics recorded for {}", node.name),
                        })?;
                    let (grad_input, grad_gamma, grad_beta) = layer.backward(
                        trace.value(node.inputs[0])?,
                        self.view1(*gamma)?,
                        statistics,
                        &grad,
                    )?;
                    accumulate(&mut grads[node.inputs[0]], grad_input);
                    accumulate(&mut param_grads[*gamma], grad_gamma.into_dyn());
                    accumulate(&mut param_grads[*beta], grad_beta.into_dyn());
                }
                Op::Activation(activation) => {
                    let grad_input = activation.backward(trace.value(id)?, &grad)?;
                    accumulate(&mut grads[node.inputs[0]], grad_input);
                }
                Op::Add => {
                    for &input in &node.inputs {
                        accumulate(&mut grads[input], grad.clone());
                    }
                }
                Op::Pool(layer) => {
                    let input = trace.value(node.inputs[0])?.view().into_dimensionality::<Ix4>()?;
                    let grad_input =
                        layer.backward(input, grad.view().into_dimensionality::<Ix4>()?)?;
                    accumulate(&mut grads[node.inputs[0]], grad_input.into_dyn());
                }
                Op::Flatten => {
                    let input_shape = trace.value(node.inputs[0])?.raw_dim();
                    let grad_input = grad.as_standard_layout().into_owned().into_shape(input_shape)?;
                    accumulate(&mut grads[node.inputs[0]], grad_input);
                }
                Op::Dense {
                    layer,
                    kernel,
                    bias,
                } => {
                    let input = trace.value(node.inputs[0])?.view().into_dimensionality::<Ix2>()?;
                    let output = trace.value(id)?.view().into_dimensionality::<Ix2>()?;
                    let (grad_input, grad_kernel, grad_bias) = layer.backward(
                        input,
                        output,
                        self.view2(*kernel)?,
                        grad.view().into_dimensionality::<Ix2>()?,
                    )?;
                    accumulate(&mut grads[node.inputs[0]], grad_input.into_dyn());
                    accumulate(&mut param_grads[*kernel], grad_kernel.into_dyn());
                    accumulate(&mut param_grads[*bias], grad_bias.into_dyn());
                }
            }
        }
        Ok(param_grads)
    }

    fn update_moving_statistics(&mut self, trace: &Trace) {
        for (id, statistics) in &trace.statistics {
            if let Op::BatchNorm {
                layer,
                moving_mean,
                moving_variance,
                ..
            } = &self.nodes[*id].op
            {
                layer.update_moving(&mut self.parameters[*moving_mean].value, &statistics.mean);
                layer.update_moving(
                    &mut self.parameters[*moving_variance].value,
                    &statistics.variance,
                );
            }
        }
    }

    fn view1(&self, parameter: usize) -> EngineResult<ArrayView1<WeightPrecision>> {
        Ok(self.parameters[parameter]
            .value
            .view()
            .into_dimensionality::<Ix1>()?)
    }

    fn view2(&self, parameter: usize) -> EngineResult<ArrayView2<WeightPrecision>> {
        Ok(self.parameters[parameter]
            .value
            .view()
            .into_dimensionality::<Ix2>()?)
    }

    fn view4(&self, parameter: usize) -> EngineResult<ArrayView4<WeightPrecision>> {
        Ok(self.parameters[parameter]
            .value
            .view()
            .into_dimensionality::<Ix4>()?)
    }
}

impl Compilation {
    /// Turns running totals (loss first, then metrics) into averaged logs.
    fn logs(&self, totals: &[f32], count: f32) -> Logs {
        std::iter::once("loss")
            .chain(self.metrics.iter().map(Metric::name))
            .zip(totals)
            .map(|(key, total)| (key.to_string(), total / count))
            .collect()
    }
}

fn accumulate(slot: &mut Option<InternalDataRepresentation>, grad: InternalDataRepresentation) {
    *slot = Some(match slot.take() {
        Some(existing) => existing + &grad,
        None => grad,
    });
}

/// Consecutive index ranges of at most `batch_size` samples.
fn batches(
    samples: usize,
    batch_size: usize,
) -> EngineResult<impl Iterator<Item = std::ops::Range<usize>>> {
    if batch_size == 0 {
        return Err(EngineError::InvalidArgument {
            op: "batching",
            details: "batch size has to be positive".into(),
        });
    }
    Ok((0..samples)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(samples)))
}

/// Layer table in the style of keras' `model.summary()`.
impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "_".repeat(78);
        writeln!(f, "{}", rule)?;
        writeln!(
            f,
            "{:<40}{:<26}{:>12}",
            "Layer (type)", "Output Shape", "Param #"
        )?;
        writeln!(f, "{}", "=".repeat(78))?;
        for &id in &self.order {
            let node = &self.nodes[id];
            let params: usize = node
                .op
                .parameters()
                .iter()
                .map(|&p| self.parameters[p].value.len())
                .sum();
            let shape = std::iter::once("None".to_string())
                .chain(node.shape.iter().map(|d| d.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "{:<40}{:<26}{:>12}",
                format!("{} ({})", node.name, node.op.type_name()),
                format!("({})", shape),
                params
            )?;
        }
        writeln!(f, "{}", "=".repeat(78))?;
        let total = self.parameter_count();
        let trainable = self.trainable_parameter_count();
        writeln!(f, "Total params: {}", total)?;
        writeln!(f, "Trainable params: {}", trainable)?;
        writeln!(f, "Non-trainable params: {}", total - trainable)?;
        write!(f, "{}", rule)
    }
}


pub fn format_logs(logs: &Logs) -> String {
    logs.iter()
        .map(|(key, value)| format!("{}: {:.4}", key, value))
        .collect::<Vec<_>>()
        .join(" - ")
}
