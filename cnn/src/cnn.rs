//! The model builder: compiles a topology into one executable model and trains or restores
//! it under the directories addressed by the topology identity.
use std::{fmt, path::PathBuf};

use log::info;
use ml::{
    activation_functions::Activation,
    callbacks::{Callback, Logs, ModelCheckpoint, MonitorMode, TrainingLog, UpdateFreq},
    errors::EngineResult,
    graph::{GraphBuilder, TensorHandle},
    models::{FitOptions, History, Model},
};

use crate::{
    codec::Topology,
    config::CnnConfig,
    dataset::Dataset,
    errors::{CnnError, CnnResult},
    layers::GroupCounter,
};

/// Maps the last topology tensor to the model output, e.g. [`classification_head`].
pub type OutputHead = Box<dyn Fn(&mut GraphBuilder, &TensorHandle) -> EngineResult<TensorHandle>>;

/// Directory name used for the empty topology, whose identity is the empty string.
/// It cannot be confused with a real identity as it is not a valid token.
const EMPTY_TOPOLOGY_KEY: &str = "empty";

/// Checkpoints are only written when this value improves.
const MONITOR: &str = "val_accuracy";

enum BuilderState {
    Uninitialized,
    Compiled(Model),
}

/// Result of [`Cnn::train`].
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// An earlier checkpoint was loaded from this path instead of training.
    Restored(PathBuf),
    Trained(History),
}

pub struct Cnn {
    input_shape: Vec<usize>,
    head: OutputHead,
    topology: Topology,
    config: CnnConfig,
    identity: String,
    state: BuilderState,
}

impl Cnn {
    pub fn new<F>(input_shape: &[usize], head: F, topology: Topology, config: CnnConfig) -> Self
    where
        F: Fn(&mut GraphBuilder, &TensorHandle) -> EngineResult<TensorHandle> + 'static,
    {
        let identity = topology.identity();
        Self {
            input_shape: input_shape.to_vec(),
            head: Box::new(head),
            topology,
            config,
            identity,
            state: BuilderState::Uninitialized,
        }
    }

    /// Decodes `topology` first, fails before any graph work if it is malformed.
    pub fn from_topology_str<F>(
        input_shape: &[usize],
        head: F,
        topology: &str,
        config: CnnConfig,
    ) -> CnnResult<Self>
    where
        F: Fn(&mut GraphBuilder, &TensorHandle) -> EngineResult<TensorHandle> + 'static,
    {
        Ok(Self::new(input_shape, head, topology.parse()?, config))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The identity hash, canonical tokens joined by `-`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &CnnConfig {
        &self.config
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, BuilderState::Compiled(_))
    }

    pub fn model(&self) -> CnnResult<&Model> {
        match &self.state {
            BuilderState::Compiled(model) => Ok(model),
            BuilderState::Uninitialized => {
                Err(CnnError::InvalidState("the model has to be compiled first"))
            }
        }
    }

    fn model_mut(&mut self) -> CnnResult<&mut Model> {
        match &mut self.state {
            BuilderState::Compiled(model) => Ok(model),
            BuilderState::Uninitialized => {
                Err(CnnError::InvalidState("the model has to be compiled first"))
            }
        }
    }

    fn storage_key(&self) -> &str {
        if self.identity.is_empty() {
            EMPTY_TOPOLOGY_KEY
        } else {
            &self.identity
        }
    }

    /// `{checkpoint_dir}/{identity}`, its existence marks the topology as trained.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config.checkpoint_dir.join(self.storage_key())
    }

    /// `{checkpoint_dir}/{identity}/{identity}.{npz|json}`
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir().join(format!(
            "{}.{}",
            self.storage_key(),
            self.config.checkpoint_format.extension()
        ))
    }

    /// `{log_dir}/{identity}`
    pub fn log_dir(&self) -> PathBuf {
        self.config.log_dir.join(self.storage_key())
    }

    /// Builds and compiles the model on the first call, later calls return the same model.
    pub fn compile(&mut self) -> CnnResult<&Model> {
        if !self.is_compiled() {
            let model = self.build()?;
            self.state = BuilderState::Compiled(model);
        }
        self.model()
    }

    fn build(&self) -> CnnResult<Model> {
        let mut graph = GraphBuilder::new(self.config.seed);
        let mut counter = GroupCounter::new();
        let input = graph.input(&self.input_shape)?;
        let features = self
            .topology
            .layers()
            .iter()
            .try_fold(input.clone(), |tensor, layer| {
                layer.render(&mut graph, &tensor, &mut counter)
            })?;
        let output = (self.head)(&mut graph, &features)?;

        let mut model = graph.build(&input, &output)?;
        model.compile(
            &self.config.optimizer,
            self.config.loss,
            &self.config.metrics,
        )?;
        info!("Compiled model {:?}\n{}", self.identity, model.summary());
        Ok(model)
    }

    /// Trains on the training split, holding out the configured validation fraction.
    /// If checkpoint reuse is enabled and the checkpoint directory exists, the checkpoint is
    /// loaded instead.
    pub fn train(
        &mut self,
        data: &Dataset,
        batch_size: usize,
        epochs: usize,
    ) -> CnnResult<TrainOutcome> {
        if !self.is_compiled() {
            return Err(CnnError::InvalidState("train called before compile"));
        }
        if self.config.load_if_exist && self.checkpoint_dir().exists() {
            info!(
                "Found checkpoint directory {}, skipping training",
                self.checkpoint_dir().display()
            );
            return Ok(TrainOutcome::Restored(self.restore()?));
        }

        let mut checkpoint = ModelCheckpoint::new(self.checkpoint_path(), MONITOR)
            .mode(MonitorMode::Max)
            .save_best_only(true)
            .format(self.config.checkpoint_format);
        let mut log = TrainingLog::new(self.log_dir())
            .update_freq(UpdateFreq::Batch)
            .histogram_freq(self.config.histogram_freq);
        let options = FitOptions {
            batch_size,
            epochs,
            validation_split: self.config.validation_split,
            shuffle: true,
        };
        info!(
            "Training {:?} for {} epochs with batch size {}",
            self.identity, epochs, batch_size
        );

        let model = self.model_mut()?;
        let mut callbacks: [&mut dyn Callback; 2] = [&mut checkpoint, &mut log];
        let history = model.fit(&data.train.x, &data.train.y, &options, &mut callbacks)?;
        Ok(TrainOutcome::Trained(history))
    }

    /// Loads the weights stored at [`Cnn::checkpoint_path`] into the compiled model.
    pub fn restore(&mut self) -> CnnResult<PathBuf> {
        let path = self.checkpoint_path();
        let format = self.config.checkpoint_format;
        self.model_mut()?.load_weights(&path, format)?;
        info!("Restored {}", path.display());
        Ok(path)
    }

    /// Loss and metrics on the test split.
    pub fn evaluate(&self, data: &Dataset, batch_size: usize) -> CnnResult<Logs> {
        let model = self
            .model()
            .map_err(|_| CnnError::InvalidState("evaluate called before compile"))?;
        let test = data.test()?;
        Ok(model.evaluate(&test.x, &test.y, batch_size)?)
    }

    pub fn summary(&self) -> CnnResult<String> {
        Ok(self.model()?.summary())
    }
}

impl fmt::Display for Cnn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

impl fmt::Debug for Cnn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cnn")
            .field("input_shape", &self.input_shape)
            .field("topology", &self.topology)
            .field("config", &self.config)
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

/// Flattens the features and maps them to `classes` softmax probabilities.
pub fn classification_head(
    classes: usize,
) -> impl Fn(&mut GraphBuilder, &TensorHandle) -> EngineResult<TensorHandle> {
    move |graph: &mut GraphBuilder, input: &TensorHandle| {
        let name = graph.unique_name("Flatten");
        let flat = graph.flatten(&name, input)?;
        let name = graph.unique_name("Dense");
        graph.dense(&name, &flat, classes, Activation::Softmax)
    }
}
