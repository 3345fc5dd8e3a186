//! Reference execution engine: builds named computation graphs over `ndarray` tensors,
//! trains them with hand-written backward passes and persists their weights.
pub mod activation_functions;
pub mod callbacks;
pub mod convolutions;
pub mod errors;
pub mod fully_connected;
pub mod graph;
pub mod losses;
pub mod models;
pub mod normalization;
pub mod optimizers;
pub mod pooling;
pub mod weight_loader;

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

pub use activation_functions::Activation;
pub use callbacks::{Callback, Logs, ModelCheckpoint, MonitorMode, TrainingLog, UpdateFreq};
pub use convolutions::Padding;
pub use errors::{EngineError, EngineResult};
pub use graph::{GraphBuilder, TensorHandle};
pub use losses::{Loss, Metric};
pub use models::{FitOptions, History, InternalDataRepresentation, Model};
pub use optimizers::OptimizerConfig;
pub use pooling::PoolKind;
pub use weight_loader::WeightFormat;
