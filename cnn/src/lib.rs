//! Builds residual convolutional classifiers from compact topology strings such as
//! `"32-64-max-128-256"`.
//!
//! A [`Topology`] is decoded from the string form, compiled once by a [`Cnn`] into an
//! executable [`ml::Model`] and trained or restored. The canonical string form doubles as the
//! identity under which checkpoints and training logs are stored, so a topology that was
//! trained before is loaded instead of trained again.
pub mod cnn;
pub mod codec;
pub mod config;
pub mod dataset;
mod errors;
pub mod layers;

pub use crate::cnn::{classification_head, Cnn, OutputHead, TrainOutcome};
pub use codec::{decode, encode, Topology};
pub use config::CnnConfig;
pub use dataset::{Dataset, Split};
pub use errors::{CnnError, CnnResult};
pub use layers::{GroupCounter, LayerSpec, PoolBlock, PoolingType, SkipBlock};
