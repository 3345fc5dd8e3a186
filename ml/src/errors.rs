use ndarray::ShapeError;
use thiserror::Error;

use crate::weight_loader::WeightError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A node named {0} already exists in the graph")]
    DuplicateName(String),
    #[error("Tensor {0} does not belong to this graph")]
    UnknownTensor(usize),
    #[error("Incompatible shapes for {op}: {details}")]
    IncompatibleShapes { op: &'static str, details: String },
    #[error("Invalid argument for {op}: {details}")]
    InvalidArgument { op: &'static str, details: String },
    #[error("Model has to be compiled before calling {0}")]
    NotCompiled(&'static str),
    #[error("Data does not fit the model: {0}")]
    DataMismatch(String),
    #[error("Wrong shape for tensor:\n {0}.")]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Weight(#[from] WeightError),
    #[error("Could not write training log. Filesystem reported error\n {0}.")]
    Io(#[from] std::io::Error),
    #[error("Could not serialize training log entry: {0}")]
    Serialization(#[from] serde_json::Error),
}
