use std::path::PathBuf;

use ml::errors::EngineError;
use ndarray_npy::ReadNpzError;
use thiserror::Error;

pub type CnnResult<T> = Result<T, CnnError>;

#[derive(Error, Debug)]
pub enum CnnError {
    #[error("Malformed topology at token {position} ({token:?}): {reason}")]
    MalformedTopology {
        position: usize,
        token: String,
        reason: String,
    },
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Dataset has no {0} split")]
    MissingSplit(&'static str),
    #[error("Could not read config file {path}. Filesystem reported error\n {source}.")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Config file {path} is not valid: {source}")]
    ConfigFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Could not open dataset {path}. Filesystem reported error\n {source}.")]
    DatasetOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not read array {name} from the dataset: {source}")]
    DatasetArray { name: String, source: ReadNpzError },
    #[error("Dataset does not fit: {0}")]
    DatasetShape(String),
}
