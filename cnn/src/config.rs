use std::{
    fs,
    path::{Path, PathBuf},
};

use ml::{
    losses::{Loss, Metric},
    optimizers::OptimizerConfig,
    weight_loader::WeightFormat,
};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{CnnError, CnnResult};

/// Training and persistence settings of a [`crate::Cnn`]. Every field is optional in the
/// JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnConfig {
    /// Checkpoints are stored under `{checkpoint_dir}/{identity}/`.
    pub checkpoint_dir: PathBuf,
    /// Training logs are written to `{log_dir}/{identity}/`.
    pub log_dir: PathBuf,
    /// Restore an existing checkpoint instead of training again.
    pub load_if_exist: bool,
    pub optimizer: OptimizerConfig,
    pub loss: Loss,
    pub metrics: Vec<Metric>,
    /// Seeds weight initialization and shuffling.
    pub seed: u64,
    pub checkpoint_format: WeightFormat,
    pub validation_split: f32,
    /// Weight summaries every n epochs, 0 disables them.
    pub histogram_freq: usize,
}

impl Default for CnnConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            log_dir: PathBuf::from("./logs/train_data"),
            load_if_exist: true,
            optimizer: OptimizerConfig::default(),
            loss: Loss::SparseCategoricalCrossentropy,
            metrics: vec![Metric::Accuracy],
            seed: 42,
            checkpoint_format: WeightFormat::Npz,
            validation_split: 0.2,
            histogram_freq: 1,
        }
    }
}

impl CnnConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CnnResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CnnError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CnnError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"checkpoint_dir": "/tmp/ckpt", "optimizer": {{"kind": "sgd", "momentum": 0.9}}, "checkpoint_format": "json"}}"#
        )
        .unwrap();

        let config = CnnConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/ckpt"));
        assert_eq!(config.log_dir, PathBuf::from("./logs/train_data"));
        assert_eq!(config.checkpoint_format, WeightFormat::Json);
        assert_eq!(
            config.optimizer,
            OptimizerConfig::Sgd {
                learning_rate: 1e-2,
                momentum: 0.9
            }
        );
        assert!(config.load_if_exist);
        assert_eq!(config.metrics, vec![Metric::Accuracy]);
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            CnnConfig::from_json_file("/definitely/not/here.json"),
            Err(CnnError::ConfigRead { .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"seed": "many"}}"#).unwrap();
        assert!(matches!(
            CnnConfig::from_json_file(file.path()),
            Err(CnnError::ConfigFormat { .. })
        ));
    }
}
