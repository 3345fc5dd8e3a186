//! Hooks into [`crate::models::Model::fit`]: best-checkpoint saving and a JSON-lines
//! training log.
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::{errors::EngineResult, models::Model, weight_loader::WeightFormat};

/// Named scalar values reported during training, e.g. `loss` or `val_accuracy`.
pub type Logs = BTreeMap<String, f32>;

pub trait Callback {
    fn on_train_begin(&mut self, _model: &Model) -> EngineResult<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _epoch: usize) -> EngineResult<()> {
        Ok(())
    }

    /// `logs` holds the running averages of the current epoch.
    fn on_batch_end(&mut self, _batch: usize, _logs: &Logs) -> EngineResult<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _epoch: usize, _logs: &Logs, _model: &Model) -> EngineResult<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _logs: Option<&Logs>) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    fn improves(&self, current: f32, best: f32) -> bool {
        match self {
            MonitorMode::Min => current < best,
            MonitorMode::Max => current > best,
        }
    }
}

/// Saves the model weights at the end of every epoch, or only when the monitored value
/// improved.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    monitor: String,
    mode: MonitorMode,
    save_best_only: bool,
    format: WeightFormat,
    best: Option<f32>,
}

impl ModelCheckpoint {
    pub fn new<P: AsRef<Path>>(path: P, monitor: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            monitor: monitor.to_string(),
            mode: MonitorMode::Max,
            save_best_only: true,
            format: WeightFormat::default(),
            best: None,
        }
    }

    pub fn mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn save_best_only(mut self, save_best_only: bool) -> Self {
        self.save_best_only = save_best_only;
        self
    }

    pub fn format(mut self, format: WeightFormat) -> Self {
        self.format = format;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best monitored value seen so far.
    pub fn best(&self) -> Option<f32> {
        self.best
    }

    fn save(&self, model: &Model) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        model.save_weights(&self.path, self.format)
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs, model: &Model) -> EngineResult<()> {
        if !self.save_best_only {
            info!("Epoch {}: saving model to {}", epoch + 1, self.path.display());
            return self.save(model);
        }
        let current = match logs.get(&self.monitor) {
            Some(&current) => current,
            None => {
                warn!(
                    "Can save best model only with {} available, skipping.",
                    self.monitor
                );
                return Ok(());
            }
        };
        match self.best {
            Some(best) if !self.mode.improves(current, best) => {
                info!(
                    "Epoch {}: {} did not improve from {:.5}",
                    epoch + 1,
                    self.monitor,
                    best
                );
                Ok(())
            }
            previous => {
                info!(
                    "Epoch {}: {} improved from {:?} to {:.5}, saving model to {}",
                    epoch + 1,
                    self.monitor,
                    previous,
                    current,
                    self.path.display()
                );
                self.best = Some(current);
                self.save(model)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFreq {
    Batch,
    Epoch,
}

/// One line of the training log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Batch {
        step: usize,
        epoch: usize,
        logs: Logs,
    },
    Epoch {
        epoch: usize,
        logs: Logs,
    },
    Histogram {
        epoch: usize,
        name: String,
        min: f32,
        max: f32,
        mean: f32,
        std: f32,
    },
}

/// Appends [`LogRecord`]s as JSON lines to `{log_dir}/train.jsonl`.
pub struct TrainingLog {
    log_dir: PathBuf,
    update_freq: UpdateFreq,
    /// Weight summaries are written every `histogram_freq` epochs, never if 0.
    histogram_freq: usize,
    writer: Option<BufWriter<File>>,
    epoch: usize,
    step: usize,
}

pub const TRAINING_LOG_FILE: &str = "train.jsonl";

impl TrainingLog {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            update_freq: UpdateFreq::Epoch,
            histogram_freq: 0,
            writer: None,
            epoch: 0,
            step: 0,
        }
    }

    pub fn update_freq(mut self, update_freq: UpdateFreq) -> Self {
        self.update_freq = update_freq;
        self
    }

    pub fn histogram_freq(mut self, histogram_freq: usize) -> Self {
        self.histogram_freq = histogram_freq;
        self
    }

    pub fn file_path(&self) -> PathBuf {
        self.log_dir.join(TRAINING_LOG_FILE)
    }

    fn write(&mut self, record: &LogRecord) -> EngineResult<()> {
        if self.writer.is_none() {
            fs::create_dir_all(&self.log_dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_path())?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writeln!(writer)?;
        }
        Ok(())
    }
}

impl Callback for TrainingLog {
    fn on_train_begin(&mut self, _model: &Model) -> EngineResult<()> {
        info!("Writing training log to {}", self.file_path().display());
        fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }

    fn on_epoch_begin(&mut self, epoch: usize) -> EngineResult<()> {
        self.epoch = epoch;
        Ok(())
    }

    fn on_batch_end(&mut self, _batch: usize, logs: &Logs) -> EngineResult<()> {
        if self.update_freq == UpdateFreq::Batch {
            let record = LogRecord::Batch {
                step: self.step,
                epoch: self.epoch,
                logs: logs.clone(),
            };
            self.write(&record)?;
        }
        self.step += 1;
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs, model: &Model) -> EngineResult<()> {
        self.write(&LogRecord::Epoch {
            epoch,
            logs: logs.clone(),
        })?;
        if self.histogram_freq > 0 && epoch % self.histogram_freq == 0 {
            for (name, values) in model.weights() {
                let count = values.len().max(1) as f32;
                let mean = values.sum() / count;
                let variance = values.mapv(|v| (v - mean).powi(2)).sum() / count;
                self.write(&LogRecord::Histogram {
                    epoch,
                    name: name.to_string(),
                    min: values.fold(f32::INFINITY, |a, &b| a.min(b)),
                    max: values.fold(f32::NEG_INFINITY, |a, &b| a.max(b)),
                    mean,
                    std: variance.sqrt(),
                })?;
            }
        }
        Ok(())
    }

    fn on_train_end(&mut self, _logs: Option<&Logs>) -> EngineResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activation_functions::Activation,
        graph::GraphBuilder,
        losses::{Loss, Metric},
        models::FitOptions,
        optimizers::OptimizerConfig,
    };
    use ndarray::{Array4, ArrayD};
    use std::io::{BufRead, BufReader};
    use tempfile::tempdir;

    fn model() -> Model {
        let mut graph = GraphBuilder::new(0);
        let input = graph.input(&[2, 2, 1]).unwrap();
        let flat = graph.flatten("flatten", &input).unwrap();
        let output = graph
            .dense("dense", &flat, 2, Activation::Softmax)
            .unwrap();
        let mut model = graph.build(&input, &output).unwrap();
        model
            .compile(&OptimizerConfig::default(), Loss::default(), &[Metric::Accuracy])
            .unwrap();
        model
    }

    fn logs(value: f32) -> Logs {
        let mut logs = Logs::new();
        logs.insert("val_accuracy".to_string(), value);
        logs
    }

    #[test]
    fn test_checkpoint_saves_only_improvements() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("best.npz");
        let model = model();
        let mut checkpoint = ModelCheckpoint::new(&path, "val_accuracy");

        checkpoint.on_epoch_end(0, &logs(0.5), &model).unwrap();
        assert!(path.exists());
        assert_eq!(checkpoint.best(), Some(0.5));

        fs::remove_file(&path).unwrap();
        checkpoint.on_epoch_end(1, &logs(0.4), &model).unwrap();
        assert!(!path.exists());
        assert_eq!(checkpoint.best(), Some(0.5));

        checkpoint.on_epoch_end(2, &logs(0.7), &model).unwrap();
        assert!(path.exists());
        assert_eq!(checkpoint.best(), Some(0.7));
    }

    #[test]
    fn test_checkpoint_min_mode_and_missing_monitor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("best.json");
        let model = model();
        let mut checkpoint = ModelCheckpoint::new(&path, "val_loss")
            .mode(MonitorMode::Min)
            .format(WeightFormat::Json);

        checkpoint.on_epoch_end(0, &logs(0.5), &model).unwrap();
        assert!(!path.exists());
        assert_eq!(checkpoint.best(), None);

        let mut losses = Logs::new();
        losses.insert("val_loss".to_string(), 2.);
        checkpoint.on_epoch_end(1, &losses, &model).unwrap();
        losses.insert("val_loss".to_string(), 1.);
        checkpoint.on_epoch_end(2, &losses, &model).unwrap();
        assert_eq!(checkpoint.best(), Some(1.));
        assert!(path.exists());
    }

    #[test]
    fn test_training_log_records() {
        let dir = tempdir().unwrap();
        let mut model = model();
        let mut log = TrainingLog::new(dir.path().join("run"))
            .update_freq(UpdateFreq::Batch)
            .histogram_freq(1);

        let x: ArrayD<f32> = Array4::from_shape_fn((4, 2, 2, 1), |(n, _, _, _)| n as f32).into_dyn();
        let y = vec![0, 1, 0, 1];
        let options = FitOptions {
            batch_size: 2,
            epochs: 2,
            validation_split: 0.,
            shuffle: false,
        };
        model
            .fit(&x, &y, &options, &mut [&mut log as &mut dyn Callback])
            .unwrap();

        let file = File::open(dir.path().join("run").join(TRAINING_LOG_FILE)).unwrap();
        let records: Vec<LogRecord> = BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();

        let batches = records
            .iter()
            .filter(|r| matches!(r, LogRecord::Batch { .. }))
            .count();
        let epochs: Vec<usize> = records
            .iter()
            .filter_map(|r| match r {
                LogRecord::Epoch { epoch, .. } => Some(*epoch),
                _ => None,
            })
            .collect();
        let histograms = records
            .iter()
            .filter(|r| matches!(r, LogRecord::Histogram { .. }))
            .count();
        assert_eq!(batches, 4);
        assert_eq!(epochs, vec![0, 1]);
        // Two weights (kernel and bias) per epoch.
        assert_eq!(histograms, 4);
        match records.last() {
            Some(LogRecord::Histogram { name, .. }) => assert_eq!(name, "dense/bias"),
            other => panic!("unexpected last record {:?}", other),
        }
    }
}
