//! Command line interface to build residual CNNs from topology strings, train them with
//! checkpoint reuse and evaluate them on `.npz` datasets.

use cnn::{classification_head, Cnn, CnnConfig, CnnResult, Dataset, TrainOutcome};
use env_logger::Builder;
use log::{error, info};
use ml::models::format_logs;
use quicli::prelude::*;
use skipnet::InputShape;
use std::path::PathBuf;
use structopt::StructOpt;

/// Describes the model, shared by every subcommand that builds one
#[derive(Debug, StructOpt)]
struct ModelOpts {
    /// Topology string, e.g. "32-64-max-128-256"
    topology: String,
    /// Shape of one input sample as height,width,channels
    #[structopt(short = "s", long = "input-shape", default_value = "28,28,1")]
    input_shape: InputShape,
    /// Number of classes of the softmax output
    #[structopt(short = "k", long = "classes", default_value = "10")]
    classes: usize,
    /// JSON file with training and persistence settings
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
}

impl ModelOpts {
    fn config(&self) -> CnnResult<CnnConfig> {
        match &self.config {
            Some(path) => CnnConfig::from_json_file(path),
            None => Ok(CnnConfig::default()),
        }
    }

    fn builder(&self, config: CnnConfig) -> CnnResult<Cnn> {
        Cnn::from_topology_str(
            self.input_shape.dims(),
            classification_head(self.classes),
            &self.topology,
            config,
        )
    }
}

/// Selects and preprocesses the dataset
#[derive(Debug, StructOpt)]
struct DataOpts {
    /// .npz archive with x_train, y_train and optionally x_test, y_test
    #[structopt(short = "d", long = "data", parse(from_os_str))]
    data: PathBuf,
    /// Multiplies every input value, e.g. 0.00392 to map bytes to [0, 1]
    #[structopt(long = "rescale")]
    rescale: Option<f32>,
    /// Keeps at most this many samples per split
    #[structopt(long = "limit")]
    limit: Option<usize>,
}

impl DataOpts {
    fn load(&self, input_shape: &InputShape) -> CnnResult<Dataset> {
        let mut dataset = Dataset::from_npz(&self.data)?;
        if let Some(limit) = self.limit {
            dataset.truncate(limit);
        }
        dataset.reshape_inputs(input_shape.dims())?;
        if let Some(factor) = self.rescale {
            dataset.rescale(factor);
        }
        Ok(dataset)
    }
}

/// Prints the identity hash of a topology
#[derive(Debug, StructOpt)]
struct HashOpts {
    /// Topology string, e.g. "32-64-max-128-256"
    topology: String,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Compiles a model and prints its layer table
#[derive(Debug, StructOpt)]
struct SummaryOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Trains a model, or restores it if it was trained before
#[derive(Debug, StructOpt)]
struct TrainOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    data: DataOpts,
    #[structopt(short = "b", long = "batch-size", default_value = "64")]
    batch_size: usize,
    #[structopt(short = "e", long = "epochs", default_value = "1")]
    epochs: usize,
    /// Trains even if a checkpoint of this topology exists
    #[structopt(long = "no-reuse")]
    no_reuse: bool,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Restores a trained model and evaluates it on the test split
#[derive(Debug, StructOpt)]
struct EvaluateOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    data: DataOpts,
    #[structopt(short = "b", long = "batch-size", default_value = "64")]
    batch_size: usize,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Build, train and evaluate residual CNNs described by topology strings.
#[derive(Debug, StructOpt)]
#[structopt(name = "SkipNet")]
enum Skipnet {
    #[structopt(name = "hash", about = "Prints the identity hash of a topology.")]
    Hash(HashOpts),
    #[structopt(name = "summary", about = "Prints the layer table of a compiled model.")]
    Summary(SummaryOpts),
    #[structopt(
        name = "train",
        about = "Trains a model on the training split and evaluates it on the test split. \
        Restores the checkpoint instead if the topology was trained before."
    )]
    Train(TrainOpts),
    #[structopt(
        name = "evaluate",
        about = "Evaluates a previously trained model on the test split."
    )]
    Evaluate(EvaluateOpts),
}

/// Trait for the subcommands that skipnet uses
trait SkipnetOpts {
    /// Performs the subcommand
    fn run(&self) -> CnnResult<()>;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl SkipnetOpts for HashOpts {
    fn run(&self) -> CnnResult<()> {
        let topology: cnn::Topology = self.topology.parse()?;
        println!("{}", topology.identity());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl SkipnetOpts for SummaryOpts {
    fn run(&self) -> CnnResult<()> {
        let mut cnn = self.model.builder(self.model.config()?)?;
        println!("{}", cnn.compile()?.summary());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl SkipnetOpts for TrainOpts {
    fn run(&self) -> CnnResult<()> {
        let mut config = self.model.config()?;
        if self.no_reuse {
            config.load_if_exist = false;
        }
        let dataset = self.data.load(&self.model.input_shape)?;
        let mut cnn = self.model.builder(config)?;
        cnn.compile()?;

        match cnn.train(&dataset, self.batch_size, self.epochs)? {
            TrainOutcome::Restored(path) => println!("Restored {}", path.display()),
            TrainOutcome::Trained(history) => {
                for (epoch, logs) in history.epochs.iter().enumerate() {
                    println!("Epoch {}/{}: {}", epoch + 1, self.epochs, format_logs(logs));
                }
            }
        }

        if dataset.test.is_some() {
            let logs = cnn.evaluate(&dataset, self.batch_size)?;
            println!("Test: {}", format_logs(&logs));
        } else {
            info!("No test split in {}, skipping evaluation", self.data.data.display());
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl SkipnetOpts for EvaluateOpts {
    fn run(&self) -> CnnResult<()> {
        let dataset = self.data.load(&self.model.input_shape)?;
        let mut cnn = self.model.builder(self.model.config()?)?;
        cnn.compile()?;
        cnn.restore()?;
        let logs = cnn.evaluate(&dataset, self.batch_size)?;
        println!("{}: {}", cnn, format_logs(&logs));
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl SkipnetOpts for Skipnet {
    fn run(&self) -> CnnResult<()> {
        match self {
            Skipnet::Hash(c) => c.run(),
            Skipnet::Summary(c) => c.run(),
            Skipnet::Train(c) => c.run(),
            Skipnet::Evaluate(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Skipnet::Hash(c) => c.get_verbosity(),
            Skipnet::Summary(c) => c.get_verbosity(),
            Skipnet::Train(c) => c.get_verbosity(),
            Skipnet::Evaluate(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Skipnet::from_args();
    args.setup_env_logger()?;
    if let Err(e) = args.run() {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}
