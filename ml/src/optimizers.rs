//! Gradient based parameter updates.
use ndarray::ArrayD;
use serde_derive::{Deserialize, Serialize};

use crate::{
    errors::{EngineError, EngineResult},
    graph::Parameter,
    WeightPrecision,
};

fn default_learning_rate() -> f32 {
    1e-3
}

fn default_beta_1() -> f32 {
    0.9
}

fn default_beta_2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-7
}

fn default_sgd_learning_rate() -> f32 {
    1e-2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        #[serde(default = "default_learning_rate")]
        learning_rate: f32,
        #[serde(default = "default_beta_1")]
        beta_1: f32,
        #[serde(default = "default_beta_2")]
        beta_2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Sgd {
        #[serde(default = "default_sgd_learning_rate")]
        learning_rate: f32,
        #[serde(default)]
        momentum: f32,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            learning_rate: default_learning_rate(),
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            epsilon: default_epsilon(),
        }
    }
}

impl OptimizerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Adam { .. } => "adam",
            OptimizerConfig::Sgd { .. } => "sgd",
        }
    }
}

/// Optimizer together with its per-parameter state.
#[derive(Debug, Clone)]
pub(crate) struct Optimizer {
    config: OptimizerConfig,
    iterations: i32,
    /// First moments for adam, velocities for sgd.
    first: Vec<ArrayD<WeightPrecision>>,
    /// Second moments, only used by adam.
    second: Vec<ArrayD<WeightPrecision>>,
}

impl Optimizer {
    pub(crate) fn new(config: OptimizerConfig, parameters: &[Parameter]) -> Self {
        let zeros = || {
            parameters
                .iter()
                .map(|p| ArrayD::zeros(p.value.raw_dim()))
                .collect::<Vec<_>>()
        };
        let second = match config {
            OptimizerConfig::Adam { .. } => zeros(),
            OptimizerConfig::Sgd { .. } => vec![],
        };
        Self {
            config,
            iterations: 0,
            first: zeros(),
            second,
        }
    }

    pub(crate) fn iterations(&self) -> i32 {
        self.iterations
    }

    /// Applies one update step. Parameters without a gradient and non-trainable parameters
    /// are left untouched.
    pub(crate) fn apply(
        &mut self,
        parameters: &mut [Parameter],
        gradients: Vec<Option<ArrayD<WeightPrecision>>>,
    ) -> EngineResult<()> {
        if gradients.len() != parameters.len() || self.first.len() != parameters.len() {
            return Err(EngineError::InvalidArgument {
                op: "optimizer",
                details: format!(
                    "{} gradients for {} parameters",
                    gradients.len(),
                    parameters.len()
                ),
            });
        }
        self.iterations += 1;
        let t = self.iterations;

        for (index, (parameter, gradient)) in parameters.iter_mut().zip(gradients).enumerate() {
            let gradient = match gradient {
                Some(gradient) if parameter.trainable => gradient,
                _ => continue,
            };
            if gradient.shape() != parameter.value.shape() {
                return Err(EngineError::IncompatibleShapes {
                    op: "optimizer",
                    details: format!(
                        "gradient {:?} for parameter {} of shape {:?}",
                        gradient.shape(),
                        parameter.name,
                        parameter.value.shape()
                    ),
                });
            }

            match self.config {
                OptimizerConfig::Adam {
                    learning_rate,
                    beta_1,
                    beta_2,
                    epsilon,
                } => {
                    let lr_t = learning_rate * (1. - beta_2.powi(t)).sqrt() / (1. - beta_1.powi(t));
                    let m = &mut self.first[index];
                    let v = &mut self.second[index];
                    ndarray::Zip::from(&mut parameter.value)
                        .and(m)
                        .and(v)
                        .and(&gradient)
                        .for_each(|p, m, v, &g| {
                            *m = beta_1 * *m + (1. - beta_1) * g;
                            *v = beta_2 * *v + (1. - beta_2) * g * g;
                            *p -= lr_t * *m / (v.sqrt() + epsilon);
                        });
                }
                OptimizerConfig::Sgd {
                    learning_rate,
                    momentum,
                } => {
                    let velocity = &mut self.first[index];
                    ndarray::Zip::from(&mut parameter.value)
                        .and(velocity)
                        .and(&gradient)
                        .for_each(|p, v, &g| {
                            *v = momentum * *v - learning_rate * g;
                            *p += *v;
                        });
                }
            }
        }
        Ok(())
    }
}
