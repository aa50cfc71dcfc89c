//! Pretraining: learning-rate schedule and the data-parallel training loop.

mod scheduler;
mod trainer;

pub use scheduler::LinearWarmupCosineLr;
pub use trainer::{EpochSummary, TrainConfig, Trainer};

use thiserror::Error;

use crate::datasets::DatasetError;
use crate::distributed::DistributedError;
use crate::models::ModelError;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("parameter map lock poisoned")]
    Poisoned,
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}
