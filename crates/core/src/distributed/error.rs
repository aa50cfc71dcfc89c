//! Error types for distributed operations.

use thiserror::Error;

/// Errors raised by process groups and collectives.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Ranks contributed tensors whose shapes disagree outside the gather dim.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A peer rank panicked or dropped out of a collective.
    #[error("collective aborted: {0}")]
    Aborted(String),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

impl From<DistributedError> for candle_core::Error {
    fn from(e: DistributedError) -> Self {
        match e {
            DistributedError::TensorError(inner) => inner,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
