pub mod blip2;
pub mod losses;
pub mod mcan;
pub mod outputs;
pub mod registry;
pub mod retrieval;

pub use blip2::{Blip2Mcan, FeatureMode, GenerateParams};
pub use mcan::{AttFlat, McaEncoderDecoder, Mcan};
pub use outputs::{Blip2Output, Blip2OutputFeatures, LossValues};
pub use registry::{find_model, ModelInfo};
pub use retrieval::{compute_sim_matrix, RetrievalMetrics, SimilarityMatrices};

use thiserror::Error;

use crate::distributed::DistributedError;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("missing input: {0}")]
    MissingInput(&'static str),
    #[error("batch has {images} images but {texts} texts")]
    BatchMismatch { images: usize, texts: usize },
    #[error("invalid feature mode '{0}', expected image, text or multimodal")]
    InvalidMode(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}
