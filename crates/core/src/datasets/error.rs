use std::path::PathBuf;

use thiserror::Error;

use crate::multimodal::ProcessorError;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid dataset config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("bad annotation in {path}: {message}")]
    Annotation { path: PathBuf, message: String },
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error("unknown dataset builder '{0}'")]
    UnknownBuilder(String),
    #[error("builder '{builder}' has no config type '{config_type}'")]
    UnknownConfigType {
        builder: String,
        config_type: String,
    },
    #[error("config has no entry for dataset '{0}'")]
    MissingConfig(String),
    #[error("builder '{0}' needs build_info.{1}")]
    MissingBuildInfo(String, String),
    #[error("builder '{0}' has no eval dataset class")]
    NoEvalDataset(String),
    #[error("split '{0}' was not built")]
    MissingSplit(String),
    #[error("index {index} out of range for dataset of length {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DatasetError>;
