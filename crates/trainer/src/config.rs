//! Run configuration for the trainer.
//!
//! Values are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. The `--config` file, else ~/.config/daiv/run.toml
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use daiv_core::config::ModelConfig;
use daiv_core::models::registry;
use daiv_core::train::TrainConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistent run configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Registered model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Preset of the model (pretrain, pretrain_vitL, coco).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Model config file; overrides the preset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<PathBuf>,

    /// Dataset builders whose train splits are concatenated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<String>>,

    /// Directory relative dataset paths resolve against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,

    /// Directory holding `configs/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<PathBuf>,

    /// `cpu` or `cuda`. Rank `r` uses CUDA device `r`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Number of in-process ranks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epoch: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_lr: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_lr: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_lr: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_steps: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f64>,

    /// Log every N steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_freq: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Checkpoint directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps_per_epoch: Option<usize>,
}

impl RunConfig {
    /// A complete starting point for `init-config`.
    pub fn template() -> Self {
        let train = TrainConfig::default();
        Self {
            model: Some("blip2".to_string()),
            model_type: Some("pretrain".to_string()),
            model_config: None,
            datasets: Some(vec!["coco_vqa".to_string()]),
            cache_root: Some(PathBuf::from("data")),
            repo_root: Some(PathBuf::from(".")),
            device: Some("cpu".to_string()),
            world_size: Some(1),
            batch_size: Some(train.batch_size),
            max_epoch: Some(train.max_epoch),
            init_lr: Some(train.init_lr),
            min_lr: Some(train.min_lr),
            warmup_lr: Some(train.warmup_lr),
            warmup_steps: Some(train.warmup_steps),
            weight_decay: Some(train.weight_decay),
            log_freq: Some(train.log_freq),
            seed: Some(train.seed),
            output_dir: Some(train.output_dir),
            max_steps_per_epoch: None,
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("daiv").join("run.toml"))
    }

    /// Config from the default path, or empty when there is none.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Take every value `other` sets.
    pub fn merge(&mut self, other: &RunConfig) {
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.model_type.is_some() {
            self.model_type = other.model_type.clone();
        }
        if other.model_config.is_some() {
            self.model_config = other.model_config.clone();
        }
        if other.datasets.is_some() {
            self.datasets = other.datasets.clone();
        }
        if other.cache_root.is_some() {
            self.cache_root = other.cache_root.clone();
        }
        if other.repo_root.is_some() {
            self.repo_root = other.repo_root.clone();
        }
        if other.device.is_some() {
            self.device = other.device.clone();
        }
        if other.world_size.is_some() {
            self.world_size = other.world_size;
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.max_epoch.is_some() {
            self.max_epoch = other.max_epoch;
        }
        if other.init_lr.is_some() {
            self.init_lr = other.init_lr;
        }
        if other.min_lr.is_some() {
            self.min_lr = other.min_lr;
        }
        if other.warmup_lr.is_some() {
            self.warmup_lr = other.warmup_lr;
        }
        if other.warmup_steps.is_some() {
            self.warmup_steps = other.warmup_steps;
        }
        if other.weight_decay.is_some() {
            self.weight_decay = other.weight_decay;
        }
        if other.log_freq.is_some() {
            self.log_freq = other.log_freq;
        }
        if other.seed.is_some() {
            self.seed = other.seed;
        }
        if other.output_dir.is_some() {
            self.output_dir = other.output_dir.clone();
        }
        if other.max_steps_per_epoch.is_some() {
            self.max_steps_per_epoch = other.max_steps_per_epoch;
        }
    }

    pub fn repo_root(&self) -> PathBuf {
        self.repo_root.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn world_size(&self) -> usize {
        self.world_size.unwrap_or(1).max(1)
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("blip2")
    }

    /// Explicit model config file, else the registered preset. The run seed
    /// carries over into the model.
    pub fn model_config(&self) -> Result<ModelConfig, ConfigError> {
        let mut cfg = match &self.model_config {
            Some(path) => ModelConfig::from_file(path)?,
            None => registry::load_preset(
                &self.repo_root(),
                self.model_name(),
                self.model_type.as_deref(),
            )?,
        };
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        Ok(cfg)
    }

    pub fn train_config(&self) -> TrainConfig {
        let d = TrainConfig::default();
        TrainConfig {
            max_epoch: self.max_epoch.unwrap_or(d.max_epoch),
            batch_size: self.batch_size.unwrap_or(d.batch_size),
            init_lr: self.init_lr.unwrap_or(d.init_lr),
            min_lr: self.min_lr.unwrap_or(d.min_lr),
            warmup_lr: self.warmup_lr.unwrap_or(d.warmup_lr),
            warmup_steps: self.warmup_steps.unwrap_or(d.warmup_steps),
            weight_decay: self.weight_decay.unwrap_or(d.weight_decay),
            log_freq: self.log_freq.unwrap_or(d.log_freq),
            seed: self.seed.unwrap_or(d.seed),
            output_dir: self.output_dir.clone().unwrap_or(d.output_dir),
            max_steps_per_epoch: self.max_steps_per_epoch,
            ..d
        }
    }

    /// Device for `rank`.
    pub fn device(&self, rank: usize) -> Result<Device, ConfigError> {
        match self.device.as_deref().unwrap_or("cpu") {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::new_cuda(rank)?),
            other => Err(ConfigError::Device(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown device '{0}', expected cpu or cuda")]
    Device(String),
    #[error(transparent)]
    Model(#[from] daiv_core::models::ModelError),
    #[error("device error: {0}")]
    Candle(#[from] candle_core::Error),
}
