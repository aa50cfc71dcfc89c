//! Turning a dataset config into train/val/test datasets.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use super::builders::BuilderInfo;
use super::config::DatasetConfig;
use super::dataset::VqaDataset;
use super::error::{DatasetError, Result};
use super::text::TextProcessor;
use crate::multimodal::{ImageProcessor, ImageProcessorConfig, ImageProcessorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(DatasetError::MissingSplit(other.to_string())),
        }
    }
}

/// How a builder finds its annotation files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStrategy {
    /// `build_info.storage/<file>` becomes the train split, with images under
    /// `build_info.vis_root`.
    SingleFile(&'static str),
    /// Every train/val/test entry of `build_info.annotations`, with visual
    /// storage under the `build_info` key named by `data_type`.
    Splits,
}

pub trait DatasetBuilder {
    fn name(&self) -> &str;

    fn build_datasets(&self) -> Result<HashMap<Split, VqaDataset>>;
}

/// Config-driven builder for every registered VQA source.
#[derive(Debug, Clone)]
pub struct VqaBuilder {
    info: &'static BuilderInfo,
    config: DatasetConfig,
    cache_root: PathBuf,
    seed: Option<u64>,
}

impl VqaBuilder {
    pub fn new(info: &'static BuilderInfo, config: DatasetConfig) -> Self {
        Self {
            info,
            config,
            cache_root: PathBuf::from("."),
            seed: None,
        }
    }

    /// Directory relative storage paths resolve against.
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Seed the training image augmentation.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn info(&self) -> &'static BuilderInfo {
        self.info
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cache_root.join(path)
        }
    }

    fn vis_processor(&self, train: bool) -> Result<Arc<ImageProcessor>> {
        let pair = &self.config.vis_processor;
        let cfg = if train { &pair.train } else { &pair.eval };
        let processor = match cfg {
            Some(cfg) => ImageProcessor::from_config(cfg)?,
            None => {
                let size = pair
                    .train
                    .as_ref()
                    .or(pair.eval.as_ref())
                    .map_or(224, |c: &ImageProcessorConfig| c.image_size);
                ImageProcessor::new(ImageProcessorKind::BlipEval, size)
            }
        };
        Ok(Arc::new(match self.seed {
            Some(seed) if train => processor.with_seed(seed),
            _ => processor,
        }))
    }

    fn text_processor(&self, train: bool) -> TextProcessor {
        let pair = &self.config.text_processor;
        let cfg = if train { &pair.train } else { &pair.eval };
        match cfg.as_ref().and_then(TextProcessor::from_config) {
            Some(p) => p,
            None => {
                if let Some(cfg) = cfg {
                    warn!(name = %cfg.name, "unknown text processor, using blip_question");
                }
                TextProcessor::default()
            }
        }
    }

    fn build_single_file(&self, file: &str) -> Result<HashMap<Split, VqaDataset>> {
        let build_info = &self.config.build_info;
        let storage = build_info
            .storage
            .as_deref()
            .ok_or_else(|| DatasetError::MissingBuildInfo(self.info.name.into(), "storage".into()))?;
        let vis_root = build_info
            .vis_root
            .as_deref()
            .ok_or_else(|| DatasetError::MissingBuildInfo(self.info.name.into(), "vis_root".into()))?;
        let storage = self.resolve(storage);
        if !storage.exists() {
            warn!(path = %storage.display(), "storage path does not exist");
        }
        let dataset = VqaDataset::new(
            self.info.train_format,
            &[storage.join(file)],
            self.resolve(vis_root),
            self.vis_processor(true)?,
            self.text_processor(true),
        )?;
        Ok(HashMap::from([(Split::Train, dataset)]))
    }

    fn build_splits(&self) -> Result<HashMap<Split, VqaDataset>> {
        let build_info = &self.config.build_info;
        let data_type = &self.config.data_type;
        let images = build_info.visual_storage(data_type).ok_or_else(|| {
            DatasetError::MissingBuildInfo(self.info.name.into(), data_type.clone())
        })?;
        let vis_path = self.resolve(&images.storage);
        if !vis_path.exists() {
            warn!(path = %vis_path.display(), "image storage path does not exist");
        }

        let mut datasets = HashMap::new();
        for (name, annotations) in &build_info.annotations {
            let Ok(split) = name.parse::<Split>() else {
                continue;
            };
            let train = split == Split::Train;
            let format = if train {
                self.info.train_format
            } else {
                self.info
                    .eval_format
                    .ok_or_else(|| DatasetError::NoEvalDataset(self.info.name.into()))?
            };
            let ann_paths: Vec<PathBuf> = annotations
                .storage
                .paths()
                .into_iter()
                .map(|p| self.resolve(p))
                .collect();
            let dataset = VqaDataset::new(
                format,
                &ann_paths,
                vis_path.clone(),
                self.vis_processor(train)?,
                self.text_processor(train),
            )?;
            datasets.insert(split, dataset);
        }
        Ok(datasets)
    }
}

impl DatasetBuilder for VqaBuilder {
    fn name(&self) -> &str {
        self.info.name
    }

    fn build_datasets(&self) -> Result<HashMap<Split, VqaDataset>> {
        info!(builder = self.info.name, "building datasets");
        match self.info.strategy {
            BuildStrategy::SingleFile(file) => self.build_single_file(file),
            BuildStrategy::Splits => self.build_splits(),
        }
    }
}
