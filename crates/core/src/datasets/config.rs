//! Dataset builder configs.
//!
//! A config file holds one or more entries under `[datasets.<name>]`:
//!
//! ```toml
//! [datasets.ok_vqa]
//! data_type = "images"
//!
//! [datasets.ok_vqa.build_info.annotations.train]
//! storage = "okvqa/annotations/okvqa_train.json"
//!
//! [datasets.ok_vqa.build_info.images]
//! storage = "coco/images/"
//!
//! [datasets.ok_vqa.vis_processor.train]
//! name = "blip2_image_train"
//! image_size = 224
//!
//! [datasets.ok_vqa.text_processor.train]
//! name = "blip_question"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{DatasetError, Result};
use crate::multimodal::ImageProcessorConfig;

/// One path or a list of paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Storage {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl Storage {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Storage::One(p) => vec![p.as_path()],
            Storage::Many(ps) => ps.iter().map(PathBuf::as_path).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitAnnotations {
    pub storage: Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualStorage {
    pub storage: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Directory holding the annotation file (single-file builders).
    #[serde(default)]
    pub storage: Option<PathBuf>,
    /// Directory images are resolved against (single-file builders).
    #[serde(default)]
    pub vis_root: Option<PathBuf>,
    /// Per-split annotation files (split builders).
    #[serde(default)]
    pub annotations: BTreeMap<String, SplitAnnotations>,
    /// Visual storage for split builders, keyed by `data_type`
    /// (`[build_info.images]` for image datasets).
    #[serde(flatten)]
    pub visual: BTreeMap<String, VisualStorage>,
}

impl BuildInfo {
    pub fn visual_storage(&self, data_type: &str) -> Option<&VisualStorage> {
        self.visual.get(data_type)
    }
}

/// Train and eval variants of a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorPair<T> {
    pub train: Option<T>,
    pub eval: Option<T>,
}

impl<T> Default for ProcessorPair<T> {
    fn default() -> Self {
        Self {
            train: None,
            eval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextProcessorConfig {
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
}

fn default_max_words() -> usize {
    50
}

fn default_data_type() -> String {
    "images".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub build_info: BuildInfo,
    #[serde(default)]
    pub vis_processor: ProcessorPair<ImageProcessorConfig>,
    #[serde(default)]
    pub text_processor: ProcessorPair<TextProcessorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct DatasetConfigFile {
    datasets: BTreeMap<String, DatasetConfig>,
}

impl DatasetConfig {
    /// Parse the `[datasets.<name>]` entry of a TOML document.
    pub fn from_toml_str(content: &str, name: &str) -> Result<Self> {
        let mut file: DatasetConfigFile = toml::from_str(content)?;
        file.datasets
            .remove(name)
            .ok_or_else(|| DatasetError::MissingConfig(name.to_string()))
    }

    pub fn from_file(path: &Path, name: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, name)
    }
}
