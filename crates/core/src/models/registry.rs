//! Static catalog of model names and their config presets.

use std::path::Path;

use super::ModelError;
use crate::config::ModelConfig;

/// A named preset and the config file that defines it, relative to the
/// repository root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPreset {
    pub model_type: &'static str,
    pub config_path: &'static str,
}

/// Metadata for a registered model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    /// Names accepted in run configs and on the command line.
    pub names: &'static [&'static str],
    pub display_name: &'static str,
    pub presets: &'static [ModelPreset],
    pub default_model_type: &'static str,
}

impl ModelInfo {
    pub fn preset(&self, model_type: &str) -> Option<&'static ModelPreset> {
        self.presets.iter().find(|p| p.model_type == model_type)
    }
}

// ─── Static Catalog ──────────────────────────────────────────────────────────

static BLIP2_PRESETS: &[ModelPreset] = &[
    ModelPreset {
        model_type: "pretrain",
        config_path: "configs/models/blip2_pretrain.toml",
    },
    ModelPreset {
        model_type: "pretrain_vitL",
        config_path: "configs/models/blip2_pretrain_vitL.toml",
    },
    ModelPreset {
        model_type: "coco",
        config_path: "configs/models/blip2_coco.toml",
    },
];

static MODELS: &[ModelInfo] = &[ModelInfo {
    names: &["blip2", "blip2_feature_extractor"],
    display_name: "BLIP-2 (MCAN)",
    presets: BLIP2_PRESETS,
    default_model_type: "pretrain",
}];

pub fn supported_models() -> &'static [ModelInfo] {
    MODELS
}

/// Looks up a model by any of its registered names.
pub fn find_model(name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|info| info.names.contains(&name))
}

/// Config path for `model_type`, or for the model's default type.
pub fn default_config_path(name: &str, model_type: Option<&str>) -> Option<&'static str> {
    let info = find_model(name)?;
    info.preset(model_type.unwrap_or(info.default_model_type))
        .map(|p| p.config_path)
}

/// Load a preset config from `root` (the directory holding `configs/`).
pub fn load_preset(
    root: &Path,
    name: &str,
    model_type: Option<&str>,
) -> Result<ModelConfig, ModelError> {
    let info = find_model(name).ok_or_else(|| ModelError::UnsupportedArchitecture(name.into()))?;
    let model_type = model_type.unwrap_or(info.default_model_type);
    let preset = info.preset(model_type).ok_or_else(|| {
        ModelError::Config(format!("model {name} has no preset '{model_type}'"))
    })?;
    ModelConfig::from_file(&root.join(preset.config_path))
}
