use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::models::ModelError;

/// Numeric precision used for the frozen vision tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VitPrecision {
    #[default]
    Fp16,
    Bf16,
    Fp32,
}

impl VitPrecision {
    pub fn dtype(self) -> DType {
        match self {
            VitPrecision::Fp16 => DType::F16,
            VitPrecision::Bf16 => DType::BF16,
            VitPrecision::Fp32 => DType::F32,
        }
    }
}

/// Vision transformer hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub patch_size: usize,
    #[serde(default = "default_channels")]
    pub num_channels: usize,
    #[serde(default = "default_vit_eps")]
    pub layer_norm_eps: f64,
}

fn default_channels() -> usize {
    3
}

fn default_vit_eps() -> f64 {
    1e-6
}

impl VisionConfig {
    /// EVA-CLIP ViT-g/14, the default BLIP-2 image encoder.
    pub fn eva_clip_g() -> Self {
        Self {
            hidden_size: 1408,
            intermediate_size: 6144,
            num_attention_heads: 16,
            num_hidden_layers: 39,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-6,
        }
    }

    /// OpenAI CLIP ViT-L/14.
    pub fn clip_vit_l() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_attention_heads: 16,
            num_hidden_layers: 24,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-5,
        }
    }

    /// Resolve a `vit_model` name to its preset.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "eva_clip_g" => Some(Self::eva_clip_g()),
            "clip_L" | "clip_vit_l" => Some(Self::clip_vit_l()),
            _ => None,
        }
    }
}

/// Multimodal co-attention network hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McanConfig {
    pub hidden_size: usize,
    pub dropout: f32,
    pub num_heads: usize,
    pub ff_size: usize,
    pub num_layers: usize,
    pub flat_mlp_size: usize,
    pub flat_glimpses: usize,
    pub flat_out_size: usize,
    pub word_embed_size: usize,
    pub layer_norm_eps: f64,
}

impl Default for McanConfig {
    fn default() -> Self {
        Self {
            hidden_size: 512,
            dropout: 0.1,
            num_heads: 8,
            ff_size: 2048,
            num_layers: 6,
            flat_mlp_size: 512,
            flat_glimpses: 1,
            flat_out_size: 512,
            word_embed_size: 300,
            layer_norm_eps: 1e-6,
        }
    }
}

impl McanConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }
}

/// Full model configuration for [`crate::models::Blip2Mcan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub arch: String,
    pub vit_model: String,
    /// Overrides the preset selected by `vit_model`.
    pub vision: Option<VisionConfig>,
    pub image_size: usize,
    pub drop_path_rate: f64,
    pub use_grad_checkpoint: bool,
    pub vit_precision: VitPrecision,
    pub freeze_vit: bool,
    pub num_query_token: usize,
    pub cross_attention_freq: usize,
    pub embed_dim: usize,
    pub max_txt_len: usize,
    pub vocab_size: usize,
    pub mcan: McanConfig,
    pub tokenizer: String,
    pub vit_weights: Option<PathBuf>,
    pub pretrained: Option<PathBuf>,
    pub finetuned: Option<PathBuf>,
    pub load_finetuned: bool,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: "blip2".to_string(),
            vit_model: "eva_clip_g".to_string(),
            vision: None,
            image_size: 224,
            drop_path_rate: 0.0,
            use_grad_checkpoint: false,
            vit_precision: VitPrecision::Fp16,
            freeze_vit: true,
            num_query_token: 32,
            cross_attention_freq: 2,
            embed_dim: 512,
            max_txt_len: 32,
            // bert-base-uncased plus the added [DEC] token
            vocab_size: 30523,
            mcan: McanConfig::default(),
            tokenizer: "bert-base-uncased".to_string(),
            vit_weights: None,
            pretrained: None,
            finetuned: None,
            load_finetuned: false,
            seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ModelError> {
        toml::from_str(content).map_err(|e| ModelError::Config(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ModelError> {
        serde_json::from_str(content).map_err(|e| ModelError::Config(e.to_string()))
    }

    /// Load a config file, dispatching on the extension (`.json` or TOML).
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ModelError::Config(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Vision tower config: explicit override, else the `vit_model` preset.
    pub fn vision_config(&self) -> Result<VisionConfig, ModelError> {
        if let Some(vc) = &self.vision {
            return Ok(vc.clone());
        }
        VisionConfig::from_name(&self.vit_model)
            .ok_or_else(|| ModelError::Config(format!("unknown vit_model '{}'", self.vit_model)))
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let vision = self.vision_config()?;
        let m = &self.mcan;
        if m.num_heads == 0 || m.hidden_size % m.num_heads != 0 {
            return Err(ModelError::Config(format!(
                "mcan hidden_size {} not divisible by num_heads {}",
                m.hidden_size, m.num_heads
            )));
        }
        if vision.num_attention_heads == 0 || vision.hidden_size % vision.num_attention_heads != 0
        {
            return Err(ModelError::Config(format!(
                "vision hidden_size {} not divisible by heads {}",
                vision.hidden_size, vision.num_attention_heads
            )));
        }
        if m.flat_out_size != self.embed_dim {
            return Err(ModelError::Config(format!(
                "mcan flat_out_size {} must equal embed_dim {}",
                m.flat_out_size, self.embed_dim
            )));
        }
        if self.image_size % vision.patch_size != 0 {
            return Err(ModelError::Config(format!(
                "image_size {} not divisible by patch_size {}",
                self.image_size, vision.patch_size
            )));
        }
        if self.max_txt_len < 2 {
            return Err(ModelError::Config("max_txt_len must be >= 2".to_string()));
        }
        Ok(())
    }

    /// Checkpoint selected by `load_finetuned`.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        if self.load_finetuned {
            self.finetuned.as_deref()
        } else {
            self.pretrained.as_deref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRETRAIN_VITL: &str = r#"
        arch = "blip2"
        vit_model = "clip_L"
        image_size = 224
        vit_precision = "fp32"
        freeze_vit = true
        max_txt_len = 32

        [mcan]
        hidden_size = 512
        dropout = 0.1
        num_heads = 8
        ff_size = 2048
        num_layers = 6
        flat_mlp_size = 512
        flat_glimpses = 1
        flat_out_size = 512
        word_embed_size = 300
    "#;

    #[test]
    fn parse_toml_preset() {
        let cfg = ModelConfig::from_toml_str(PRETRAIN_VITL).unwrap();
        assert_eq!(cfg.vit_model, "clip_L");
        assert_eq!(cfg.vit_precision, VitPrecision::Fp32);
        assert_eq!(cfg.vision_config().unwrap().hidden_size, 1024);
        // fields missing from the file keep their defaults
        assert_eq!(cfg.num_query_token, 32);
        assert_eq!(cfg.cross_attention_freq, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_match_mcan_constants() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.mcan.hidden_size, 512);
        assert_eq!(cfg.mcan.head_dim(), 64);
        assert_eq!(cfg.mcan.word_embed_size, 300);
        assert_eq!(cfg.vision_config().unwrap().hidden_size, 1408);
        assert_eq!(cfg.vit_precision.dtype(), DType::F16);
    }

    #[test]
    fn validate_rejects_mismatched_embed_dim() {
        let cfg = ModelConfig {
            embed_dim: 256,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ModelError::Config(_))));
    }

    #[test]
    fn unknown_vit_model_is_error() {
        let cfg = ModelConfig {
            vit_model: "resnet50".to_string(),
            ..Default::default()
        };
        assert!(cfg.vision_config().is_err());
    }

    #[test]
    fn checkpoint_selection() {
        let cfg = ModelConfig {
            pretrained: Some(PathBuf::from("pre.safetensors")),
            finetuned: Some(PathBuf::from("ft.safetensors")),
            ..Default::default()
        };
        assert_eq!(cfg.checkpoint_path(), Some(Path::new("pre.safetensors")));
        let cfg = ModelConfig {
            load_finetuned: true,
            ..cfg
        };
        assert_eq!(cfg.checkpoint_path(), Some(Path::new("ft.safetensors")));
    }

    #[test]
    fn parse_json_config() {
        let cfg = ModelConfig::from_json_str(r#"{"max_txt_len": 40, "freeze_vit": false}"#).unwrap();
        assert_eq!(cfg.max_txt_len, 40);
        assert!(!cfg.freeze_vit);
    }
}
