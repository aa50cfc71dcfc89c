//! Vision transformer used as the image encoder.
//!
//! Supports the EVA-CLIP and OpenAI CLIP layouts: patch convolution, CLS
//! token, learned position embeddings and pre-norm transformer blocks.
//! The final normalization lives in the caller (`ln_vision`).

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, Linear, VarBuilder};

use crate::config::{ModelConfig, VisionConfig};
use crate::layers::{layer_norm, LayerNorm};
use crate::models::ModelError;

/// Vision encoder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionEncoderType {
    /// EVA-CLIP ViT (GELU MLP, no pre-norm).
    EvaClip,
    /// OpenAI CLIP ViT (QuickGELU MLP, pre-norm).
    Clip,
}

/// Configuration for the vision encoder.
#[derive(Debug, Clone)]
pub struct VisionEncoderConfig {
    pub encoder_type: VisionEncoderType,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    /// Image size (square).
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
    /// Stochastic depth rate of the last block; earlier blocks scale linearly.
    pub drop_path_rate: f64,
}

impl VisionEncoderConfig {
    pub fn new(vision: &VisionConfig, encoder_type: VisionEncoderType, image_size: usize) -> Self {
        Self {
            encoder_type,
            hidden_size: vision.hidden_size,
            intermediate_size: vision.intermediate_size,
            num_attention_heads: vision.num_attention_heads,
            num_hidden_layers: vision.num_hidden_layers,
            image_size,
            patch_size: vision.patch_size,
            num_channels: vision.num_channels,
            layer_norm_eps: vision.layer_norm_eps,
            drop_path_rate: 0.0,
        }
    }

    /// Resolve the encoder described by a model config.
    pub fn from_model_config(cfg: &ModelConfig) -> std::result::Result<Self, ModelError> {
        let encoder_type = if cfg.vit_model.starts_with("eva") {
            VisionEncoderType::EvaClip
        } else {
            VisionEncoderType::Clip
        };
        Ok(Self {
            drop_path_rate: cfg.drop_path_rate,
            ..Self::new(&cfg.vision_config()?, encoder_type, cfg.image_size)
        })
    }

    /// Number of patches per image dimension.
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Total number of patches (excluding the CLS token).
    pub fn num_patches(&self) -> usize {
        let n = self.num_patches_per_side();
        n * n
    }

    /// Sequence length including the CLS token.
    pub fn seq_len(&self) -> usize {
        self.num_patches() + 1
    }

    fn drop_path_at(&self, layer: usize) -> f64 {
        if self.num_hidden_layers <= 1 {
            return self.drop_path_rate;
        }
        self.drop_path_rate * layer as f64 / (self.num_hidden_layers - 1) as f64
    }
}

// ─── Patch Embedding ─────────────────────────────────────────────────────────

struct PatchEmbedding {
    proj: Conv2d,
}

impl PatchEmbedding {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                padding: 0,
                dilation: 1,
                groups: 1,
                cudnn_fwd_algo: None,
            },
            vb.pp("patch_embedding"),
        )?;
        Ok(Self { proj })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // [batch, hidden, h, w] -> [batch, num_patches, hidden]
        self.proj
            .forward(pixel_values)?
            .flatten(2, 3)?
            .transpose(1, 2)
    }
}

// ─── Stochastic Depth ────────────────────────────────────────────────────────

/// Drops whole residual branches per sample during training.
#[derive(Debug, Clone, Copy)]
struct DropPath {
    prob: f64,
}

impl DropPath {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.prob <= 0.0 {
            return Ok(xs.clone());
        }
        let keep = 1.0 - self.prob;
        let batch = xs.dim(0)?;
        let mask = Tensor::rand(0f32, 1f32, (batch, 1, 1), xs.device())?
            .ge(self.prob as f32)?
            .to_dtype(xs.dtype())?;
        xs.broadcast_mul(&(mask / keep)?)
    }
}

// ─── Vision Attention ────────────────────────────────────────────────────────

struct VisionAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let q_proj = candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("v_proj"))?;
        let out_proj = candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(hidden_states)?)?;
        let k = split(self.k_proj.forward(hidden_states)?)?;
        let v = split(self.v_proj.forward(hidden_states)?)?;

        let attn_weights = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;
        self.out_proj.forward(&attn_output)
    }
}

// ─── Vision MLP ──────────────────────────────────────────────────────────────

struct VisionMlp {
    fc1: Linear,
    fc2: Linear,
    encoder_type: VisionEncoderType,
}

impl VisionMlp {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let fc1 = candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            encoder_type: cfg.encoder_type,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(hidden_states)?;
        let hidden = match self.encoder_type {
            VisionEncoderType::Clip => quick_gelu(&hidden)?,
            VisionEncoderType::EvaClip => hidden.gelu_erf()?,
        };
        self.fc2.forward(&hidden)
    }
}

/// QuickGELU activation: x * sigmoid(1.702 * x)
fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    x.mul(&candle_nn::ops::sigmoid(&(x * 1.702)?)?)
}

// ─── Vision Encoder Layer ────────────────────────────────────────────────────

struct VisionEncoderLayer {
    self_attn: VisionAttention,
    mlp: VisionMlp,
    layer_norm1: LayerNorm,
    layer_norm2: LayerNorm,
    drop_path: DropPath,
}

impl VisionEncoderLayer {
    fn new(cfg: &VisionEncoderConfig, drop_path: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: VisionAttention::new(cfg, vb.pp("self_attn"))?,
            mlp: VisionMlp::new(cfg, vb.pp("mlp"))?,
            layer_norm1: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            layer_norm2: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
            drop_path: DropPath { prob: drop_path },
        })
    }

    fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let attn = self
            .self_attn
            .forward(&self.layer_norm1.forward(hidden_states)?)?;
        let hidden_states = (hidden_states + self.drop_path.forward(&attn, train)?)?;

        let mlp = self.mlp.forward(&self.layer_norm2.forward(&hidden_states)?)?;
        &hidden_states + self.drop_path.forward(&mlp, train)?
    }
}

// ─── Vision Encoder ──────────────────────────────────────────────────────────

/// Vision transformer that turns pixels into patch features.
pub struct VisionEncoder {
    patch_embedding: PatchEmbedding,
    class_embedding: Tensor,
    position_embedding: Embedding,
    layers: Vec<VisionEncoderLayer>,
    pre_layernorm: Option<LayerNorm>,
    config: VisionEncoderConfig,
    device: Device,
    dtype: DType,
}

impl VisionEncoder {
    /// Build the encoder. Weights take the dtype of `vb`.
    pub fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embedding = PatchEmbedding::new(cfg, vb.clone())?;
        let class_embedding = vb.get((1, 1, cfg.hidden_size), "class_embedding")?;
        let position_embedding =
            candle_nn::embedding(cfg.seq_len(), cfg.hidden_size, vb.pp("position_embedding"))?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        let vb_layers = vb.pp("encoder.layers");
        for i in 0..cfg.num_hidden_layers {
            layers.push(VisionEncoderLayer::new(
                cfg,
                cfg.drop_path_at(i),
                vb_layers.pp(i),
            )?);
        }

        let pre_layernorm = match cfg.encoder_type {
            VisionEncoderType::Clip => Some(layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("pre_layernorm"),
            )?),
            VisionEncoderType::EvaClip => None,
        };

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            layers,
            pre_layernorm,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Encode `[batch, channels, height, width]` pixels into
    /// `[batch, num_patches + 1, hidden_size]` f32 features.
    ///
    /// Drop-path is active only when `train` is set.
    pub fn forward(&self, pixel_values: &Tensor, train: bool) -> Result<Tensor> {
        let batch_size = pixel_values.dim(0)?;
        let pixel_values = pixel_values.to_dtype(self.dtype)?;

        let embeddings = self.patch_embedding.forward(&pixel_values)?;
        let cls = self
            .class_embedding
            .broadcast_as((batch_size, 1, self.config.hidden_size))?;
        let mut embeddings = Tensor::cat(&[cls, embeddings], 1)?;

        let seq_len = embeddings.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        embeddings = embeddings.broadcast_add(&self.position_embedding.forward(&position_ids)?)?;

        if let Some(ln) = &self.pre_layernorm {
            embeddings = ln.forward(&embeddings)?;
        }
        for layer in &self.layers {
            embeddings = layer.forward(&embeddings, train)?;
        }
        embeddings.to_dtype(DType::F32)
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Number of output tokens per image.
    pub fn num_image_tokens(&self) -> usize {
        self.config.seq_len()
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config(encoder_type: VisionEncoderType) -> VisionEncoderConfig {
        VisionEncoderConfig {
            encoder_type,
            hidden_size: 64,
            intermediate_size: 128,
            num_attention_heads: 4,
            num_hidden_layers: 2,
            image_size: 28,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-6,
            drop_path_rate: 0.0,
        }
    }

    #[test]
    fn test_config_from_model_config() {
        let cfg = VisionEncoderConfig::from_model_config(&ModelConfig::default()).unwrap();
        assert_eq!(cfg.encoder_type, VisionEncoderType::EvaClip);
        assert_eq!(cfg.num_patches_per_side(), 16);
        assert_eq!(cfg.seq_len(), 257);

        let cfg = VisionEncoderConfig::from_model_config(&ModelConfig {
            vit_model: "clip_L".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.encoder_type, VisionEncoderType::Clip);
        assert_eq!(cfg.hidden_size, 1024);
    }

    #[test]
    fn test_drop_path_schedule_is_linear() {
        let cfg = VisionEncoderConfig {
            num_hidden_layers: 5,
            drop_path_rate: 0.4,
            ..tiny_config(VisionEncoderType::EvaClip)
        };
        assert_eq!(cfg.drop_path_at(0), 0.0);
        assert!((cfg.drop_path_at(2) - 0.2).abs() < 1e-12);
        assert!((cfg.drop_path_at(4) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_vision_encoder_forward() {
        let device = Device::Cpu;
        for encoder_type in [VisionEncoderType::Clip, VisionEncoderType::EvaClip] {
            let vb = VarBuilder::zeros(DType::F32, &device);
            let encoder = VisionEncoder::new(&tiny_config(encoder_type), vb).unwrap();

            let pixel_values = Tensor::randn(0f32, 1.0, (1, 3, 28, 28), &device).unwrap();
            let embeddings = encoder.forward(&pixel_values, false).unwrap();

            // 28/14 = 2 patches per side, 4 patches + 1 CLS
            assert_eq!(embeddings.dims(), &[1, 5, 64]);
            assert_eq!(embeddings.dtype(), DType::F32);
        }
    }

    #[test]
    fn test_drop_path_eval_is_identity() {
        let xs = Tensor::ones((4, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let dp = DropPath { prob: 0.5 };
        let out = dp.forward(&xs, false).unwrap();
        assert_eq!(
            out.sum_all().unwrap().to_scalar::<f32>().unwrap(),
            24.0
        );
    }

    #[test]
    fn test_drop_path_train_scales_kept_samples() {
        let xs = Tensor::ones((64, 1, 1), DType::F32, &Device::Cpu).unwrap();
        let dp = DropPath { prob: 0.5 };
        let out = dp.forward(&xs, true).unwrap();
        for v in out.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_quick_gelu() {
        let device = Device::Cpu;
        let x = Tensor::new(&[0.0f32, 1.0, -1.0], &device).unwrap();
        let values: Vec<f32> = quick_gelu(&x).unwrap().to_vec1().unwrap();
        assert!((values[0] - 0.0).abs() < 1e-5);
        assert!((values[1] - 0.8458).abs() < 0.01);
        assert!((values[2] - (-0.1542)).abs() < 0.01);
    }
}
