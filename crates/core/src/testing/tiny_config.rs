use crate::config::{McanConfig, ModelConfig, VisionConfig, VitPrecision};
use crate::tokenizer::BlipTokenizer;

/// Vocabulary of [`test_tokenizer`], after the special tokens.
pub const TEST_WORDS: &[&str] = &[
    "a", "dog", "on", "the", "grass", "two", "cats", "red", "bus", "man", "what", "is", "it",
    "photo", "of",
];

pub fn test_tokenizer() -> BlipTokenizer {
    BlipTokenizer::for_testing(TEST_WORDS)
}

/// ViT with 8px patches, 1 layer, 16 hidden.
pub fn tiny_vision_config() -> VisionConfig {
    VisionConfig {
        hidden_size: 16,
        intermediate_size: 32,
        num_attention_heads: 2,
        num_hidden_layers: 1,
        patch_size: 8,
        num_channels: 3,
        layer_norm_eps: 1e-6,
    }
}

/// Tiny BLIP-2/MCAN config: 16x16 images (4 patches plus CLS), 16-dim MCAN
/// and embedding, fp32 frozen ViT. Uses a few thousand parameters.
pub fn tiny_blip2_config(vocab_size: usize) -> ModelConfig {
    ModelConfig {
        vit_model: "tiny".to_string(),
        vision: Some(tiny_vision_config()),
        image_size: 16,
        vit_precision: VitPrecision::Fp32,
        freeze_vit: true,
        embed_dim: 16,
        max_txt_len: 12,
        vocab_size,
        mcan: McanConfig {
            hidden_size: 16,
            dropout: 0.0,
            num_heads: 2,
            ff_size: 32,
            num_layers: 1,
            flat_mlp_size: 16,
            flat_glimpses: 1,
            flat_out_size: 16,
            word_embed_size: 16,
            layer_norm_eps: 1e-6,
        },
        tokenizer: "test".to_string(),
        seed: 0,
        ..ModelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_blip2_config_is_valid() {
        let tok = test_tokenizer();
        let config = tiny_blip2_config(tok.vocab_size());
        assert!(config.validate().is_ok());
        assert_eq!(config.vocab_size, 5 + TEST_WORDS.len());
        let vision = config.vision_config().unwrap();
        assert_eq!((config.image_size / vision.patch_size).pow(2) + 1, 5);
    }
}
