pub mod mask;
pub mod mlp;
pub mod normalization;

pub use mask::{
    causal_mask, combine_masks, make_feature_mask, make_token_mask, mask_from_attention,
    masked_fill,
};
pub use mlp::{FullyConnected, Mlp};
pub use normalization::{layer_norm, std_layer_norm, LayerNorm, StdLayerNorm};
