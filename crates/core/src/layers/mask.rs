//! Boolean attention masks.
//!
//! Masks are `u8` tensors where `1` marks a position that must not be
//! attended. Padding masks have shape `[B, 1, 1, N]` so they broadcast over
//! heads and query positions.

use candle_core::{DType, Device, Result, Tensor, D};

/// Mask feature rows that are entirely zero. `feats`: `[B, N, D]`.
pub fn make_feature_mask(feats: &Tensor) -> Result<Tensor> {
    let (b, n, _) = feats.dims3()?;
    feats
        .to_dtype(DType::F32)?
        .abs()?
        .sum(D::Minus1)?
        .eq(0f32)?
        .reshape((b, 1, 1, n))
}

/// Mask padding tokens. `ids`: `[B, T]` u32.
pub fn make_token_mask(ids: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let (b, t) = ids.dims2()?;
    ids.eq(pad_token_id)?.reshape((b, 1, 1, t))
}

/// Token mask from a `[B, T]` attention mask where `1` means attend.
pub fn mask_from_attention(attention_mask: &Tensor) -> Result<Tensor> {
    let (b, t) = attention_mask.dims2()?;
    attention_mask.eq(0u32)?.reshape((b, 1, 1, t))
}

/// Causal mask of shape `[1, 1, T, T]`: position `i` may not see `j > i`.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)
}

/// Union of two broadcast-compatible masks.
pub fn combine_masks(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    a.broadcast_maximum(b)
}

/// Replace positions where `mask` is set with `value`.
pub fn masked_fill(xs: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let mask = mask.broadcast_as(xs.shape())?;
    let fill = Tensor::new(value, xs.device())?
        .to_dtype(xs.dtype())?
        .broadcast_as(xs.shape())?;
    mask.where_cond(&fill, xs)
}
