use candle_core::{Result, Tensor};

/// Training losses. `loss` is the sum of the three objectives.
#[derive(Debug, Clone)]
pub struct Blip2Output {
    pub loss: Tensor,
    pub loss_itc: Tensor,
    pub loss_itm: Tensor,
    pub loss_lm: Tensor,
}

/// Host-side copy of [`Blip2Output`] for logging.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossValues {
    pub loss: f32,
    pub loss_itc: f32,
    pub loss_itm: f32,
    pub loss_lm: f32,
}

impl Blip2Output {
    pub fn values(&self) -> Result<LossValues> {
        let get = |t: &Tensor| t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>();
        Ok(LossValues {
            loss: get(&self.loss)?,
            loss_itc: get(&self.loss_itc)?,
            loss_itm: get(&self.loss_itm)?,
            loss_lm: get(&self.loss_lm)?,
        })
    }
}

impl LossValues {
    pub fn is_finite(&self) -> bool {
        [self.loss, self.loss_itc, self.loss_itm, self.loss_lm]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Features produced by `extract_features`. Fields not computed for the
/// requested mode are `None`.
#[derive(Debug, Clone, Default)]
pub struct Blip2OutputFeatures {
    /// `[B, N, H]` unimodal image tokens.
    pub image_embeds: Option<Tensor>,
    /// `[B, embed_dim]` normalized pooled image feature.
    pub image_embeds_proj: Option<Tensor>,
    /// `[B, T, H]` unimodal text tokens.
    pub text_embeds: Option<Tensor>,
    /// `[B, embed_dim]` normalized pooled text feature.
    pub text_embeds_proj: Option<Tensor>,
    /// `[B, N, H]` image tokens after text-guided fusion.
    pub multimodal_embeds: Option<Tensor>,
}
