//! Multimodal co-attention network (MCAN).
//!
//! Encoder-decoder stack of self-attention (SA) blocks over the language and
//! self-guided-attention (SGA) blocks over the image, plus attention-flattening
//! heads that pool each stream to a single vector.
//!
//! Weight names follow the layout `embedding`, `backbone.enc_list.{i}`,
//! `backbone.dec_list.{i}`, `attflat_img`, `attflat_lang`.

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder};

use crate::config::McanConfig;
use crate::layers::{masked_fill, std_layer_norm, Mlp, StdLayerNorm};

const MASK_FILL: f32 = -1e9;

// ─── Multi-head Attention ────────────────────────────────────────────────────

pub struct MhAtt {
    linear_v: Linear,
    linear_k: Linear,
    linear_q: Linear,
    linear_merge: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl MhAtt {
    pub fn new(cfg: &McanConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            linear_v: candle_nn::linear(h, h, vb.pp("linear_v"))?,
            linear_k: candle_nn::linear(h, h, vb.pp("linear_k"))?,
            linear_q: candle_nn::linear(h, h, vb.pp("linear_q"))?,
            linear_merge: candle_nn::linear(h, h, vb.pp("linear_merge"))?,
            dropout: Dropout::new(cfg.dropout),
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `mask` is `u8`, broadcastable to `[B, heads, Lq, Lk]`, set where keys
    /// must be ignored.
    pub fn forward(
        &self,
        v: &Tensor,
        k: &Tensor,
        q: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, lq, _) = q.dims3()?;
        let v = self.split_heads(&self.linear_v.forward(v)?)?;
        let k = self.split_heads(&self.linear_k.forward(k)?)?;
        let q = self.split_heads(&self.linear_q.forward(q)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        if let Some(mask) = mask {
            scores = masked_fill(&scores, mask, MASK_FILL)?;
        }
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let att = self.dropout.forward_t(&att, train)?;

        let out = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, lq, self.num_heads * self.head_dim))?;
        self.linear_merge.forward(&out)
    }
}

// ─── Feed Forward ────────────────────────────────────────────────────────────

pub struct Ffn {
    mlp: Mlp,
}

impl Ffn {
    pub fn new(cfg: &McanConfig, vb: VarBuilder) -> Result<Self> {
        let mlp = Mlp::new(
            cfg.hidden_size,
            cfg.ff_size,
            cfg.hidden_size,
            cfg.dropout,
            true,
            vb.pp("mlp"),
        )?;
        Ok(Self { mlp })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.mlp.forward_t(xs, train)
    }
}

/// `norm(xs + dropout(branch))`
struct Residual {
    dropout: Dropout,
    norm: StdLayerNorm,
}

impl Residual {
    fn new(cfg: &McanConfig, idx: usize, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            dropout: Dropout::new(cfg.dropout),
            norm: std_layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp(format!("norm{idx}")))?,
        })
    }

    fn forward(&self, xs: &Tensor, branch: &Tensor, train: bool) -> Result<Tensor> {
        let branch = self.dropout.forward_t(branch, train)?;
        self.norm.forward(&(xs + branch)?)
    }
}

// ─── Self Attention ──────────────────────────────────────────────────────────

pub struct SelfAttention {
    mhatt: MhAtt,
    ffn: Ffn,
    res1: Residual,
    res2: Residual,
}

impl SelfAttention {
    pub fn new(cfg: &McanConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            mhatt: MhAtt::new(cfg, vb.pp("mhatt"))?,
            ffn: Ffn::new(cfg, vb.pp("ffn"))?,
            res1: Residual::new(cfg, 1, &vb)?,
            res2: Residual::new(cfg, 2, &vb)?,
        })
    }

    pub fn forward(&self, x: &Tensor, x_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let att = self.mhatt.forward(x, x, x, x_mask, train)?;
        let x = self.res1.forward(x, &att, train)?;
        let ff = self.ffn.forward(&x, train)?;
        self.res2.forward(&x, &ff, train)
    }
}

// ─── Self Guided Attention ───────────────────────────────────────────────────

pub struct SelfGuidedAttention {
    mhatt1: MhAtt,
    mhatt2: MhAtt,
    ffn: Ffn,
    res1: Residual,
    res2: Residual,
    res3: Residual,
}

impl SelfGuidedAttention {
    pub fn new(cfg: &McanConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            mhatt1: MhAtt::new(cfg, vb.pp("mhatt1"))?,
            mhatt2: MhAtt::new(cfg, vb.pp("mhatt2"))?,
            ffn: Ffn::new(cfg, vb.pp("ffn"))?,
            res1: Residual::new(cfg, 1, &vb)?,
            res2: Residual::new(cfg, 2, &vb)?,
            res3: Residual::new(cfg, 3, &vb)?,
        })
    }

    /// Self-attend `x`, then attend from `x` into the guide `y`.
    pub fn forward(
        &self,
        x: &Tensor,
        y: &Tensor,
        x_mask: Option<&Tensor>,
        y_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let att = self.mhatt1.forward(x, x, x, x_mask, train)?;
        let x = self.res1.forward(x, &att, train)?;
        let guided = self.mhatt2.forward(y, y, &x, y_mask, train)?;
        let x = self.res2.forward(&x, &guided, train)?;
        let ff = self.ffn.forward(&x, train)?;
        self.res3.forward(&x, &ff, train)
    }

    /// Same block with the guided branch skipped.
    pub fn forward_unguided(
        &self,
        x: &Tensor,
        x_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let att = self.mhatt1.forward(x, x, x, x_mask, train)?;
        let x = self.res1.forward(x, &att, train)?;
        let ff = self.ffn.forward(&x, train)?;
        self.res3.forward(&x, &ff, train)
    }
}

// ─── Encoder-Decoder Backbone ────────────────────────────────────────────────

pub struct McaEncoderDecoder {
    enc_list: Vec<SelfAttention>,
    dec_list: Vec<SelfGuidedAttention>,
}

impl McaEncoderDecoder {
    pub fn new(cfg: &McanConfig, vb: VarBuilder) -> Result<Self> {
        let enc_list = (0..cfg.num_layers)
            .map(|i| SelfAttention::new(cfg, vb.pp("enc_list").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let dec_list = (0..cfg.num_layers)
            .map(|i| SelfGuidedAttention::new(cfg, vb.pp("dec_list").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { enc_list, dec_list })
    }

    /// Encode the language, then decode the image guided by it.
    /// Returns `(lang, img)` with unchanged shapes.
    pub fn forward(
        &self,
        lang: &Tensor,
        img: &Tensor,
        lang_mask: Option<&Tensor>,
        img_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let lang = self.encode_text(lang, lang_mask, train)?;
        let mut img = img.clone();
        for dec in &self.dec_list {
            img = dec.forward(&img, &lang, img_mask, lang_mask, train)?;
        }
        Ok((lang, img))
    }

    /// Language-only pass through the SA stack.
    pub fn encode_text(&self, lang: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut lang = lang.clone();
        for enc in &self.enc_list {
            lang = enc.forward(&lang, mask, train)?;
        }
        Ok(lang)
    }

    /// Image-only pass through the SGA stack without guidance.
    pub fn encode_image(&self, img: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut img = img.clone();
        for dec in &self.dec_list {
            img = dec.forward_unguided(&img, mask, train)?;
        }
        Ok(img)
    }

    /// Text as queries through the SGA stack, cross-attending the image.
    /// `text_mask` should combine the causal and padding masks.
    pub fn decode_text(
        &self,
        text: &Tensor,
        text_mask: Option<&Tensor>,
        img: &Tensor,
        img_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut text = text.clone();
        for dec in &self.dec_list {
            text = dec.forward(&text, img, text_mask, img_mask, train)?;
        }
        Ok(text)
    }
}

// ─── Attention Flattening ────────────────────────────────────────────────────

/// Pools a sequence to one vector with learned glimpse attention.
pub struct AttFlat {
    mlp: Mlp,
    linear_merge: Linear,
    glimpses: usize,
}

impl AttFlat {
    pub fn new(cfg: &McanConfig, vb: VarBuilder) -> Result<Self> {
        let mlp = Mlp::new(
            cfg.hidden_size,
            cfg.flat_mlp_size,
            cfg.flat_glimpses,
            cfg.dropout,
            true,
            vb.pp("mlp"),
        )?;
        let linear_merge = candle_nn::linear(
            cfg.hidden_size * cfg.flat_glimpses,
            cfg.flat_out_size,
            vb.pp("linear_merge"),
        )?;
        Ok(Self {
            mlp,
            linear_merge,
            glimpses: cfg.flat_glimpses,
        })
    }

    /// `xs`: `[B, N, H]`, `mask`: `[B, 1, 1, N]`. Returns `[B, flat_out]`.
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut att = self.mlp.forward_t(xs, train)?;
        if let Some(mask) = mask {
            let (b, n, _) = xs.dims3()?;
            let mask = mask.reshape((b, n, 1))?;
            att = masked_fill(&att, &mask, MASK_FILL)?;
        }
        let att = candle_nn::ops::softmax(&att, 1)?;

        let pooled = (0..self.glimpses)
            .map(|g| {
                att.narrow(D::Minus1, g, 1)?
                    .broadcast_mul(xs)?
                    .sum(1)
            })
            .collect::<Result<Vec<_>>>()?;
        let pooled = Tensor::cat(&pooled, D::Minus1)?;
        self.linear_merge.forward(&pooled)
    }
}

// ─── Network ─────────────────────────────────────────────────────────────────

/// Word embedding, backbone and the two pooling heads.
pub struct Mcan {
    pub embedding: Embedding,
    pub backbone: McaEncoderDecoder,
    pub attflat_img: AttFlat,
    pub attflat_lang: AttFlat,
}

impl Mcan {
    pub fn new(cfg: &McanConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedding: candle_nn::embedding(vocab_size, cfg.word_embed_size, vb.pp("embedding"))?,
            backbone: McaEncoderDecoder::new(cfg, vb.pp("backbone"))?,
            attflat_img: AttFlat::new(cfg, vb.pp("attflat_img"))?,
            attflat_lang: AttFlat::new(cfg, vb.pp("attflat_lang"))?,
        })
    }

    /// `[B, T]` ids to `[B, T, word_embed]`.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{causal_mask, combine_masks, make_token_mask};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny() -> McanConfig {
        McanConfig {
            hidden_size: 16,
            dropout: 0.1,
            num_heads: 4,
            ff_size: 32,
            num_layers: 2,
            flat_mlp_size: 16,
            flat_glimpses: 2,
            flat_out_size: 8,
            word_embed_size: 12,
            layer_norm_eps: 1e-6,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn backbone_shapes() {
        let cfg = tiny();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let backbone = McaEncoderDecoder::new(&cfg, vb).unwrap();

        let lang = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
        let img = Tensor::randn(0f32, 1.0, (2, 7, 16), &Device::Cpu).unwrap();
        let (l, i) = backbone.forward(&lang, &img, None, None, false).unwrap();
        assert_eq!(l.dims(), &[2, 5, 16]);
        assert_eq!(i.dims(), &[2, 7, 16]);

        let t = backbone.decode_text(&lang, None, &img, None, false).unwrap();
        assert_eq!(t.dims(), &[2, 5, 16]);
        let u = backbone.encode_image(&img, None, false).unwrap();
        assert_eq!(u.dims(), &[2, 7, 16]);
    }

    #[test]
    fn attflat_ignores_masked_positions() {
        let cfg = tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let flat = AttFlat::new(&cfg, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (1, 4, 16), &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[5u32, 6, 0, 0]], &Device::Cpu).unwrap();
        let mask = make_token_mask(&ids, 0).unwrap();
        let out = flat.forward(&xs, Some(&mask), false).unwrap();
        assert_eq!(out.dims(), &[1, 8]);

        // perturb only the padded rows
        let noise = Tensor::cat(
            &[
                Tensor::zeros((1, 2, 16), DType::F32, &Device::Cpu).unwrap(),
                Tensor::ones((1, 2, 16), DType::F32, &Device::Cpu).unwrap(),
            ],
            1,
        )
        .unwrap();
        let out2 = flat
            .forward(&(&xs + noise).unwrap(), Some(&mask), false)
            .unwrap();
        assert!(max_abs_diff(&out, &out2) < 1e-5);
    }

    #[test]
    fn decode_text_is_causal() {
        let cfg = tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = McaEncoderDecoder::new(&cfg, vb).unwrap();

        let text = Tensor::randn(0f32, 1.0, (1, 4, 16), &Device::Cpu).unwrap();
        let img = Tensor::randn(0f32, 1.0, (1, 3, 16), &Device::Cpu).unwrap();
        let mask = causal_mask(4, &Device::Cpu).unwrap();
        let a = backbone.decode_text(&text, Some(&mask), &img, None, false).unwrap();

        // change the last token only
        let changed = Tensor::cat(
            &[
                text.narrow(1, 0, 3).unwrap(),
                Tensor::ones((1, 1, 16), DType::F32, &Device::Cpu).unwrap(),
            ],
            1,
        )
        .unwrap();
        let b = backbone.decode_text(&changed, Some(&mask), &img, None, false).unwrap();
        let prefix_a = a.narrow(1, 0, 3).unwrap();
        let prefix_b = b.narrow(1, 0, 3).unwrap();
        assert!(max_abs_diff(&prefix_a, &prefix_b) < 1e-5);
        assert!(max_abs_diff(&a, &b) > 1e-6);
    }

    #[test]
    fn padding_mask_isolates_text_encoder() {
        let cfg = tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = McaEncoderDecoder::new(&cfg, vb).unwrap();

        let ids = Tensor::new(&[[2u32, 7, 3, 0]], &Device::Cpu).unwrap();
        let pad = make_token_mask(&ids, 0).unwrap();
        let combined = combine_masks(&causal_mask(4, &Device::Cpu).unwrap(), &pad).unwrap();
        assert_eq!(combined.dims(), &[1, 1, 4, 4]);

        let lang = Tensor::randn(0f32, 1.0, (1, 4, 16), &Device::Cpu).unwrap();
        let a = backbone.encode_text(&lang, Some(&pad), false).unwrap();
        let noisy = Tensor::cat(
            &[
                lang.narrow(1, 0, 3).unwrap(),
                Tensor::full(5f32, (1, 1, 16), &Device::Cpu).unwrap(),
            ],
            1,
        )
        .unwrap();
        let b = backbone.encode_text(&noisy, Some(&pad), false).unwrap();
        assert!(max_abs_diff(&a.narrow(1, 0, 3).unwrap(), &b.narrow(1, 0, 3).unwrap()) < 1e-5);
    }

    #[test]
    fn embedding_shape() {
        let cfg = tiny();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mcan = Mcan::new(&cfg, 20, vb).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        assert_eq!(mcan.embed(&ids).unwrap().dims(), &[1, 3, 12]);
    }
}
