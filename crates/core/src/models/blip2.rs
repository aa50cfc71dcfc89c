//! BLIP-2 pretraining with an MCAN fusion backbone.
//!
//! Architecture:
//! - Vision encoder: EVA-CLIP / CLIP ViT (frozen by default) + `ln_vision`
//! - Projections into the MCAN hidden space: `vision_proj` and `text_proj`
//!   over MCAN's word embedding
//! - MCAN backbone shared by three objectives: contrastive alignment (ITC),
//!   image-text matching with hard negatives (ITM) and captioning (LM)
//!
//! The ITC and ITM objectives see the whole distributed batch through
//! [`concat_all_gather`] and [`all_gather_with_grad`].

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Init, Linear, VarBuilder, VarMap};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::losses::{
    cross_entropy_smoothed, diagonal_block_mask, itc_soft_targets, itm_labels, l2_normalize,
    lm_loss, masked_mean, same_id_mask, soft_cross_entropy,
};
use super::mcan::Mcan;
use super::outputs::{Blip2Output, Blip2OutputFeatures};
use super::ModelError;
use crate::config::ModelConfig;
use crate::datasets::Samples;
use crate::distributed::{all_gather_with_grad, concat_all_gather, DeviceCommunicator};
use crate::layers::{
    causal_mask, combine_masks, layer_norm, make_feature_mask, make_token_mask,
    mask_from_attention, masked_fill, LayerNorm,
};
use crate::multimodal::{VisionEncoder, VisionEncoderConfig};
use crate::sampling::{
    apply_repetition_penalty, log_softmax, sample, BeamSearchConfig, BeamSearchState,
    SamplerState, SamplingParams,
};
use crate::tokenizer::{BlipTokenizer, TextTokens};

const TEMP_INIT: f64 = 0.07;
const TEMP_MIN: f32 = 0.001;
const TEMP_MAX: f32 = 0.5;
const LABEL_SMOOTHING: f64 = 0.1;
/// Fill for positive pairs before softmax, so negatives are never positives.
const POSITIVE_FILL: f32 = -10000.0;
const LN_VISION_EPS: f64 = 1e-5;

// ─── Generation / Feature Options ───────────────────────────────────────────

/// Caption generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    /// Nucleus sampling instead of beam search. Forces a single beam.
    pub use_nucleus_sampling: bool,
    pub num_beams: usize,
    /// Maximum sequence length, BOS included.
    pub max_length: usize,
    /// EOS is suppressed until the sequence reaches this length.
    pub min_length: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            use_nucleus_sampling: false,
            num_beams: 3,
            max_length: 30,
            min_length: 10,
            top_p: 0.9,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

/// Which features `extract_features` computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureMode {
    Image,
    Text,
    Multimodal,
}

impl FromStr for FeatureMode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "text" => Ok(Self::Text),
            "multimodal" => Ok(Self::Multimodal),
            other => Err(ModelError::InvalidMode(other.to_string())),
        }
    }
}

// ─── Model ──────────────────────────────────────────────────────────────────

pub struct Blip2Mcan {
    tokenizer: Arc<BlipTokenizer>,
    visual_encoder: VisionEncoder,
    /// Parameters of a frozen, randomly initialized ViT. Kept out of the
    /// optimizer's map; `None` when the ViT is trainable or mmaped.
    frozen_vit: Option<VarMap>,
    ln_vision: LayerNorm,
    mcan: Mcan,
    vision_proj: Linear,
    text_proj: Linear,
    itm_head: Linear,
    lm_head: Linear,
    temp: Tensor,
    freeze_vit: bool,
    max_txt_len: usize,
    comm: Arc<dyn DeviceCommunicator>,
    rng: Mutex<StdRng>,
    training: AtomicBool,
    device: Device,
}

impl Blip2Mcan {
    /// Build the model. Trainable weights come from `vb`; a frozen ViT is
    /// loaded from `cfg.vit_weights` or kept in a private parameter map.
    pub fn new(
        cfg: &ModelConfig,
        tokenizer: Arc<BlipTokenizer>,
        vb: VarBuilder,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self, ModelError> {
        cfg.validate()?;
        if tokenizer.vocab_size() > cfg.vocab_size {
            return Err(ModelError::Config(format!(
                "tokenizer has {} tokens but vocab_size is {}",
                tokenizer.vocab_size(),
                cfg.vocab_size
            )));
        }
        let device = vb.device().clone();

        let vit_cfg = VisionEncoderConfig::from_model_config(cfg)?;
        let (visual_encoder, frozen_vit) = if cfg.freeze_vit {
            let vit_cfg = VisionEncoderConfig {
                drop_path_rate: 0.0,
                ..vit_cfg
            };
            let dtype = cfg.vit_precision.dtype();
            let (vb_vit, frozen) = match &cfg.vit_weights {
                Some(path) => {
                    info!(path = %path.display(), "loading vision encoder weights");
                    let vb_vit = crate::loader::resolve_weight_files(path)
                        .and_then(|files| crate::loader::load_weights(&files, dtype, &device))
                        .map_err(|e| ModelError::Checkpoint(e.to_string()))?;
                    (vb_vit, None)
                }
                None => {
                    let varmap = VarMap::new();
                    let vb_vit =
                        VarBuilder::from_varmap(&varmap, dtype, &device).pp("visual_encoder");
                    (vb_vit, Some(varmap))
                }
            };
            let encoder = VisionEncoder::new(&vit_cfg, vb_vit)?;
            info!(precision = ?cfg.vit_precision, "freeze vision encoder");
            (encoder, frozen)
        } else {
            (VisionEncoder::new(&vit_cfg, vb.pp("visual_encoder"))?, None)
        };
        if cfg.use_grad_checkpoint {
            warn!("gradient checkpointing is not supported, running without it");
        }

        let vit_hidden = visual_encoder.hidden_size();
        let hidden = cfg.mcan.hidden_size;
        let ln_vision = layer_norm(vit_hidden, LN_VISION_EPS, vb.pp("ln_vision"))?;
        let mcan = Mcan::new(&cfg.mcan, cfg.vocab_size, vb.pp("mcan"))?;
        let vision_proj = linear(vit_hidden, hidden, vb.pp("vision_proj"))?;
        let text_proj = linear(cfg.mcan.word_embed_size, hidden, vb.pp("text_proj"))?;
        let itm_head = linear(hidden, 2, vb.pp("itm_head"))?;
        let lm_head = linear(hidden, cfg.vocab_size, vb.pp("lm_head"))?;
        let temp = vb.get_with_hints((), "temp", Init::Const(TEMP_INIT))?;

        let rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(comm.rank() as u64));

        Ok(Self {
            tokenizer,
            visual_encoder,
            frozen_vit,
            ln_vision,
            mcan,
            vision_proj,
            text_proj,
            itm_head,
            lm_head,
            temp,
            freeze_vit: cfg.freeze_vit,
            max_txt_len: cfg.max_txt_len,
            comm,
            rng: Mutex::new(rng),
            training: AtomicBool::new(true),
            device,
        })
    }

    /// Build from config with trainable parameters in `varmap`, then load the
    /// configured checkpoint (finetuned when `load_finetuned`, else pretrained).
    pub fn from_config(
        cfg: &ModelConfig,
        tokenizer: Arc<BlipTokenizer>,
        varmap: &VarMap,
        device: &Device,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self, ModelError> {
        if super::registry::find_model(&cfg.arch).is_none() {
            return Err(ModelError::UnsupportedArchitecture(cfg.arch.clone()));
        }
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let model = Self::new(cfg, tokenizer, vb, comm)?;
        if let Some(path) = cfg.checkpoint_path() {
            let load = |map: &VarMap| {
                crate::loader::load_checkpoint(map, path)
                    .map_err(|e| ModelError::Checkpoint(e.to_string()))
            };
            load(varmap)?;
            if let Some(frozen) = &model.frozen_vit {
                load(frozen)?;
            }
        }
        Ok(model)
    }

    /// Enable or disable dropout, drop-path and trainable-ViT gradients.
    pub fn set_train(&self, train: bool) {
        self.training.store(train, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    pub fn tokenizer(&self) -> &BlipTokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn max_txt_len(&self) -> usize {
        self.max_txt_len
    }

    pub fn communicator(&self) -> &dyn DeviceCommunicator {
        self.comm.as_ref()
    }

    pub fn frozen_vision_params(&self) -> Option<&VarMap> {
        self.frozen_vit.as_ref()
    }

    /// Contrastive temperature clamped to `[0.001, 0.5]`.
    pub fn temperature(&self) -> candle_core::Result<Tensor> {
        self.temp.clamp(TEMP_MIN, TEMP_MAX)
    }

    // ─── Encoders ───────────────────────────────────────────────────────────

    /// `ln_vision(ViT(image))`: `[B, N, vit_hidden]` f32.
    pub fn vision_features(&self, image: &Tensor) -> candle_core::Result<Tensor> {
        let image = image.to_device(&self.device)?;
        let feats = if self.freeze_vit {
            self.visual_encoder.forward(&image, false)?.detach()
        } else {
            self.visual_encoder.forward(&image, self.is_training())?
        };
        self.ln_vision.forward(&feats)
    }

    /// Image tokens projected into the MCAN space: `[B, N, H]`.
    pub fn image_embeds(&self, image: &Tensor) -> candle_core::Result<Tensor> {
        self.vision_proj.forward(&self.vision_features(image)?)
    }

    fn text_embeds(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        self.text_proj.forward(&self.mcan.embed(ids)?)
    }

    /// Batches from different ranks must share a sequence length to be
    /// gathered, so multi-rank runs pad to `max_txt_len`.
    fn tokenize<S: AsRef<str>>(&self, texts: &[S]) -> Result<TextTokens, ModelError> {
        let tokens = if self.comm.world_size() > 1 {
            self.tokenizer
                .encode_batch_fixed(texts, self.max_txt_len, &self.device)
        } else {
            self.tokenizer
                .encode_batch(texts, self.max_txt_len, &self.device)
        };
        tokens.map_err(|e| ModelError::Tokenizer(e.to_string()))
    }

    /// Normalized pooled unimodal image feature: `[B, embed_dim]`.
    fn image_feature(
        &self,
        image_embeds: &Tensor,
        img_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let hidden = self
            .mcan
            .backbone
            .encode_image(image_embeds, Some(img_mask), train)?;
        l2_normalize(&self.mcan.attflat_img.forward(&hidden, Some(img_mask), train)?)
    }

    /// Normalized pooled unimodal text feature: `[B, embed_dim]`.
    fn text_feature(
        &self,
        text_embeds: &Tensor,
        text_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let hidden = self
            .mcan
            .backbone
            .encode_text(text_embeds, Some(text_mask), train)?;
        l2_normalize(&self.mcan.attflat_lang.forward(&hidden, Some(text_mask), train)?)
    }

    // ─── Pretraining ────────────────────────────────────────────────────────

    /// Compute the three pretraining losses for one batch.
    pub fn forward(&self, samples: &Samples) -> Result<Blip2Output, ModelError> {
        let image = samples
            .image
            .as_ref()
            .ok_or(ModelError::MissingInput("image"))?;
        if samples.text_input.is_empty() {
            return Err(ModelError::MissingInput("text_input"));
        }
        let bs = image.dim(0)?;
        if samples.text_input.len() != bs {
            return Err(ModelError::BatchMismatch {
                images: bs,
                texts: samples.text_input.len(),
            });
        }
        let train = self.is_training();
        let device = &self.device;
        let comm = self.comm.as_ref();
        let rank = comm.rank();

        let image_embeds = self.image_embeds(image)?;
        let img_mask = make_feature_mask(&image_embeds)?;
        let text = self.tokenize(&samples.text_input)?;
        let text_embeds = self.text_embeds(&text.input_ids)?;
        let text_mask = make_token_mask(&text.input_ids, self.tokenizer.pad_token_id())?;
        debug!(
            image_embeds = ?image_embeds.dims(),
            text_embeds = ?text_embeds.dims(),
            "forward inputs"
        );

        // Image-text contrastive
        let image_feats = self.image_feature(&image_embeds, &img_mask, train)?;
        let text_feat = self.text_feature(&text_embeds, &text_mask, train)?;
        let image_feats_all = concat_all_gather(comm, &image_feats)?;
        let text_feat_all = concat_all_gather(comm, &text_feat)?;

        let temp = self.temperature()?.reshape((1, 1))?;
        let sim_i2t = image_feats
            .matmul(&text_feat_all.t()?)?
            .broadcast_div(&temp)?;
        let sim_t2i = text_feat
            .matmul(&image_feats_all.t()?)?
            .broadcast_div(&temp)?;
        debug!(sim_i2t = ?sim_i2t.dims(), sim_t2i = ?sim_t2i.dims(), "similarities");

        let image_ids = match &samples.image_id {
            Some(ids) => {
                let ids = ids.to_device(device)?.flatten_all()?;
                let ids_all = concat_all_gather(comm, &ids)?;
                Some((ids, ids_all))
            }
            None => None,
        };
        let loss_itc = match &image_ids {
            Some((ids, ids_all)) => {
                let targets = itc_soft_targets(ids, ids_all)?;
                ((soft_cross_entropy(&sim_i2t, &targets)?
                    + soft_cross_entropy(&sim_t2i, &targets)?)?
                    / 2.0)?
            }
            None => {
                let start = (rank * bs) as u32;
                let targets = Tensor::arange(start, start + bs as u32, device)?;
                ((cross_entropy_smoothed(&sim_i2t, &targets, LABEL_SMOOTHING)?
                    + cross_entropy_smoothed(&sim_t2i, &targets, LABEL_SMOOTHING)?)?
                    / 2.0)?
            }
        };

        // Image-text matching
        let positives = match &image_ids {
            Some((ids, ids_all)) => same_id_mask(ids, ids_all)?,
            None => diagonal_block_mask(bs, sim_i2t.dim(1)?, rank * bs, device)?,
        };
        let loss_itm = self.itm_loss(
            &image_embeds,
            &text_embeds,
            &text_mask,
            &sim_i2t,
            &sim_t2i,
            &positives,
            train,
        )?;

        // Image-grounded captioning
        let loss_lm = self.caption_loss(&text.input_ids, &image_embeds, &img_mask, train)?;

        let loss = ((&loss_itc + &loss_itm)? + &loss_lm)?;
        Ok(Blip2Output {
            loss,
            loss_itc,
            loss_itm,
            loss_lm,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn itm_loss(
        &self,
        image_embeds: &Tensor,
        text_embeds: &Tensor,
        text_mask: &Tensor,
        sim_i2t: &Tensor,
        sim_t2i: &Tensor,
        positives: &Tensor,
        train: bool,
    ) -> Result<Tensor, ModelError> {
        let comm = self.comm.as_ref();
        let bs = image_embeds.dim(0)?;
        let device = &self.device;

        let text_embeds_world = concat_all_gather(comm, text_embeds)?;
        let text_mask_world = concat_all_gather(comm, text_mask)?;
        let image_embeds_world = all_gather_with_grad(comm, image_embeds)?;

        let weights_t2i = negative_weights(sim_t2i, positives)?;
        let weights_i2t = negative_weights(sim_i2t, positives)?;
        let (neg_images, neg_texts) = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            let neg_images: Vec<u32> = weights_t2i
                .iter()
                .map(|w| sample_negative(w, &mut *rng))
                .collect();
            let neg_texts: Vec<u32> = weights_i2t
                .iter()
                .map(|w| sample_negative(w, &mut *rng))
                .collect();
            (neg_images, neg_texts)
        };
        debug!(?neg_images, ?neg_texts, "sampled hard negatives");
        let neg_images = Tensor::new(neg_images.as_slice(), device)?;
        let neg_texts = Tensor::new(neg_texts.as_slice(), device)?;

        let image_embeds_neg = image_embeds_world.index_select(&neg_images, 0)?;
        let text_embeds_neg = text_embeds_world.index_select(&neg_texts, 0)?;
        let text_mask_neg = text_mask_world.index_select(&neg_texts, 0)?;

        let text_all = Tensor::cat(&[text_embeds, text_embeds, &text_embeds_neg], 0)?;
        let text_mask_all = Tensor::cat(&[text_mask, text_mask, &text_mask_neg], 0)?;
        let image_all = Tensor::cat(&[image_embeds, &image_embeds_neg, image_embeds], 0)?;
        let image_mask_all = make_feature_mask(&image_all)?;

        let (_, fused) = self.mcan.backbone.forward(
            &text_all,
            &image_all,
            Some(&text_mask_all),
            Some(&image_mask_all),
            train,
        )?;
        let logits = masked_mean(&self.itm_head.forward(&fused)?, &image_mask_all)?;
        debug!(itm_logits = ?logits.dims(), "matching logits");
        Ok(cross_entropy_smoothed(&logits, &itm_labels(bs, device)?, 0.0)?)
    }

    fn caption_loss(
        &self,
        input_ids: &Tensor,
        image_embeds: &Tensor,
        img_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor, ModelError> {
        let (b, t) = input_ids.dims2()?;
        let pad = self.tokenizer.pad_token_id();
        let bos = Tensor::full(self.tokenizer.bos_token_id(), (b, 1), &self.device)?;
        let decoder_ids = if t > 1 {
            Tensor::cat(&[&bos, &input_ids.narrow(1, 1, t - 1)?], 1)?
        } else {
            bos
        };
        let ignore = decoder_ids.eq(pad)?;
        let text_mask = combine_masks(
            &causal_mask(t, &self.device)?,
            &make_token_mask(&decoder_ids, pad)?,
        )?;
        let logits =
            self.decode_logits(&decoder_ids, &text_mask, image_embeds, img_mask, train)?;
        debug!(lm_logits = ?logits.dims(), "caption logits");
        Ok(lm_loss(&logits, &decoder_ids, &ignore, LABEL_SMOOTHING)?)
    }

    /// `[B, T, vocab]` next-token logits for `ids` conditioned on the image.
    fn decode_logits(
        &self,
        ids: &Tensor,
        text_mask: &Tensor,
        image_embeds: &Tensor,
        img_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let hidden = self.mcan.backbone.decode_text(
            &self.text_embeds(ids)?,
            Some(text_mask),
            image_embeds,
            Some(img_mask),
            train,
        )?;
        self.lm_head.forward(&hidden)
    }

    // ─── Generation ─────────────────────────────────────────────────────────

    /// Caption every image in `samples`.
    pub fn generate(
        &self,
        samples: &Samples,
        params: &GenerateParams,
    ) -> Result<Vec<String>, ModelError> {
        let image = samples
            .image
            .as_ref()
            .ok_or(ModelError::MissingInput("image"))?;
        let image_embeds = self.image_embeds(image)?.detach();
        let img_mask = make_feature_mask(&image_embeds)?;
        let mut sampler = SamplerState::new(params.seed);

        let mut captions = Vec::with_capacity(image_embeds.dim(0)?);
        for i in 0..image_embeds.dim(0)? {
            let embeds = image_embeds.narrow(0, i, 1)?;
            let mask = img_mask.narrow(0, i, 1)?;
            let ids = if params.use_nucleus_sampling {
                self.nucleus_caption(&embeds, &mask, params, &mut sampler)?
            } else {
                self.beam_caption(&embeds, &mask, params)?
            };
            captions.push(ids);
        }
        self.tokenizer
            .batch_decode(&captions, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))
    }

    /// Last-position logits for each sequence in `seqs` (all the same length).
    fn next_token_logits(
        &self,
        seqs: &[Vec<u32>],
        image_embeds: &Tensor,
        img_mask: &Tensor,
    ) -> candle_core::Result<Vec<Vec<f32>>> {
        let k = seqs.len();
        let t = seqs.first().map_or(0, Vec::len);
        let flat: Vec<u32> = seqs.iter().flatten().copied().collect();
        let ids = Tensor::from_vec(flat, (k, t), &self.device)?;
        let (_, n, h) = image_embeds.dims3()?;
        let image = image_embeds.broadcast_as((k, n, h))?.contiguous()?;
        let mask = img_mask.broadcast_as((k, 1, 1, n))?.contiguous()?;

        let logits = self.decode_logits(&ids, &causal_mask(t, &self.device)?, &image, &mask, false)?;
        logits
            .narrow(1, t - 1, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()
    }

    fn beam_caption(
        &self,
        image_embeds: &Tensor,
        img_mask: &Tensor,
        params: &GenerateParams,
    ) -> candle_core::Result<Vec<u32>> {
        let bos = self.tokenizer.bos_token_id();
        let eos = self.tokenizer.sep_token_id();
        let config = BeamSearchConfig {
            beam_width: params.num_beams.max(1),
            ..Default::default()
        };
        let mut state = BeamSearchState::new(config, eos);

        let mut cur_len = 1;
        while cur_len < params.max_length && !state.beams.is_empty() {
            let seqs: Vec<Vec<u32>> = state
                .beams
                .iter()
                .map(|b| std::iter::once(bos).chain(b.token_ids.iter().copied()).collect())
                .collect();
            let logits = self.next_token_logits(&seqs, image_embeds, img_mask)?;
            let log_probs: Vec<Vec<f32>> = logits
                .into_iter()
                .zip(&seqs)
                .map(|(mut row, seq)| {
                    if params.repetition_penalty != 1.0 {
                        apply_repetition_penalty(&mut row, seq, params.repetition_penalty);
                    }
                    let mut lp = log_softmax(&row);
                    if cur_len < params.min_length {
                        suppress(&mut lp, eos);
                    }
                    lp
                })
                .collect();
            state.step(&log_probs);
            cur_len += 1;
            if state.is_done() {
                break;
            }
        }

        let mut ids = vec![bos];
        if let Some(best) = state.best() {
            ids.extend_from_slice(&best.token_ids);
        }
        Ok(ids)
    }

    fn nucleus_caption(
        &self,
        image_embeds: &Tensor,
        img_mask: &Tensor,
        params: &GenerateParams,
        sampler: &mut SamplerState,
    ) -> candle_core::Result<Vec<u32>> {
        let eos = self.tokenizer.sep_token_id();
        let sampling = SamplingParams::nucleus(params.top_p, params.repetition_penalty);
        let mut ids = vec![self.tokenizer.bos_token_id()];
        while ids.len() < params.max_length {
            let logits = self.next_token_logits(std::slice::from_ref(&ids), image_embeds, img_mask)?;
            let Some(mut row) = logits.into_iter().next() else {
                break;
            };
            if ids.len() < params.min_length {
                suppress(&mut row, eos);
            }
            let token = sample(&row, &sampling, &ids, sampler);
            ids.push(token);
            if token == eos {
                break;
            }
        }
        Ok(ids)
    }

    // ─── Inference Helpers ──────────────────────────────────────────────────

    /// Unimodal image pass. Returns `(fused image tokens [B, N, H],
    /// projected image embeds [B, N, H])`.
    pub fn forward_image(&self, image: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let image_embeds = self.image_embeds(image)?;
        let img_mask = make_feature_mask(&image_embeds)?;
        let hidden = self
            .mcan
            .backbone
            .encode_image(&image_embeds, Some(&img_mask), false)?;
        Ok((hidden, image_embeds))
    }

    /// Unimodal text pass. Returns the first token's hidden state `[B, H]`.
    pub fn forward_text(&self, tokens: &TextTokens) -> candle_core::Result<Tensor> {
        let ids = tokens.input_ids.to_device(&self.device)?;
        let mask = mask_from_attention(&tokens.attention_mask.to_device(&self.device)?)?;
        let hidden = self
            .mcan
            .backbone
            .encode_text(&self.text_embeds(&ids)?, Some(&mask), false)?;
        hidden.narrow(1, 0, 1)?.squeeze(1)
    }

    /// Matching score for image/text pairs.
    ///
    /// `image_inputs`: `[B, N, vit_hidden]` output of [`Self::vision_features`].
    /// Returns the class-1 logit averaged over valid image tokens, `[B]`.
    pub fn compute_itm(
        &self,
        image_inputs: &Tensor,
        text_ids: &Tensor,
        text_atts: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let image_embeds = self.vision_proj.forward(image_inputs)?;
        let img_mask = make_feature_mask(&image_embeds)?;
        let text_embeds = self.text_embeds(text_ids)?;
        let text_mask = mask_from_attention(text_atts)?;
        let (_, fused) = self.mcan.backbone.forward(
            &text_embeds,
            &image_embeds,
            Some(&text_mask),
            Some(&img_mask),
            false,
        )?;
        let logits = masked_mean(&self.itm_head.forward(&fused)?, &img_mask)?;
        logits.narrow(1, 1, 1)?.squeeze(1)
    }

    /// ITC-space image features. Returns `(vision_features, feat [B, E])`.
    pub fn image_feats(&self, image: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let inputs = self.vision_features(image)?;
        let image_embeds = self.vision_proj.forward(&inputs)?;
        let img_mask = make_feature_mask(&image_embeds)?;
        let feat = self.image_feature(&image_embeds, &img_mask, false)?;
        Ok((inputs, feat))
    }

    /// ITC-space text features, `[B, E]`.
    pub fn text_feats(&self, tokens: &TextTokens) -> candle_core::Result<Tensor> {
        let ids = tokens.input_ids.to_device(&self.device)?;
        let mask = mask_from_attention(&tokens.attention_mask.to_device(&self.device)?)?;
        self.text_feature(&self.text_embeds(&ids)?, &mask, false)
    }

    /// Extract unimodal or multimodal features for `mode`
    /// (`image`, `text` or `multimodal`).
    pub fn extract_features(
        &self,
        samples: &Samples,
        mode: &str,
    ) -> Result<Blip2OutputFeatures, ModelError> {
        let mode: FeatureMode = mode.parse()?;
        let image = samples.image.as_ref();
        let texts = &samples.text_input;
        let mut features = Blip2OutputFeatures::default();

        match mode {
            FeatureMode::Image => {
                let image = image.ok_or(ModelError::MissingInput("image"))?;
                let image_embeds = self.image_embeds(image)?.detach();
                let img_mask = make_feature_mask(&image_embeds)?;
                let hidden = self
                    .mcan
                    .backbone
                    .encode_image(&image_embeds, Some(&img_mask), false)?;
                let pooled = self.mcan.attflat_img.forward(&hidden, Some(&img_mask), false)?;
                features.image_embeds_proj = Some(l2_normalize(&pooled)?.detach());
                features.image_embeds = Some(hidden.detach());
            }
            FeatureMode::Text => {
                if texts.is_empty() {
                    return Err(ModelError::MissingInput("text_input"));
                }
                let tokens = self.tokenize(texts)?;
                let mask = make_token_mask(&tokens.input_ids, self.tokenizer.pad_token_id())?;
                let hidden = self.mcan.backbone.encode_text(
                    &self.text_embeds(&tokens.input_ids)?,
                    Some(&mask),
                    false,
                )?;
                let pooled = self.mcan.attflat_lang.forward(&hidden, Some(&mask), false)?;
                features.text_embeds_proj = Some(l2_normalize(&pooled)?.detach());
                features.text_embeds = Some(hidden.detach());
            }
            FeatureMode::Multimodal => {
                let image = image.ok_or(ModelError::MissingInput("image"))?;
                if texts.is_empty() {
                    return Err(ModelError::MissingInput("text_input"));
                }
                let image_embeds = self.image_embeds(image)?.detach();
                let img_mask = make_feature_mask(&image_embeds)?;
                let tokens = self.tokenize(texts)?;
                let mask = make_token_mask(&tokens.input_ids, self.tokenizer.pad_token_id())?;
                let (_, fused) = self.mcan.backbone.forward(
                    &self.text_embeds(&tokens.input_ids)?,
                    &image_embeds,
                    Some(&mask),
                    Some(&img_mask),
                    false,
                )?;
                features.multimodal_embeds = Some(fused.detach());
            }
        }
        Ok(features)
    }
}

/// Softmax over similarities with positives pushed to `POSITIVE_FILL`,
/// copied to the host for sampling.
fn negative_weights(sim: &Tensor, positives: &Tensor) -> candle_core::Result<Vec<Vec<f32>>> {
    let masked = masked_fill(&sim.detach(), positives, POSITIVE_FILL)?;
    candle_nn::ops::softmax(&masked, 1)?.to_vec2::<f32>()
}

/// Draw an index proportionally to `weights`; uniform if they are degenerate.
fn sample_negative<R: Rng>(weights: &[f32], rng: &mut R) -> u32 {
    match WeightedIndex::new(weights) {
        Ok(dist) => dist.sample(rng) as u32,
        Err(_) => rng.gen_range(0..weights.len().max(1)) as u32,
    }
}

fn suppress(row: &mut [f32], token: u32) {
    if let Some(v) = row.get_mut(token as usize) {
        *v = f32::NEG_INFINITY;
    }
}
