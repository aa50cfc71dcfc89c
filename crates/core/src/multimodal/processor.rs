//! Image preprocessing for the vision encoder.
//!
//! Training transforms apply a random resized crop, a random horizontal flip
//! and a bicubic resize. Eval transforms only resize. Both normalize with the
//! CLIP mean and std and emit `[3, S, S]` f32 tensors.

use std::path::Path;
use std::sync::Mutex;

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Error type for image preprocessing.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("failed to load image {path}: {source}")]
    ImageLoad {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("unknown image processor '{0}'")]
    UnknownProcessor(String),
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Serialized processor settings, as found under `vis_processor.{train,eval}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessorConfig {
    pub name: String,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,
    #[serde(default = "default_max_scale")]
    pub max_scale: f32,
    #[serde(default)]
    pub mean: Option<[f32; 3]>,
    #[serde(default)]
    pub std: Option<[f32; 3]>,
}

fn default_image_size() -> usize {
    224
}

fn default_min_scale() -> f32 {
    0.5
}

fn default_max_scale() -> f32 {
    1.0
}

impl ImageProcessorConfig {
    pub fn named(name: &str, image_size: usize) -> Self {
        Self {
            name: name.to_string(),
            image_size,
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
            mean: None,
            std: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageProcessorKind {
    /// `blip_image_train`
    BlipTrain,
    /// `blip2_image_train`
    Blip2Train,
    /// `blip_image_eval`
    BlipEval,
}

impl ImageProcessorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blip_image_train" => Some(Self::BlipTrain),
            "blip2_image_train" => Some(Self::Blip2Train),
            "blip_image_eval" => Some(Self::BlipEval),
            _ => None,
        }
    }

    pub fn is_train(self) -> bool {
        !matches!(self, Self::BlipEval)
    }
}

/// Turns decoded images into normalized pixel tensors.
pub struct ImageProcessor {
    kind: ImageProcessorKind,
    image_size: usize,
    scale: (f32, f32),
    mean: [f32; 3],
    std: [f32; 3],
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for ImageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageProcessor")
            .field("kind", &self.kind)
            .field("image_size", &self.image_size)
            .field("scale", &self.scale)
            .finish()
    }
}

impl ImageProcessor {
    pub fn new(kind: ImageProcessorKind, image_size: usize) -> Self {
        Self {
            kind,
            image_size,
            scale: (default_min_scale(), default_max_scale()),
            mean: CLIP_MEAN,
            std: CLIP_STD,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_config(cfg: &ImageProcessorConfig) -> Result<Self, ProcessorError> {
        let kind = ImageProcessorKind::from_name(&cfg.name)
            .ok_or_else(|| ProcessorError::UnknownProcessor(cfg.name.clone()))?;
        Ok(Self {
            scale: (cfg.min_scale, cfg.max_scale),
            mean: cfg.mean.unwrap_or(CLIP_MEAN),
            std: cfg.std.unwrap_or(CLIP_STD),
            ..Self::new(kind, cfg.image_size)
        })
    }

    /// Reseed the augmentation RNG for reproducible crops and flips.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn kind(&self) -> ImageProcessorKind {
        self.kind
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Decode an image file and preprocess it.
    pub fn load(&self, path: &Path, device: &Device) -> Result<Tensor, ProcessorError> {
        let img = image::open(path).map_err(|source| ProcessorError::ImageLoad {
            path: path.display().to_string(),
            source,
        })?;
        self.process(&img, device)
    }

    /// Preprocess a decoded image into a `[3, S, S]` tensor.
    pub fn process(&self, img: &DynamicImage, device: &Device) -> Result<Tensor, ProcessorError> {
        let rgb = img.to_rgb8();
        let size = self.image_size as u32;
        let resized = if self.kind.is_train() {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            let (x, y, w, h) = self.random_crop_box(rgb.width(), rgb.height(), &mut *rng);
            let cropped = imageops::crop_imm(&rgb, x, y, w, h).to_image();
            let resized = imageops::resize(&cropped, size, size, FilterType::CatmullRom);
            if rng.gen_bool(0.5) {
                imageops::flip_horizontal(&resized)
            } else {
                resized
            }
        } else {
            imageops::resize(&rgb, size, size, FilterType::CatmullRom)
        };
        Ok(self.to_tensor(&resized, device)?)
    }

    /// Crop box `(x, y, w, h)` covering a random area fraction in `scale` with
    /// aspect ratio in `[3/4, 4/3]`. Falls back to the whole image.
    fn random_crop_box(&self, width: u32, height: u32, rng: &mut impl Rng) -> (u32, u32, u32, u32) {
        let area = width as f32 * height as f32;
        let (log_lo, log_hi) = ((3.0f32 / 4.0).ln(), (4.0f32 / 3.0).ln());
        let (lo, hi) = self.scale;
        for _ in 0..10 {
            let target = area * if hi > lo { rng.gen_range(lo..hi) } else { lo };
            let ratio = rng.gen_range(log_lo..log_hi).exp();
            let w = (target * ratio).sqrt().round() as u32;
            let h = (target / ratio).sqrt().round() as u32;
            if w > 0 && h > 0 && w <= width && h <= height {
                let x = rng.gen_range(0..=width - w);
                let y = rng.gen_range(0..=height - h);
                return (x, y, w, h);
            }
        }
        (0, 0, width, height)
    }

    fn to_tensor(&self, img: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let mut data = vec![0f32; 3 * w * h];
        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * w + x as usize;
            for c in 0..3 {
                let v = pixel.0[c] as f32 / 255.0;
                data[c * w * h + offset] = (v - self.mean[c]) / self.std[c];
            }
        }
        Tensor::from_vec(data, (3, h, w), device)
    }
}
