//! Image side of the model: preprocessing and the vision transformer.
//!
//! ```ignore
//! use daiv_core::multimodal::{ImageProcessor, ImageProcessorKind};
//!
//! let proc = ImageProcessor::new(ImageProcessorKind::BlipEval, 224);
//! let pixels = proc.load(path, &device)?; // [3, 224, 224]
//! ```

mod processor;
mod vision;

pub use processor::{
    ImageProcessor, ImageProcessorConfig, ImageProcessorKind, ProcessorError, CLIP_MEAN, CLIP_STD,
};
pub use vision::{VisionEncoder, VisionEncoderConfig, VisionEncoderType};
