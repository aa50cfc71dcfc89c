//! Map-style VQA datasets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::debug;

use super::annotations::{answer_weights, load_annotations, RecordLayout, VqaRecord};
use super::error::{DatasetError, Result};
use super::text::TextProcessor;
use crate::multimodal::ImageProcessor;

/// Random access over preprocessed samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, device: &Device) -> Result<VqaSample>;

    /// Upper bound on the image ids `get` returns: every id is below it.
    /// Defaults to one image per sample.
    fn num_images(&self) -> usize {
        self.len()
    }
}

/// Annotation format and sample construction for one dataset family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationFormat {
    /// OCR-VQA and TextVQA.
    OcrVqa,
    /// COCO-VQA and OK-VQA training data.
    CocoVqa,
    /// COCO-VQA and OK-VQA evaluation data; keeps the question id.
    CocoVqaEval,
    VqgCocoVqa,
    AokVqa,
    VqgAokVqa,
    Llava,
    DocVqa,
    StVqa,
}

impl AnnotationFormat {
    pub fn layout(self) -> RecordLayout {
        match self {
            Self::Llava => RecordLayout::Llava,
            _ => RecordLayout::QuestionAnswer,
        }
    }

    /// Question generation: the answer is the input and the question the target.
    pub fn is_question_generation(self) -> bool {
        matches!(self, Self::VqgCocoVqa | Self::VqgAokVqa)
    }
}

/// One preprocessed sample.
#[derive(Debug, Clone)]
pub struct VqaSample {
    /// `[3, S, S]` pixels.
    pub image: Tensor,
    pub text_input: String,
    pub text_output: String,
    pub answers: Vec<String>,
    pub weights: Vec<f32>,
    pub image_id: u32,
    pub question_id: Option<String>,
}

/// Questions and answers over a directory of images, loaded lazily.
pub struct VqaDataset {
    format: AnnotationFormat,
    records: Vec<VqaRecord>,
    image_ids: Vec<u32>,
    num_images: usize,
    vis_root: PathBuf,
    vis_processor: Arc<ImageProcessor>,
    text_processor: TextProcessor,
}

impl std::fmt::Debug for VqaDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VqaDataset")
            .field("format", &self.format)
            .field("len", &self.records.len())
            .field("vis_root", &self.vis_root)
            .finish()
    }
}

impl VqaDataset {
    /// Load every annotation file in order and concatenate the records.
    pub fn new(
        format: AnnotationFormat,
        ann_paths: &[PathBuf],
        vis_root: impl Into<PathBuf>,
        vis_processor: Arc<ImageProcessor>,
        text_processor: TextProcessor,
    ) -> Result<Self> {
        let mut records = Vec::new();
        for path in ann_paths {
            let loaded = load_annotations(path, format.layout())?;
            debug!(path = %path.display(), records = loaded.len(), "loaded annotations");
            records.extend(loaded);
        }
        Ok(Self::from_records(
            format,
            records,
            vis_root,
            vis_processor,
            text_processor,
        ))
    }

    pub fn from_records(
        format: AnnotationFormat,
        records: Vec<VqaRecord>,
        vis_root: impl Into<PathBuf>,
        vis_processor: Arc<ImageProcessor>,
        text_processor: TextProcessor,
    ) -> Self {
        let image_ids = assign_image_ids(&records);
        let num_images = image_ids.iter().max().map_or(0, |&id| id as usize + 1);
        Self {
            format,
            records,
            image_ids,
            num_images,
            vis_root: vis_root.into(),
            vis_processor,
            text_processor,
        }
    }

    pub fn format(&self) -> AnnotationFormat {
        self.format
    }

    pub fn vis_root(&self) -> &Path {
        &self.vis_root
    }

    pub fn records(&self) -> &[VqaRecord] {
        &self.records
    }

    /// Texts for `index` without touching the image file.
    pub fn texts(&self, index: usize) -> Result<(String, String, Vec<String>, Vec<f32>)> {
        let record = self.record(index)?;
        let question = self.text_processor.process(&record.question);
        let answers: Vec<String> = record
            .answers
            .iter()
            .map(|a| self.text_processor.process(a))
            .collect();
        let (answers, weights) = answer_weights(&answers);
        let best = best_answer(&answers, &weights).unwrap_or_default();
        let (input, output) = if self.format.is_question_generation() {
            (best, question)
        } else {
            (question, best)
        };
        Ok((input, output, answers, weights))
    }

    fn record(&self, index: usize) -> Result<&VqaRecord> {
        self.records.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.records.len(),
        })
    }
}

impl Dataset for VqaDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn num_images(&self) -> usize {
        self.num_images
    }

    fn get(&self, index: usize, device: &Device) -> Result<VqaSample> {
        let (text_input, text_output, answers, weights) = self.texts(index)?;
        let record = self.record(index)?;
        let image = self
            .vis_processor
            .load(&self.vis_root.join(&record.image), device)?;
        Ok(VqaSample {
            image,
            text_input,
            text_output,
            answers,
            weights,
            image_id: self.image_ids[index],
            question_id: record.question_id.clone(),
        })
    }
}

/// Ids by order of first appearance of each image path.
fn assign_image_ids(records: &[VqaRecord]) -> Vec<u32> {
    let mut seen: HashMap<&Path, u32> = HashMap::new();
    records
        .iter()
        .map(|r| {
            let next = seen.len() as u32;
            *seen.entry(r.image.as_path()).or_insert(next)
        })
        .collect()
}

/// Highest-weight answer; ties go to the first seen.
fn best_answer(answers: &[String], weights: &[f32]) -> Option<String> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &w) in weights.iter().enumerate() {
        if best.map_or(true, |(_, bw)| w > bw) {
            best = Some((i, w));
        }
    }
    best.and_then(|(i, _)| answers.get(i).cloned())
}

/// Several datasets viewed as one, in order.
///
/// Image ids of each part are shifted past the ids of the parts before it,
/// so images from different parts never share an id.
#[derive(Default)]
pub struct ConcatDataset {
    parts: Vec<Arc<dyn Dataset>>,
    offsets: Vec<usize>,
    id_offsets: Vec<u32>,
    len: usize,
    num_images: usize,
}

impl ConcatDataset {
    pub fn new(parts: Vec<Arc<dyn Dataset>>) -> Self {
        let mut offsets = Vec::with_capacity(parts.len());
        let mut id_offsets = Vec::with_capacity(parts.len());
        let mut len = 0;
        let mut num_images = 0;
        for part in &parts {
            offsets.push(len);
            id_offsets.push(num_images as u32);
            len += part.len();
            num_images += part.num_images();
        }
        Self {
            parts,
            offsets,
            id_offsets,
            len,
            num_images,
        }
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }
}

impl Dataset for ConcatDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn num_images(&self) -> usize {
        self.num_images
    }

    fn get(&self, index: usize, device: &Device) -> Result<VqaSample> {
        if index >= self.len {
            return Err(DatasetError::OutOfRange {
                index,
                len: self.len,
            });
        }
        let part = self.offsets.partition_point(|&start| start <= index) - 1;
        let mut sample = self.parts[part].get(index - self.offsets[part], device)?;
        sample.image_id += self.id_offsets[part];
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multimodal::ImageProcessorKind;
    use image::{ImageBuffer, Rgb};

    fn record(image: &str, question: &str, answers: &[&str]) -> VqaRecord {
        VqaRecord {
            image: PathBuf::from(image),
            question: question.to_string(),
            answers: answers.iter().map(|s| s.to_string()).collect(),
            question_id: Some("7".to_string()),
        }
    }

    fn processor() -> Arc<ImageProcessor> {
        Arc::new(ImageProcessor::new(ImageProcessorKind::BlipEval, 8))
    }

    fn write_image(dir: &Path, name: &str) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(12, 10, |x, y| Rgb([(x * 20) as u8, (y * 20) as u8, 128]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn vqa_uses_most_common_answer() {
        let ds = VqaDataset::from_records(
            AnnotationFormat::CocoVqa,
            vec![record("a.jpg", "What is it?", &["Dog", "cat", "dog"])],
            "/nowhere",
            processor(),
            TextProcessor::default(),
        );
        let (input, output, answers, weights) = ds.texts(0).unwrap();
        assert_eq!(input, "what is it?");
        assert_eq!(output, "dog");
        assert_eq!(answers, vec!["dog", "cat"]);
        assert!((weights[0] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn question_generation_swaps_roles() {
        let ds = VqaDataset::from_records(
            AnnotationFormat::VqgAokVqa,
            vec![record("a.jpg", "What color is the bus?", &["red"])],
            "/nowhere",
            processor(),
            TextProcessor::default(),
        );
        let (input, output, _, _) = ds.texts(0).unwrap();
        assert_eq!(input, "red");
        assert_eq!(output, "what color is the bus?");
    }

    #[test]
    fn image_ids_follow_first_appearance() {
        let records = vec![
            record("b.jpg", "q", &["x"]),
            record("a.jpg", "q", &["x"]),
            record("b.jpg", "q", &["y"]),
        ];
        assert_eq!(assign_image_ids(&records), vec![0, 1, 0]);
    }

    #[test]
    fn get_loads_image_lazily() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        let ds = VqaDataset::from_records(
            AnnotationFormat::OcrVqa,
            vec![record("a.png", "Who wrote this book?", &["Jane"])],
            dir.path(),
            processor(),
            TextProcessor::default(),
        );
        let sample = ds.get(0, &Device::Cpu).unwrap();
        assert_eq!(sample.image.dims(), &[3, 8, 8]);
        assert_eq!(sample.text_output, "jane");
        assert_eq!(sample.image_id, 0);
        assert!(matches!(
            ds.get(1, &Device::Cpu),
            Err(DatasetError::OutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn missing_image_is_processor_error() {
        let ds = VqaDataset::from_records(
            AnnotationFormat::OcrVqa,
            vec![record("gone.png", "q", &["a"])],
            "/nonexistent-root",
            processor(),
            TextProcessor::default(),
        );
        assert!(matches!(
            ds.get(0, &Device::Cpu),
            Err(DatasetError::Processor(_))
        ));
    }

    #[test]
    fn concat_routes_indices() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        let make = |answers: &[&str]| -> Arc<dyn Dataset> {
            Arc::new(VqaDataset::from_records(
                AnnotationFormat::OcrVqa,
                answers.iter().map(|a| record("a.png", "q", &[a])).collect(),
                dir.path(),
                processor(),
                TextProcessor::default(),
            ))
        };
        let concat = ConcatDataset::new(vec![make(&["one", "two"]), make(&[]), make(&["three"])]);
        assert_eq!(concat.len(), 3);
        assert_eq!(concat.num_parts(), 3);
        assert_eq!(concat.get(1, &Device::Cpu).unwrap().text_output, "two");
        assert_eq!(concat.get(2, &Device::Cpu).unwrap().text_output, "three");
        assert!(concat.get(3, &Device::Cpu).is_err());
    }

    #[test]
    fn concat_keeps_image_ids_distinct_across_parts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ocr.png", "textvqa.png", "shared.png"] {
            write_image(dir.path(), name);
        }
        let make = |images: &[&str]| -> Arc<dyn Dataset> {
            Arc::new(VqaDataset::from_records(
                AnnotationFormat::OcrVqa,
                images.iter().map(|i| record(i, "q", &["a"])).collect(),
                dir.path(),
                processor(),
                TextProcessor::default(),
            ))
        };
        let first = make(&["ocr.png", "shared.png", "ocr.png"]);
        let second = make(&["textvqa.png"]);
        assert_eq!(first.num_images(), 2);
        let concat = ConcatDataset::new(vec![first, make(&[]), second]);
        assert_eq!(concat.num_images(), 3);

        let ids: Vec<u32> = (0..concat.len())
            .map(|i| concat.get(i, &Device::Cpu).unwrap().image_id)
            .collect();
        // repeats within a part keep their shared id
        assert_eq!(ids, vec![0, 1, 0, 2]);

        let nested = ConcatDataset::new(vec![Arc::new(concat), make(&["ocr.png"])]);
        assert_eq!(nested.get(4, &Device::Cpu).unwrap().image_id, 3);
    }
}
