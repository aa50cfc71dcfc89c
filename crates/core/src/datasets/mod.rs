//! VQA datasets: configs, annotation parsing, builders and batching.

pub mod annotations;
pub mod builder;
pub mod builders;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod text;

pub use annotations::{RecordLayout, VqaRecord};
pub use builder::{BuildStrategy, DatasetBuilder, Split, VqaBuilder};
pub use builders::{find_builder, load_builder, supported_builders, BuilderInfo};
pub use config::{DatasetConfig, Storage, TextProcessorConfig};
pub use dataset::{AnnotationFormat, ConcatDataset, Dataset, VqaDataset, VqaSample};
pub use error::DatasetError;
pub use loader::{Batches, DataLoader, Samples};
pub use text::TextProcessor;
