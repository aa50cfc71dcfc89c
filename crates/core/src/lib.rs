pub mod config;
pub mod datasets;
pub mod distributed;
pub mod layers;
pub mod loader;
pub mod models;
pub mod multimodal;
pub mod sampling;
pub mod tokenizer;
pub mod train;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
