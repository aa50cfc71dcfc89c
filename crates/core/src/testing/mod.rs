//! Shared test utilities for daiv-core.
//!
//! Tiny configs and a word-level tokenizer small enough to build a full
//! model on CPU in a unit test.

mod tiny_config;

pub use tiny_config::{test_tokenizer, tiny_blip2_config, tiny_vision_config, TEST_WORDS};
