//! BLIP-2 style vision-language pretraining with an MCAN fusion backbone.
//!
//! The implementation lives in [`daiv_core`]; this crate re-exports it so the
//! integration tests under `tests/` can exercise the public surface.

pub use daiv_core::*;
