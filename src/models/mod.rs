// Embedding models
// The trainer only sees `EmbeddingModel`; `Baseline` is the built-in network

pub mod baseline;
pub mod common;

pub use baseline::Baseline;
pub use common::{snapshot_parameters, EmbeddingModel, Mode, ModelOutput};
