//! Model wrapper, backbone layers, and weight loading.
//!
//! Provides:
//! - Backbone configuration read from the pretrained model directory
//! - Vision encoder / text decoder built over `candle-nn`
//! - Non-strict SafeTensors checkpoint loading
//! - The `MatchaModel` wrapper applying freeze/resize/checkpoint policy

mod config;
mod decoder;
mod encoder;
mod layers;
mod loader;
mod matcha;

pub use config::BackboneConfig;
pub use decoder::TextDecoder;
pub use encoder::VisionEncoder;
pub use layers::{Attention, GatedGeluMlp, RmsNorm};
pub use loader::{CheckpointLoader, LoadReport};
pub use matcha::{MatchaModel, TrainBatch};
