//! # Matcha-Tune Core
//!
//! Fine-tuning primitives for Pix2Struct/Matcha-style vision-language models.
//!
//! This crate provides:
//! - **Model wrapper** around a candle encoder-decoder backbone with
//!   construction-time layer freezing, vocabulary resizing, and non-strict
//!   checkpoint loading
//! - **AWP controller** implementing one save/attack/restore cycle of
//!   adversarial weight perturbation per training step
//! - **Checkpoint loader** for SafeTensors weight files

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod awp;
pub mod config;
pub mod error;
pub mod model;

pub use error::{MatchaTuneError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::awp::{AdversarialTarget, Awp};
    pub use crate::config::{AwpSettings, ModelSettings};
    pub use crate::error::{MatchaTuneError, Result};
    pub use crate::model::{BackboneConfig, CheckpointLoader, MatchaModel, TrainBatch};
}
