//! # Matcha-Tune
//!
//! Adversarially-robust fine-tuning for Pix2Struct/Matcha-style
//! vision-language models.
//!
//! Matcha-Tune wraps a candle encoder-decoder backbone for fine-tuning:
//! - **Model wrapper**: decoder config overrides, non-strict checkpoint
//!   loading, encoder freezing, and vocabulary resizing at construction
//! - **AWP**: adversarial weight perturbation as a per-step training
//!   augmentation, one save/attack/restore cycle per optimizer step
//! - **Trainer**: an AdamW loop that feeds adversarial gradients to the
//!   optimizer whenever the perturbation is enabled
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use matcha_tune::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let device = candle_core::Device::Cpu;
//!     let settings = ModelSettings::from_file("model.json".as_ref())?;
//!     let model = MatchaModel::new(&settings, &device)?;
//!
//!     let mut trainer = Trainer::builder()
//!         .learning_rate(3e-5)
//!         .awp(AwpSettings::default())
//!         .build(model)?;
//!
//!     for batch in batches {
//!         let outcome = trainer.step(&batch)?;
//!         println!("loss = {}", outcome.loss);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use matcha_tune_core::*;

mod trainer;

pub use trainer::{StepOutcome, Trainer, TrainerBuilder, TrainerConfig};

/// Commonly used types.
pub mod prelude {
    pub use crate::trainer::{StepOutcome, Trainer, TrainerBuilder, TrainerConfig};
    pub use matcha_tune_core::{
        awp::{AdversarialTarget, Awp},
        config::{AwpSettings, ModelSettings},
        error::{MatchaTuneError, Result},
        model::{BackboneConfig, CheckpointLoader, LoadReport, MatchaModel, TrainBatch},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
