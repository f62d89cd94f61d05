//! Training loop example.
//!
//! Builds a small randomly-initialized model and runs a few AWP training
//! steps on a synthetic batch.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use matcha_tune::prelude::*;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let device = Device::Cpu;
    let config = BackboneConfig {
        hidden_size: 64,
        intermediate_size: 128,
        num_attention_heads: 4,
        num_hidden_layers: 4,
        num_decoder_layers: 4,
        vocab_size: 256,
        patch_embedding_dim: 18,
        max_patches: 128,
        max_length: 32,
        ..BackboneConfig::default()
    };
    let model = MatchaModel::from_config(config, &device)?;
    println!(
        "model ready: {} trainable parameters",
        model.trainable_vars().len()
    );

    let mut trainer = Trainer::builder()
        .learning_rate(1e-3)
        .awp(AwpSettings {
            adv_lr: 1.0,
            adv_eps: 1e-2,
            ..AwpSettings::default()
        })
        .build(model)?;

    let batch = synthetic_batch(&device)?;
    for step in 0..5 {
        let outcome = trainer.step(&batch)?;
        println!(
            "step {step}: loss = {:.4} (adversarial: {})",
            outcome.loss, outcome.adversarial
        );
    }

    Ok(())
}

/// A batch of 16 patches with (row, col) indices in the first two columns
/// and constant pixels, targeting a short label sequence.
fn synthetic_batch(device: &Device) -> Result<TrainBatch> {
    let patch_dim = 18;
    let num_patches = 16;
    let mut data = Vec::new();
    for p in 0..num_patches {
        data.push((p / 4) as f32);
        data.push((p % 4) as f32);
        data.extend(std::iter::repeat(0.5f32).take(patch_dim - 2));
    }
    let flattened_patches = Tensor::from_slice(&data, (1, num_patches, patch_dim), device)?;
    let attention_mask = Tensor::ones((1, num_patches), DType::F32, device)?;
    let labels = Tensor::from_slice(&[17i64, 42, 7, 99, -100, -100], (1, 6), device)?;
    Ok(TrainBatch {
        flattened_patches,
        attention_mask,
        labels,
    })
}
