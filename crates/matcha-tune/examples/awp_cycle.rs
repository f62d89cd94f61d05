//! AWP cycle example.
//!
//! Drives one perturbation cycle by hand to show what the trainer does
//! internally: clean backward, attack, adversarial backward, restore.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use matcha_tune::prelude::*;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let device = Device::Cpu;
    let config = BackboneConfig {
        hidden_size: 32,
        intermediate_size: 64,
        num_attention_heads: 4,
        num_hidden_layers: 2,
        num_decoder_layers: 2,
        vocab_size: 128,
        patch_embedding_dim: 10,
        max_patches: 64,
        max_length: 16,
        ..BackboneConfig::default()
    };
    let model = MatchaModel::from_config(config, &device)?;

    let patch_dim = 10;
    let num_patches = 8;
    let mut data = Vec::new();
    for p in 0..num_patches {
        data.push((p / 4) as f32);
        data.push((p % 4) as f32);
        data.extend(std::iter::repeat(0.25f32).take(patch_dim - 2));
    }
    let batch = TrainBatch {
        flattened_patches: Tensor::from_slice(&data, (1, num_patches, patch_dim), &device)?,
        attention_mask: Tensor::ones((1, num_patches), DType::F32, &device)?,
        labels: Tensor::from_slice(&[3i64, 15, 27, -100], (1, 4), &device)?,
    };

    // Clean pass.
    let (loss, _) = model.forward(&batch.flattened_patches, &batch.attention_mask, &batch.labels)?;
    let grads = loss.backward()?;
    println!("clean loss = {:.4}", loss.to_scalar::<f32>()?);

    // One full save/attack/restore cycle. The adversarial loss is evaluated
    // under the perturbed weights; by the time attack_backward returns the
    // weights are back to their clean values.
    let mut awp = Awp::new(AwpSettings {
        adv_lr: 1.0,
        adv_eps: 1e-2,
        ..AwpSettings::default()
    });
    let adv_grads = awp.attack_backward(&model, &grads, &batch)?;
    println!("adversarial gradients produced: {}", adv_grads.is_some());
    println!("cycle open after return: {}", awp.cycle_in_progress());

    // The clean loss is unchanged because the weights were restored.
    let (loss_after, _) =
        model.forward(&batch.flattened_patches, &batch.attention_mask, &batch.labels)?;
    println!("clean loss after cycle = {:.4}", loss_after.to_scalar::<f32>()?);

    Ok(())
}
