//! High-level training loop.

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use matcha_tune_core::awp::Awp;
use matcha_tune_core::config::AwpSettings;
use matcha_tune_core::error::Result;
use matcha_tune_core::model::{MatchaModel, TrainBatch};
use std::collections::HashMap;
use std::path::Path;

/// Configuration for the trainer.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// AdamW learning rate.
    pub learning_rate: f64,
    /// AdamW decoupled weight decay.
    pub weight_decay: f64,
    /// Perturbation settings. `adv_lr == 0` disables the attack, turning
    /// every step into a plain AdamW step.
    pub awp: AwpSettings,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-5,
            weight_decay: 0.0,
            awp: AwpSettings::default(),
        }
    }
}

/// Builder for creating a Trainer.
pub struct TrainerBuilder {
    config: TrainerConfig,
}

impl TrainerBuilder {
    /// Create a new trainer builder.
    pub fn new() -> Self {
        Self {
            config: TrainerConfig::default(),
        }
    }

    /// Set the AdamW learning rate.
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.config.learning_rate = lr;
        self
    }

    /// Set the AdamW weight decay.
    pub fn weight_decay(mut self, decay: f64) -> Self {
        self.config.weight_decay = decay;
        self
    }

    /// Set the perturbation settings.
    pub fn awp(mut self, settings: AwpSettings) -> Self {
        self.config.awp = settings;
        self
    }

    /// Build the trainer around a model.
    ///
    /// The optimizer is created over the model's trainable parameters only;
    /// frozen encoder parameters never receive updates.
    pub fn build(self, model: MatchaModel) -> Result<Trainer> {
        let vars = model.trainable_vars().into_iter().map(|(_, v)| v).collect();
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: self.config.learning_rate,
                weight_decay: self.config.weight_decay,
                ..Default::default()
            },
        )?;
        let awp = Awp::new(self.config.awp.clone());

        tracing::info!(
            lr = self.config.learning_rate,
            adv_lr = self.config.awp.adv_lr,
            "trainer ready"
        );
        Ok(Trainer {
            config: self.config,
            model,
            optimizer,
            awp,
        })
    }
}

impl Default for TrainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single training step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Total training loss on the clean (unperturbed) weights.
    pub loss: f32,
    /// Per-component loss values.
    pub breakdown: HashMap<String, f32>,
    /// Whether the optimizer stepped with adversarial gradients.
    pub adversarial: bool,
}

/// AdamW training loop with optional adversarial weight perturbation.
///
/// Single-threaded by construction: the perturbation window inside
/// [`Trainer::step`] mutates the model weights in place, so the model must
/// not be shared while a step runs.
pub struct Trainer {
    config: TrainerConfig,
    model: MatchaModel,
    optimizer: AdamW,
    awp: Awp,
}

impl Trainer {
    /// Create a new trainer builder.
    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::new()
    }

    /// Trainer configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// The wrapped model.
    pub fn model(&self) -> &MatchaModel {
        &self.model
    }

    /// Run one training step on a batch.
    ///
    /// Clean forward and backward first; then, when the attack is enabled,
    /// one full perturbation cycle whose gradients replace the clean ones for
    /// the optimizer update. The weights the optimizer sees are always the
    /// restored (clean) ones.
    pub fn step(&mut self, batch: &TrainBatch) -> Result<StepOutcome> {
        let (loss, breakdown) = self.model.forward(
            &batch.flattened_patches,
            &batch.attention_mask,
            &batch.labels,
        )?;
        let grads = loss.backward()?;

        let adv_grads = self.awp.attack_backward(&self.model, &grads, batch)?;
        let adversarial = adv_grads.is_some();
        match adv_grads {
            Some(adv) => self.optimizer.step(&adv)?,
            None => self.optimizer.step(&grads)?,
        }

        let loss = loss.to_scalar::<f32>()?;
        let breakdown = breakdown
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_scalar::<f32>()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        tracing::debug!(loss, adversarial, "training step");

        Ok(StepOutcome {
            loss,
            breakdown,
            adversarial,
        })
    }

    /// Write the model parameters to a SafeTensors file.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.model.save(path)
    }

    /// Consume the trainer, returning the model.
    pub fn into_model(self) -> MatchaModel {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use matcha_tune_core::model::BackboneConfig;

    fn small_model() -> MatchaModel {
        let config = BackboneConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 4,
            num_hidden_layers: 2,
            num_decoder_layers: 2,
            vocab_size: 50,
            patch_embedding_dim: 6,
            max_patches: 32,
            max_length: 8,
            pad_token_id: 0,
            decoder_start_token_id: 0,
            ..BackboneConfig::default()
        };
        MatchaModel::from_config(config, &Device::Cpu).unwrap()
    }

    fn small_batch(device: &Device) -> TrainBatch {
        let patch_dim = 6;
        let num_patches = 4;
        let mut data = Vec::new();
        for p in 0..num_patches {
            data.push((p / 2) as f32);
            data.push((p % 2) as f32);
            data.extend([0.3f32, -0.1, 0.7, 0.2]);
        }
        let flattened_patches =
            Tensor::from_slice(&data, (1, num_patches, patch_dim), device).unwrap();
        let attention_mask = Tensor::ones((1, num_patches), DType::F32, device).unwrap();
        let labels = Tensor::from_slice(&[5i64, 9, 2, -100], (1, 4), device).unwrap();
        TrainBatch {
            flattened_patches,
            attention_mask,
            labels,
        }
    }

    #[test]
    fn step_reports_finite_loss() {
        let mut trainer = Trainer::builder()
            .learning_rate(1e-3)
            .build(small_model())
            .unwrap();
        let batch = small_batch(&Device::Cpu);

        let outcome = trainer.step(&batch).unwrap();
        assert!(outcome.loss.is_finite() && outcome.loss > 0.0);
        assert!(outcome.adversarial);
        assert_eq!(outcome.breakdown["loss_main"], outcome.breakdown["loss_cls"]);
    }

    #[test]
    fn disabled_awp_takes_plain_steps() {
        let mut trainer = Trainer::builder()
            .awp(AwpSettings {
                adv_lr: 0.0,
                ..AwpSettings::default()
            })
            .build(small_model())
            .unwrap();
        let batch = small_batch(&Device::Cpu);

        let outcome = trainer.step(&batch).unwrap();
        assert!(!outcome.adversarial);
    }

    #[test]
    fn step_moves_trainable_weights_only() {
        let mut trainer = Trainer::builder()
            .learning_rate(1e-2)
            .build(small_model())
            .unwrap();
        let batch = small_batch(&Device::Cpu);

        let snapshot: Vec<(String, Vec<f32>)> = trainer
            .model()
            .named_vars()
            .into_iter()
            .map(|(name, var)| {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap();
                (name, values)
            })
            .collect();

        trainer.step(&batch).unwrap();

        let mut trainable_moved = false;
        for (name, before) in snapshot {
            let model = trainer.model();
            let var = model
                .named_vars()
                .into_iter()
                .find(|(n, _)| n == &name)
                .unwrap()
                .1;
            let after = var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            if model.is_frozen(&name) {
                assert_eq!(before, after, "frozen parameter moved: {name}");
            } else if before != after {
                trainable_moved = true;
            }
        }
        assert!(trainable_moved, "no trainable parameter moved");
    }

    #[test]
    fn loss_decreases_over_repeated_steps() {
        let mut trainer = Trainer::builder()
            .learning_rate(1e-2)
            .awp(AwpSettings {
                adv_lr: 0.0,
                ..AwpSettings::default()
            })
            .build(small_model())
            .unwrap();
        let batch = small_batch(&Device::Cpu);

        let first = trainer.step(&batch).unwrap().loss;
        for _ in 0..10 {
            trainer.step(&batch).unwrap();
        }
        let last = trainer.step(&batch).unwrap().loss;
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }
}
