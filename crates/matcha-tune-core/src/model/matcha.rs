//! The Matcha model wrapper.
//!
//! Owns the encoder-decoder backbone and applies the construction-time
//! policy: decoder config overrides, non-strict pretrained/checkpoint
//! loading, encoder freezing, and vocabulary resizing. The forward pass
//! returns the scalar training loss together with a loss-breakdown mapping.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;

use super::config::BackboneConfig;
use super::decoder::TextDecoder;
use super::encoder::{padding_mask, VisionEncoder};
use super::loader::CheckpointLoader;
use crate::awp::AdversarialTarget;
use crate::config::ModelSettings;
use crate::error::{MatchaTuneError, Result};

/// Fraction of encoder layers frozen at construction time.
const FROZEN_ENCODER_FRACTION: f64 = 0.4;

/// One training batch: flattened patches, their padding mask, and target
/// label sequences with `-100` marking ignored positions.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    /// `[batch, num_patches, patch_dim]` F32.
    pub flattened_patches: Tensor,
    /// `[batch, num_patches]` 1/0 mask.
    pub attention_mask: Tensor,
    /// `[batch, seq]` I64 labels, `-100` ignored.
    pub labels: Tensor,
}

/// Pix2Struct/Matcha-style conditional-generation model wrapper.
pub struct MatchaModel {
    config: BackboneConfig,
    encoder: VisionEncoder,
    decoder: TextDecoder,
    varmap: VarMap,
    frozen_prefixes: Vec<String>,
    device: Device,
}

impl MatchaModel {
    /// Build the model per the full construction contract: read the backbone
    /// config, override its decoder fields, load pretrained weights, load an
    /// optional fine-tuning checkpoint, freeze the encoder prefix, and resize
    /// the decoder vocabulary to `settings.len_tokenizer`.
    pub fn new(settings: &ModelSettings, device: &Device) -> Result<Self> {
        let mut config = BackboneConfig::from_file(&settings.backbone_path.join("config.json"))?;
        config.apply_text_overrides(settings);

        let mut model = Self::from_config(config, device)?;

        let pretrained = CheckpointLoader::from_dir(&settings.backbone_path, device)?;
        pretrained.apply(&model.varmap)?;

        if let Some(checkpoint) = &settings.from_checkpoint_dir {
            tracing::info!(path = %checkpoint.display(), "loading checkpoint");
            let loader = if checkpoint.is_dir() {
                CheckpointLoader::from_dir(checkpoint, device)?
            } else {
                CheckpointLoader::from_file(checkpoint, device)?
            };
            loader.apply(&model.varmap)?;
        }

        tracing::info!(len_tokenizer = settings.len_tokenizer, "resizing model embeddings");
        model.resize_token_embeddings(settings.len_tokenizer)?;
        Ok(model)
    }

    /// Build the model with fresh weights (for testing). Applies the same
    /// freeze policy as [`MatchaModel::new`] but performs no file I/O and no
    /// resize.
    pub fn from_config(config: BackboneConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = VisionEncoder::load(&config, vb.pp("encoder"))?;
        let decoder = TextDecoder::load(&config, vb.pp("decoder"))?;

        let frozen_prefixes = frozen_prefixes(&config);
        tracing::info!(
            frozen_layers = (FROZEN_ENCODER_FRACTION * config.num_hidden_layers as f64) as usize,
            "freezing the encoder"
        );

        Ok(Self {
            config,
            encoder,
            decoder,
            varmap,
            frozen_prefixes,
            device: device.clone(),
        })
    }

    /// Backbone configuration.
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All named parameters, deterministically ordered.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Named parameters that participate in training (frozen prefixes
    /// excluded), deterministically ordered.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.named_vars()
            .into_iter()
            .filter(|(name, _)| !self.is_frozen(name))
            .collect()
    }

    /// Whether a parameter is excluded from training by the freeze policy.
    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    /// Forward pass.
    ///
    /// Returns the scalar total loss (carrying the autodiff graph) and the
    /// loss breakdown. `loss_cls` mirrors `loss_main`: the secondary
    /// classification head is inactive.
    pub fn forward(
        &self,
        flattened_patches: &Tensor,
        attention_mask: &Tensor,
        labels: &Tensor,
    ) -> Result<(Tensor, HashMap<String, Tensor>)> {
        let encoder_states = self.encoder.forward(flattened_patches, attention_mask)?;
        let encoder_mask = padding_mask(attention_mask)?;

        let decoder_input_ids = self.shift_right(labels)?;
        let logits = self
            .decoder
            .forward(&decoder_input_ids, &encoder_states, &encoder_mask)?;

        let loss_main = masked_cross_entropy(&logits, labels)?;
        let loss = loss_main.clone();

        let mut breakdown = HashMap::new();
        breakdown.insert("loss_main".to_string(), loss_main);
        breakdown.insert("loss_cls".to_string(), loss.clone());
        Ok((loss, breakdown))
    }

    /// Teacher forcing: shift labels right, prepend the decoder start token,
    /// and replace `-100` markers with the pad token for embedding lookup.
    fn shift_right(&self, labels: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = labels.dims2()?;
        let device = labels.device();

        let start = Tensor::full(
            self.config.decoder_start_token_id as i64,
            (batch, 1),
            device,
        )?;
        let shifted = Tensor::cat(&[&start, &labels.narrow(1, 0, seq_len - 1)?], 1)?;

        let zeros = shifted.zeros_like()?;
        let valid = shifted.ge(&zeros)?;
        let pads = Tensor::full(self.config.pad_token_id as i64, (batch, seq_len), device)?;
        Ok(valid.where_cond(&shifted, &pads)?)
    }

    /// Resize the decoder token embedding and output projection to
    /// `new_size` rows, preserving rows for token ids that existed before and
    /// drawing new rows from N(0, 0.02).
    pub fn resize_token_embeddings(&mut self, new_size: usize) -> Result<()> {
        let embed = self.replace_rows("decoder.embed_tokens.weight", new_size)?;
        self.decoder.set_embed_tokens(embed);
        let head = self.replace_rows("decoder.lm_head.weight", new_size)?;
        self.decoder.set_lm_head(head);
        self.config.vocab_size = new_size;
        Ok(())
    }

    /// Write all parameters to a SafeTensors file (raw state dict layout, as
    /// [`CheckpointLoader`] reads back).
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        self.varmap.save(path)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }

    /// Swap a 2D parameter for one with `new_rows` rows, keeping the overlap.
    /// Returns the tensor backing the replacement variable.
    fn replace_rows(&self, name: &str, new_rows: usize) -> Result<Tensor> {
        let mut data = self.varmap.data().lock().unwrap();
        let old = data
            .get(name)
            .ok_or_else(|| MatchaTuneError::ModelError(format!("missing parameter {name}")))?
            .as_tensor()
            .clone();
        let (rows, cols) = old.dims2()?;

        let resized = if new_rows <= rows {
            old.narrow(0, 0, new_rows)?.copy()?
        } else {
            let fresh = Tensor::randn(0.0f32, 0.02, &[new_rows - rows, cols], old.device())?;
            Tensor::cat(&[&old, &fresh], 0)?
        };

        let var = Var::from_tensor(&resized)?;
        let tensor = var.as_tensor().clone();
        data.insert(name.to_string(), var);
        Ok(tensor)
    }
}

impl AdversarialTarget for MatchaModel {
    fn perturbable_vars(&self) -> Vec<(String, Var)> {
        self.trainable_vars()
    }

    fn adversarial_loss(&self, batch: &TrainBatch) -> Result<Tensor> {
        let (loss, _) = self.forward(
            &batch.flattened_patches,
            &batch.attention_mask,
            &batch.labels,
        )?;
        Ok(loss)
    }
}

/// Name prefixes frozen at construction: the first
/// `floor(0.4 * num_hidden_layers)` encoder layers plus the vision
/// embeddings.
fn frozen_prefixes(config: &BackboneConfig) -> Vec<String> {
    let frozen_layers = (FROZEN_ENCODER_FRACTION * config.num_hidden_layers as f64) as usize;
    let mut prefixes: Vec<String> = (0..frozen_layers)
        .map(|i| format!("encoder.layer.{i}."))
        .collect();
    prefixes.push("encoder.embeddings.".to_string());
    prefixes
}

/// Token-level cross entropy over `[batch, seq, vocab]` logits, excluding
/// positions labelled `-100`. An all-ignored batch divides by one so the
/// loss stays finite (and zero).
fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;

    let zeros = labels.zeros_like()?;
    let valid = labels.ge(&zeros)?;
    let safe_labels = valid.where_cond(labels, &zeros)?;

    let picked = log_probs
        .gather(&safe_labels.unsqueeze(2)?, D::Minus1)?
        .squeeze(2)?;

    let mask = valid.to_dtype(DType::F32)?;
    let denom = mask.sum_all()?.to_scalar::<f32>()?.max(1.0) as f64;
    let loss = ((picked * &mask)?.sum_all()?.neg()? / denom)?;
    Ok(loss)
}
