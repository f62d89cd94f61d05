//! Backbone configuration.

use serde::{Deserialize, Serialize};

use crate::config::ModelSettings;
use crate::error::{MatchaTuneError, Result};

/// Configuration for the Pix2Struct-style encoder-decoder backbone.
///
/// Read from the `config.json` shipped next to the pretrained weights; the
/// decoder-specific fields are overridden from [`ModelSettings`] before the
/// model is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Hidden dimension shared by encoder and decoder.
    pub hidden_size: usize,
    /// Intermediate dimension of the gated MLPs.
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of encoder layers.
    pub num_hidden_layers: usize,
    /// Number of decoder layers.
    pub num_decoder_layers: usize,
    /// Decoder vocabulary size (before any resize).
    pub vocab_size: usize,
    /// Width of one flattened patch: two index columns plus pixel values.
    pub patch_embedding_dim: usize,
    /// Maximum number of patches per image (bounds the row/column embedders).
    pub max_patches: usize,
    /// Layer norm epsilon.
    pub layer_norm_eps: f64,
    /// Whether the text stack runs as a decoder. Always forced to `true` by
    /// the wrapper.
    #[serde(default)]
    pub is_decoder: bool,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: u32,
    /// Decoder start token id.
    #[serde(default)]
    pub decoder_start_token_id: u32,
    /// Beginning-of-sequence token id.
    #[serde(default)]
    pub bos_token_id: u32,
    /// Maximum generation length.
    #[serde(default)]
    pub max_length: usize,
}

impl BackboneConfig {
    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Load from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            MatchaTuneError::ConfigError(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(config)
    }

    /// Override the decoder-specific fields from run settings.
    ///
    /// Mirrors what the wrapper does to the pretrained text config: force
    /// decoder mode and stamp in the token ids and maximum length.
    pub fn apply_text_overrides(&mut self, settings: &ModelSettings) {
        self.is_decoder = true;
        self.pad_token_id = settings.pad_token_id;
        self.decoder_start_token_id = settings.decoder_start_token_id;
        self.bos_token_id = settings.bos_token_id;
        self.max_length = settings.max_length;
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        // Matcha-base-like defaults.
        Self {
            hidden_size: 768,
            intermediate_size: 2048,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            num_decoder_layers: 12,
            vocab_size: 50244,
            patch_embedding_dim: 770,
            max_patches: 4096,
            layer_norm_eps: 1e-6,
            is_decoder: false,
            pad_token_id: 0,
            decoder_start_token_id: 0,
            bos_token_id: 0,
            max_length: 512,
        }
    }
}
