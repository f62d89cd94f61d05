//! Run-level configuration.
//!
//! `ModelSettings` is the single configuration object the model wrapper reads
//! at construction time; `AwpSettings` parameterizes the perturbation
//! controller. Both are plain serde structs loadable from JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Settings consumed by [`crate::model::MatchaModel`] at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Directory holding the pretrained backbone (`config.json` plus
    /// `*.safetensors` weight files).
    pub backbone_path: PathBuf,
    /// Maximum generation length, written into the decoder config.
    pub max_length: usize,
    /// Padding token id.
    pub pad_token_id: u32,
    /// Decoder start token id (prepended during teacher forcing).
    pub decoder_start_token_id: u32,
    /// Beginning-of-sequence token id.
    pub bos_token_id: u32,
    /// Target vocabulary size; the decoder embedding and output projection
    /// are resized to this many rows.
    pub len_tokenizer: usize,
    /// Optional fine-tuning checkpoint to load on top of the pretrained
    /// weights.
    #[serde(default)]
    pub from_checkpoint_dir: Option<PathBuf>,
}

impl ModelSettings {
    /// Load settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&contents)?;
        Ok(settings)
    }
}

/// Settings for the AWP perturbation controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwpSettings {
    /// Substring filter over parameter names; a parameter is eligible for
    /// perturbation when its name *contains* this string.
    #[serde(default = "default_adv_param")]
    pub adv_param: String,
    /// Learning-rate-like step size of the perturbation. Zero disables the
    /// whole attack cycle.
    #[serde(default = "default_adv_lr")]
    pub adv_lr: f64,
    /// Relative tolerance bounding the perturbation: each parameter is
    /// clamped into `value ± adv_eps * |value|`.
    #[serde(default = "default_adv_eps")]
    pub adv_eps: f64,
}

fn default_adv_param() -> String {
    "weight".to_string()
}

fn default_adv_lr() -> f64 {
    1.0
}

fn default_adv_eps() -> f64 {
    1e-4
}

impl Default for AwpSettings {
    fn default() -> Self {
        Self {
            adv_param: default_adv_param(),
            adv_lr: default_adv_lr(),
            adv_eps: default_adv_eps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awp_defaults() {
        let settings = AwpSettings::default();
        assert_eq!(settings.adv_param, "weight");
        assert!((settings.adv_lr - 1.0).abs() < f64::EPSILON);
        assert!((settings.adv_eps - 1e-4).abs() < f64::EPSILON);
    }

    #[test]
    fn awp_partial_json() {
        let settings: AwpSettings = serde_json::from_str(r#"{"adv_lr": 0.5}"#).unwrap();
        assert_eq!(settings.adv_param, "weight");
        assert!((settings.adv_lr - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn model_settings_roundtrip() {
        let json = r#"{
            "backbone_path": "/models/matcha-base",
            "max_length": 512,
            "pad_token_id": 0,
            "decoder_start_token_id": 0,
            "bos_token_id": 0,
            "len_tokenizer": 50345
        }"#;
        let settings: ModelSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.len_tokenizer, 50345);
        assert!(settings.from_checkpoint_dir.is_none());
    }
}
