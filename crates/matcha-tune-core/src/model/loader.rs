//! SafeTensors checkpoint loading.
//!
//! Checkpoints come in two shapes: a raw `parameter name -> tensor` mapping,
//! or the same mapping nested one level under a `state_dict.` key prefix
//! (optionally accompanied by `optimizer_state_dict.*` entries, which are
//! ignored here). Loading is non-strict: missing keys and per-key shape
//! mismatches are logged and skipped, never raised.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MatchaTuneError, Result};

const STATE_DICT_PREFIX: &str = "state_dict.";
const OPTIMIZER_PREFIX: &str = "optimizer_state_dict.";

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters whose values were overwritten from the checkpoint.
    pub loaded: usize,
    /// Model parameters with no matching checkpoint key.
    pub missing: usize,
    /// Keys skipped because the stored shape differs from the model's.
    pub shape_mismatch: usize,
}

/// Checkpoint loader for SafeTensors files.
pub struct CheckpointLoader {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
    /// Whether the tensor names were nested under `state_dict.`.
    nested: bool,
}

impl CheckpointLoader {
    /// Load every `.safetensors` file in a directory (sorted for
    /// deterministic order).
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(MatchaTuneError::CheckpointError(format!(
                "no .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }
        Ok(Self::from_tensors(tensors))
    }

    /// Load a single `.safetensors` file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        Ok(Self::from_tensors(tensors))
    }

    fn from_tensors(mut tensors: HashMap<String, Tensor>) -> Self {
        // Optimizer state rides along in some checkpoints; nothing here
        // consumes it.
        let optimizer_keys = tensors
            .keys()
            .filter(|k| k.starts_with(OPTIMIZER_PREFIX))
            .count();
        if optimizer_keys > 0 {
            tracing::debug!(optimizer_keys, "ignoring optimizer state in checkpoint");
            tensors.retain(|k, _| !k.starts_with(OPTIMIZER_PREFIX));
        }

        let nested = !tensors.is_empty() && tensors.keys().all(|k| k.starts_with(STATE_DICT_PREFIX));
        if nested {
            tracing::info!("checkpoint carries a nested state_dict");
            tensors = tensors
                .into_iter()
                .map(|(k, v)| (k[STATE_DICT_PREFIX.len()..].to_string(), v))
                .collect();
        } else {
            tracing::info!("checkpoint is a raw state dict");
        }
        Self { tensors, nested }
    }

    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            MatchaTuneError::CheckpointError(format!(
                "failed to deserialize {}: {e}",
                path.display()
            ))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = Self::view_to_tensor(&view, device)?;
            tensors.insert(name.to_string(), tensor);
        }
        Ok(tensors)
    }

    /// Convert a SafeTensors view to a candle tensor.
    fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
        let shape: Vec<usize> = view.shape().to_vec();
        let data = view.data();

        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                let values: &[f32] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?
            }
            safetensors::Dtype::F16 => {
                let values: &[half::f16] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?
            }
            safetensors::Dtype::BF16 => {
                let values: &[half::bf16] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?
            }
            safetensors::Dtype::I64 => {
                let values: &[i64] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?
            }
            safetensors::Dtype::I32 => {
                // Candle has no I32, upcast.
                let values: &[i32] = bytemuck::cast_slice(data);
                let values: Vec<i64> = values.iter().map(|&x| x as i64).collect();
                Tensor::from_slice(&values, shape.as_slice(), device)?
            }
            safetensors::Dtype::U32 => {
                let values: &[u32] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?
            }
            safetensors::Dtype::U8 => Tensor::from_slice(data, shape.as_slice(), device)?,
            other => {
                return Err(MatchaTuneError::CheckpointError(format!(
                    "unsupported dtype: {other:?}"
                )));
            }
        };
        Ok(tensor)
    }

    /// Whether the checkpoint keys were nested under `state_dict.`.
    pub fn nested(&self) -> bool {
        self.nested
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get all tensor names.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensors.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Non-strict merge into a `VarMap`.
    ///
    /// For every variable in the map: if the checkpoint has a tensor of the
    /// same name and shape, overwrite the variable's value; otherwise skip
    /// and count. Dtypes are converted to the variable's dtype.
    pub fn apply(&self, varmap: &VarMap) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let data = varmap.data().lock().unwrap();

        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            let var = &data[name];
            match self.tensors.get(name.as_str()) {
                Some(tensor) if tensor.dims() == var.dims() => {
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                    report.loaded += 1;
                }
                Some(tensor) => {
                    tracing::warn!(
                        name = name.as_str(),
                        expected = ?var.dims(),
                        found = ?tensor.dims(),
                        "skipping checkpoint key with mismatched shape"
                    );
                    report.shape_mismatch += 1;
                }
                None => {
                    tracing::debug!(name = name.as_str(), "no checkpoint entry for parameter");
                    report.missing += 1;
                }
            }
        }

        tracing::info!(
            loaded = report.loaded,
            missing = report.missing,
            shape_mismatch = report.shape_mismatch,
            "applied checkpoint"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn save_tensors(path: &Path, entries: &[(&str, Tensor)]) {
        let named: Vec<(&str, Tensor)> = entries.iter().map(|(n, t)| (*n, t.clone())).collect();
        safetensors::tensor::serialize_to_file(named, &None, path).unwrap();
    }

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("matcha_tune_loader_tests");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn loader_from_nonexistent_dir() {
        let result = CheckpointLoader::from_dir(Path::new("/nonexistent/path"), &Device::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn loader_empty_dir() {
        let dir = std::env::temp_dir().join("matcha_tune_empty_dir");
        let _ = fs::create_dir_all(&dir);

        let result = CheckpointLoader::from_dir(&dir, &Device::Cpu);
        assert!(result.is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn raw_state_dict_detected() {
        let path = temp_file("raw.safetensors");
        let w = Tensor::randn(0.0f32, 1.0, &[4, 4], &Device::Cpu).unwrap();
        save_tensors(&path, &[("layer.weight", w)]);

        let loader = CheckpointLoader::from_file(&path, &Device::Cpu).unwrap();
        assert!(!loader.nested());
        assert!(loader.get("layer.weight").is_some());
    }

    #[test]
    fn nested_state_dict_prefix_stripped() {
        let path = temp_file("nested.safetensors");
        let w = Tensor::randn(0.0f32, 1.0, &[4, 4], &Device::Cpu).unwrap();
        save_tensors(&path, &[("state_dict.layer.weight", w)]);

        let loader = CheckpointLoader::from_file(&path, &Device::Cpu).unwrap();
        assert!(loader.nested());
        assert!(loader.get("layer.weight").is_some());
        assert!(loader.get("state_dict.layer.weight").is_none());
    }

    #[test]
    fn optimizer_state_ignored() {
        let path = temp_file("with_optim.safetensors");
        let w = Tensor::randn(0.0f32, 1.0, &[4, 4], &Device::Cpu).unwrap();
        let m = Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap();
        save_tensors(
            &path,
            &[
                ("state_dict.layer.weight", w),
                ("optimizer_state_dict.exp_avg", m),
            ],
        );

        let loader = CheckpointLoader::from_file(&path, &Device::Cpu).unwrap();
        assert!(loader.nested());
        assert_eq!(loader.len(), 1);
    }

    #[test]
    fn non_strict_apply_skips_mismatches() {
        let path = temp_file("partial.safetensors");
        let good = Tensor::full(7.0f32, (2, 3), &Device::Cpu).unwrap();
        let wrong_shape = Tensor::zeros((5, 5), DType::F32, &Device::Cpu).unwrap();
        save_tensors(&path, &[("a.weight", good), ("b.weight", wrong_shape)]);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _a = vb.get_with_hints((2, 3), "a.weight", Init::Const(0.0)).unwrap();
        let _b = vb.get_with_hints((2, 2), "b.weight", Init::Const(0.0)).unwrap();
        let _c = vb.get_with_hints((2, 2), "c.weight", Init::Const(0.0)).unwrap();

        let loader = CheckpointLoader::from_file(&path, &Device::Cpu).unwrap();
        let report = loader.apply(&varmap).unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.shape_mismatch, 1);
        assert_eq!(report.missing, 1);

        // The matching variable actually took the checkpoint values.
        let data = varmap.data().lock().unwrap();
        let vals: Vec<f32> = data["a.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(vals.iter().all(|&v| (v - 7.0).abs() < 1e-6));
    }
}
