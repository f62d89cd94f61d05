//! Adversarial weight perturbation (AWP).
//!
//! One cycle per training step: snapshot the matched parameters, push each
//! one along its clean-pass gradient direction (scaled to the parameter's own
//! norm and clamped into a relative-epsilon box around the snapshot), take
//! the backward pass of the loss under the perturbed weights, then restore
//! the snapshots. The gradients returned to the caller are the adversarial
//! ones; the caller performs the optimizer step.
//!
//! Adapted from the weighted adversarial perturbation scheme of
//! [Wu et al., 2020](https://arxiv.org/abs/2004.05884).

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::collections::HashMap;

use crate::config::AwpSettings;
use crate::error::{MatchaTuneError, Result};
use crate::model::TrainBatch;

/// Numerical-stability floor for the norm ratio. Distinct from the
/// configured `adv_eps`, which bounds the perturbation itself.
const NORM_FLOOR: f64 = 1e-6;

/// The seam between the controller and the model it perturbs: a target hands
/// out its named trainable parameters and evaluates the training loss on a
/// batch. While a cycle is in progress the controller holds an exclusive
/// lease on mutating these parameters; stepping the optimizer inside the
/// window is a correctness violation.
pub trait AdversarialTarget {
    /// Named trainable parameters, deterministically ordered.
    fn perturbable_vars(&self) -> Vec<(String, Var)>;

    /// Training loss for `batch` under the target's current weights.
    fn adversarial_loss(&self, batch: &TrainBatch) -> Result<Tensor>;
}

/// AWP perturbation controller.
///
/// The backup and bounds maps are empty except during the window between
/// save and restore of a single [`Awp::attack_backward`] call.
pub struct Awp {
    settings: AwpSettings,
    /// Parameter name -> snapshot taken at perturbation start.
    backup: HashMap<String, Tensor>,
    /// Parameter name -> (lower, upper) clamp tensors.
    bounds: HashMap<String, (Tensor, Tensor)>,
}

impl Awp {
    /// Create a controller with the given settings.
    pub fn new(settings: AwpSettings) -> Self {
        Self {
            settings,
            backup: HashMap::new(),
            bounds: HashMap::new(),
        }
    }

    /// Controller settings.
    pub fn settings(&self) -> &AwpSettings {
        &self.settings
    }

    /// Whether a save/attack/restore cycle is currently open.
    pub fn cycle_in_progress(&self) -> bool {
        !self.backup.is_empty()
    }

    /// Run one full adversarial cycle against `target`.
    ///
    /// `grads` are the gradients of the clean pass on the same batch. Returns
    /// `Ok(None)` without touching anything when `adv_lr` is zero; otherwise
    /// returns the gradients of the adversarial loss, computed while the
    /// weights were perturbed. The caller steps its optimizer with them; the
    /// weights themselves are already restored when this returns.
    pub fn attack_backward(
        &mut self,
        target: &impl AdversarialTarget,
        grads: &GradStore,
        batch: &TrainBatch,
    ) -> Result<Option<GradStore>> {
        if self.settings.adv_lr == 0.0 {
            return Ok(None);
        }

        self.save(target, grads)?;
        self.attack_step(target, grads)?;

        let adv_loss = target.adversarial_loss(batch)?;
        // A fresh gradient store: nothing from the clean pass accumulates.
        let adv_grads = adv_loss.backward()?;

        self.restore(target)?;
        Ok(Some(adv_grads))
    }

    /// Snapshot every matched parameter and compute its clamp interval
    /// `[value - adv_eps * |value|, value + adv_eps * |value|]`.
    ///
    /// Parameters already backed up this cycle are left untouched, so calling
    /// this twice without an intervening restore cannot overwrite snapshots.
    fn save(&mut self, target: &impl AdversarialTarget, grads: &GradStore) -> Result<()> {
        for (name, var) in target.perturbable_vars() {
            if !name.contains(&self.settings.adv_param) || grads.get(&var).is_none() {
                continue;
            }
            if self.backup.contains_key(&name) {
                continue;
            }

            let snapshot = var.as_tensor().copy()?;
            let margin = (snapshot.abs()? * self.settings.adv_eps)?;
            let lower = (&snapshot - &margin)?;
            let upper = (&snapshot + &margin)?;
            self.bounds.insert(name.clone(), (lower, upper));
            self.backup.insert(name, snapshot);
        }
        tracing::debug!(saved = self.backup.len(), "saved perturbation snapshots");
        Ok(())
    }

    /// Perturb each matched parameter along its gradient, scaled to the
    /// parameter's own norm, then clamp into the saved interval.
    ///
    /// Parameters whose gradient norm is zero or NaN are skipped. A matched
    /// parameter with a gradient but no saved bounds means the cycle was
    /// driven out of order; that is reported as an error.
    fn attack_step(&self, target: &impl AdversarialTarget, grads: &GradStore) -> Result<()> {
        for (name, var) in target.perturbable_vars() {
            if !name.contains(&self.settings.adv_param) {
                continue;
            }
            let Some(grad) = grads.get(&var) else {
                continue;
            };

            let grad_norm = l2_norm(grad)?;
            if grad_norm == 0.0 || grad_norm.is_nan() {
                continue;
            }
            let weight_norm = l2_norm(var.as_tensor())?;

            let (lower, upper) = self.bounds.get(&name).ok_or_else(|| {
                MatchaTuneError::PerturbationError(format!(
                    "no saved bounds for {name}: attack_step without save"
                ))
            })?;

            let scale = self.settings.adv_lr * (weight_norm as f64 + NORM_FLOOR)
                / (grad_norm as f64 + NORM_FLOOR);
            let perturbed = (var.as_tensor() + (grad * scale)?)?;
            let clamped = perturbed.maximum(lower)?.minimum(upper)?;
            var.set(&clamped)?;
        }
        Ok(())
    }

    /// Overwrite every backed-up parameter with its snapshot, then clear the
    /// cycle state. Restoration is unconditional: single-level snapshot, no
    /// comparison against the current value.
    fn restore(&mut self, target: &impl AdversarialTarget) -> Result<()> {
        for (name, var) in target.perturbable_vars() {
            if let Some(snapshot) = self.backup.get(&name) {
                var.set(snapshot)?;
            }
        }
        self.backup.clear();
        self.bounds.clear();
        Ok(())
    }
}

/// L2 norm of a tensor as a scalar.
fn l2_norm(tensor: &Tensor) -> Result<f32> {
    Ok(tensor.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?)
}
