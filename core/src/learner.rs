/// GatedLogLinear: the trainable model behind one object.
///
/// Owns the configuration, the gate parameters and the optimizer state.
/// Every query runs a fresh unroll from a caller-supplied θ_0; only
/// `update` mutates, and it commits nothing unless the whole forward,
/// backward and optimizer step succeeded with finite results.

use std::path::Path;

use tracing::debug;

use crate::error::{LearnerError, Result};
use crate::features::FeatureTensor;
use crate::model::{self, GatedConfig, GatedParams};
use crate::optimizer::OptimizerState;
use crate::recurrence::{SequenceCache, Step, sequence_backward, sequence_forward, total_loss};

/// Outputs of one training update (values from the pre-update parameters).
#[derive(Clone, Debug)]
pub struct UpdateOutput {
    pub seq_loss: f64,
    pub total_loss: f64,
    /// θ_1..θ_T.
    pub thetas: Vec<Vec<f64>>,
    pub y_hats: Vec<Vec<f64>>,
}

#[derive(Clone, Debug)]
pub struct GatedLogLinear {
    cfg: GatedConfig,
    params: GatedParams,
    optimizer: OptimizerState,
}

fn buffer_lens(params: &GatedParams) -> Vec<usize> {
    params.buffers().iter().map(|b| b.len()).collect()
}

impl GatedLogLinear {
    /// Fresh model: initialized gates and zero optimizer accumulators.
    pub fn new(cfg: GatedConfig) -> Result<Self> {
        cfg.validate()?;
        let params = GatedParams::init(&cfg);
        let optimizer = OptimizerState::new(cfg.update_rule, &buffer_lens(&params));
        Ok(GatedLogLinear { cfg, params, optimizer })
    }

    /// Reassemble a model from saved pieces.
    pub fn from_parts(cfg: GatedConfig, params: GatedParams, optimizer: OptimizerState) -> Result<Self> {
        cfg.validate()?;
        params.check_shapes(&cfg)?;
        if optimizer.rule != cfg.update_rule {
            return Err(LearnerError::Config(format!(
                "optimizer state is for {:?}, config selects {:?}",
                optimizer.rule, cfg.update_rule
            )));
        }
        Ok(GatedLogLinear { cfg, params, optimizer })
    }

    pub fn config(&self) -> &GatedConfig {
        &self.cfg
    }

    pub fn params(&self) -> &GatedParams {
        &self.params
    }

    pub fn optimizer(&self) -> &OptimizerState {
        &self.optimizer
    }

    /// Replace the gate parameters; the optimizer state is kept.
    pub fn set_params(&mut self, params: GatedParams) -> Result<()> {
        params.check_shapes(&self.cfg)?;
        self.params = params;
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn forward(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<(f64, SequenceCache)> {
        sequence_forward(&self.params, &self.cfg, phi, steps, theta_0)
    }

    /// Σ_t loss_t.
    pub fn seq_loss(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<f64> {
        Ok(self.forward(phi, steps, theta_0)?.0)
    }

    /// Σ_t loss_t + λ·Σ‖W‖².
    pub fn total_loss(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<f64> {
        let seq_loss = self.seq_loss(phi, steps, theta_0)?;
        Ok(total_loss(&self.params, &self.cfg, seq_loss))
    }

    /// ŷ_t for every step.
    pub fn seq_y_hats(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<Vec<Vec<f64>>> {
        let (_, cache) = self.forward(phi, steps, theta_0)?;
        Ok(cache.outputs().iter().map(|o| o.y_hat.clone()).collect())
    }

    /// θ_1..θ_T: the state after each step.
    pub fn seq_thetas(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<Vec<Vec<f64>>> {
        let (_, cache) = self.forward(phi, steps, theta_0)?;
        Ok(cache.thetas()[1..].to_vec())
    }

    /// Per-step classifier gradient grad_t.
    pub fn seq_gradients(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<Vec<Vec<f64>>> {
        let (_, cache) = self.forward(phi, steps, theta_0)?;
        Ok(cache.gradients().into_iter().map(|g| g.to_vec()).collect())
    }

    /// Total loss and its gradient w.r.t. every gate tensor.
    pub fn gradients(&self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<(f64, GatedParams)> {
        let (seq_loss, cache) = self.forward(phi, steps, theta_0)?;
        let grads = sequence_backward(&self.params, &self.cfg, phi, steps, &cache)?;
        Ok((total_loss(&self.params, &self.cfg, seq_loss), grads))
    }

    // ── Training ─────────────────────────────────────────────────────

    /// One optimizer step on the total loss of a single sequence.
    ///
    /// On any error (data, divergence) parameters and optimizer state are
    /// left exactly as they were.
    pub fn update(&mut self, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64], lr: f64) -> Result<UpdateOutput> {
        let (seq_loss, cache) = self.forward(phi, steps, theta_0)?;
        let grads = sequence_backward(&self.params, &self.cfg, phi, steps, &cache)?;
        let total = total_loss(&self.params, &self.cfg, seq_loss);
        crate::error::ensure_finite(&[total], "total loss", steps.len())?;

        let mut params = self.params.clone();
        let mut optimizer = self.optimizer.clone();
        optimizer.step(params.buffers_mut(), grads.buffers(), lr, self.cfg.precision)?;
        if !params.all_finite() {
            return Err(LearnerError::NumericalDivergence { quantity: "gate parameters", step: steps.len() });
        }

        debug!(steps = steps.len(), seq_loss, grad_norm = grads.norm(), "gate update");
        self.params = params;
        self.optimizer = optimizer;

        let y_hats = cache.outputs().iter().map(|o| o.y_hat.clone()).collect();
        Ok(UpdateOutput {
            seq_loss,
            total_loss: total,
            thetas: cache.thetas()[1..].to_vec(),
            y_hats,
        })
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Checkpoint: config + params + optimizer state.
    pub fn save(&self, path: &Path) -> Result<()> {
        model::save_checkpoint(path, &self.cfg, &self.params, &self.optimizer)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let (cfg, params, optimizer) = model::load_checkpoint(path)?;
        Self::from_parts(cfg, params, optimizer)
    }

    /// Human-readable named arrays.
    pub fn export_params(&self, path: &Path) -> Result<()> {
        model::export_params(path, &self.cfg, &self.params)
    }

    /// Replace params from an export; config and optimizer state are kept.
    pub fn import_params(&mut self, path: &Path) -> Result<()> {
        let params = model::import_params(path, &self.cfg)?;
        self.set_params(params)
    }
}
