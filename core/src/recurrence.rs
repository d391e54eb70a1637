/// Recurrence driver: θ is the recurrent state.
///
/// Forward (per step t, event x_t):
///   out_t   = classifier(θ_t, Φ_{x_t}, y_t, mask_t, feedback_t)
///   r_t     = retain_gate(θ_t, Φ_{x_t})
///   z_t     = update_gate(θ_t, Φ_{x_t})
///   θ_{t+1} = r_t ⊙ θ_t + z_t ⊙ grad_t
///   seq_loss = Σ_t loss_t
///
/// Backward: reverse step loop carrying a = dJ/dθ_{t+1}. The per-step
/// gradient grad_t depends on θ_t, so the sweep differentiates through the
/// classifier's own gradient (second order).

use crate::classifier::{StepOutput, classifier_backward, classifier_forward};
use crate::corpus::{FeedbackLabel, TaskKind};
use crate::error::{LearnerError, Result, ensure_finite};
use crate::features::FeatureTensor;
use crate::gate::{GateActivation, gate_backward, gate_forward};
use crate::model::{GatedConfig, GatedParams};

/// One interaction of a learner.
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub event: usize,
    /// Class the learner chose (position of the one-hot y).
    pub selected: usize,
    /// Eligible output classes. Length C.
    pub mask: Vec<bool>,
    /// False only for negative feedback.
    pub feedback: bool,
    pub task: TaskKind,
    pub label: FeedbackLabel,
    /// Correct class of the event, when known. Evaluation only.
    pub true_class: Option<usize>,
}

impl Step {
    /// Multiple-choice step whose label follows the feedback flag.
    pub fn new(event: usize, selected: usize, mask: Vec<bool>, feedback: bool) -> Self {
        let label = if feedback { FeedbackLabel::Correct } else { FeedbackLabel::Incorrect };
        Step { event, selected, mask, feedback, task: TaskKind::MultipleChoice, label, true_class: None }
    }

    /// Counted by evaluation: not an example display and not a revealed answer.
    pub fn is_scored(&self) -> bool {
        self.task != TaskKind::Example && self.label != FeedbackLabel::Revealed
    }

    /// Fail with `Data` if this step cannot be run under `cfg`.
    pub fn validate(&self, cfg: &GatedConfig, t: usize) -> Result<()> {
        if self.event >= cfg.num_events {
            return Err(LearnerError::Data(format!(
                "step {t}: unknown event {} (num_events={})", self.event, cfg.num_events
            )));
        }
        if self.mask.len() != cfg.num_classes {
            return Err(LearnerError::Data(format!(
                "step {t}: mask has {} entries, expected {}", self.mask.len(), cfg.num_classes
            )));
        }
        if !self.mask.iter().any(|&m| m) {
            return Err(LearnerError::Data(format!("step {t}: no eligible class")));
        }
        if self.selected >= cfg.num_classes || !self.mask[self.selected] {
            return Err(LearnerError::Data(format!(
                "step {t}: selected class {} is not eligible", self.selected
            )));
        }
        Ok(())
    }
}

/// All steps of one user, in chronological order.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    pub user: String,
    pub steps: Vec<Step>,
}

/// Every intermediate value of a sequence forward pass, needed for backward.
#[derive(Clone, Debug)]
pub struct SequenceCache {
    /// θ_0..θ_T (T+1 entries). θ_t is the state BEFORE step t.
    thetas: Vec<Vec<f64>>,
    outputs: Vec<StepOutput>,
    retain: Vec<GateActivation>,
    update: Vec<GateActivation>,
}

impl SequenceCache {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn thetas(&self) -> &[Vec<f64>] {
        &self.thetas
    }

    pub fn theta(&self, t: usize) -> &[f64] {
        &self.thetas[t]
    }

    /// θ_T: the state after the last step.
    pub fn final_theta(&self) -> &[f64] {
        &self.thetas[self.thetas.len() - 1]
    }

    pub fn outputs(&self) -> &[StepOutput] {
        &self.outputs
    }

    pub fn y_hat(&self, t: usize) -> &[f64] {
        &self.outputs[t].y_hat
    }

    pub fn losses(&self) -> Vec<f64> {
        self.outputs.iter().map(|o| o.loss).collect()
    }

    pub fn gradients(&self) -> Vec<&[f64]> {
        self.outputs.iter().map(|o| o.grad.as_slice()).collect()
    }

    pub fn retain_gate(&self, t: usize) -> &[f64] {
        &self.retain[t].value
    }

    pub fn update_gate(&self, t: usize) -> &[f64] {
        &self.update[t].value
    }
}

fn check_dims(cfg: &GatedConfig, phi: &FeatureTensor, theta_0: &[f64]) -> Result<()> {
    if phi.num_events() != cfg.num_events
        || phi.num_classes() != cfg.num_classes
        || phi.feature_dim() != cfg.feature_dim
    {
        return Err(LearnerError::Config(format!(
            "feature tensor is [{}, {}, {}] but model expects [{}, {}, {}]",
            phi.num_events(), phi.num_classes(), phi.feature_dim(),
            cfg.num_events, cfg.num_classes, cfg.feature_dim
        )));
    }
    if theta_0.len() != cfg.feature_dim {
        return Err(LearnerError::Config(format!(
            "theta_0 has length {}, expected {}", theta_0.len(), cfg.feature_dim
        )));
    }
    Ok(())
}

/// Run the recurrence over one sequence starting from `theta_0`.
///
/// Returns Σ loss_t and the cache. Every produced quantity is checked after
/// each step; the first non-finite one fails with `NumericalDivergence`.
pub fn sequence_forward(
    params: &GatedParams,
    cfg: &GatedConfig,
    phi: &FeatureTensor,
    steps: &[Step],
    theta_0: &[f64],
) -> Result<(f64, SequenceCache)> {
    check_dims(cfg, phi, theta_0)?;
    ensure_finite(theta_0, "theta", 0)?;
    let (d, k, c) = (cfg.feature_dim, cfg.low_rank_dim, cfg.num_classes);
    let precision = cfg.precision;

    let mut theta = theta_0.to_vec();
    precision.round_slice(&mut theta);

    let mut cache = SequenceCache {
        thetas: Vec::with_capacity(steps.len() + 1),
        outputs: Vec::with_capacity(steps.len()),
        retain: Vec::with_capacity(steps.len()),
        update: Vec::with_capacity(steps.len()),
    };
    let mut seq_loss = 0.0f64;

    for (t, step) in steps.iter().enumerate() {
        step.validate(cfg, t)?;
        let phi_x = phi.slice(step.event);

        let out = classifier_forward(&theta, phi_x, step.selected, &step.mask, step.feedback, c, d, precision)?;
        ensure_finite(&[out.loss], "loss", t)?;
        ensure_finite(&out.y_hat, "prediction", t)?;
        ensure_finite(&out.grad, "gradient", t)?;

        let r = gate_forward(&params.retain, &theta, phi_x, d, k, c, precision);
        let z = gate_forward(&params.update, &theta, phi_x, d, k, c, precision);
        ensure_finite(&r.value, "retain gate", t)?;
        ensure_finite(&z.value, "update gate", t)?;

        let mut next = vec![0.0f64; d];
        for i in 0..d {
            next[i] = precision.round(r.value[i] * theta[i] + z.value[i] * out.grad[i]);
        }
        ensure_finite(&next, "theta", t + 1)?;

        seq_loss = precision.round(seq_loss + out.loss);
        cache.thetas.push(std::mem::replace(&mut theta, next));
        cache.outputs.push(out);
        cache.retain.push(r);
        cache.update.push(z);
    }
    cache.thetas.push(theta);

    Ok((seq_loss, cache))
}

/// seq_loss + λ·Σ‖W‖² over the gate tensors.
pub fn total_loss(params: &GatedParams, cfg: &GatedConfig, seq_loss: f64) -> f64 {
    cfg.precision.round(seq_loss + cfg.reg * params.l2_penalty(cfg.regularize_bias))
}

/// Reverse sweep: dJ/dW of `total_loss` for every gate tensor.
///
/// `cache` must come from `sequence_forward` with the same params and steps.
/// Fails with `NumericalDivergence` if any resulting gradient is non-finite.
pub fn sequence_backward(
    params: &GatedParams,
    cfg: &GatedConfig,
    phi: &FeatureTensor,
    steps: &[Step],
    cache: &SequenceCache,
) -> Result<GatedParams> {
    debug_assert_eq!(steps.len(), cache.len());
    let (d, k, c) = (cfg.feature_dim, cfg.low_rank_dim, cfg.num_classes);
    let precision = cfg.precision;

    let mut grads = GatedParams::zeros_like(cfg);

    // a = dJ/dθ_{t+1}. θ_T feeds no loss, so it starts at zero.
    let mut a = vec![0.0f64; d];

    for t in (0..steps.len()).rev() {
        let step = &steps[t];
        let phi_x = phi.slice(step.event);
        let theta = &cache.thetas[t];
        let out = &cache.outputs[t];
        let r = &cache.retain[t];
        let z = &cache.update[t];

        // ── θ_{t+1} = r ⊙ θ + z ⊙ grad ──
        let mut d_r = vec![0.0f64; d];
        let mut d_z = vec![0.0f64; d];
        let mut d_grad = vec![0.0f64; d];
        let mut d_theta = vec![0.0f64; d];
        for i in 0..d {
            d_r[i] = a[i] * theta[i];
            d_z[i] = a[i] * out.grad[i];
            d_grad[i] = a[i] * z.value[i];
            d_theta[i] = a[i] * r.value[i];
        }

        // ── Gates ──
        gate_backward(&params.retain, theta, phi_x, r, &d_r, &mut grads.retain, &mut d_theta, d, k, c, precision);
        gate_backward(&params.update, theta, phi_x, z, &d_z, &mut grads.update, &mut d_theta, d, k, c, precision);

        // ── Classifier: loss_t and grad_t both depend on θ_t ──
        classifier_backward(
            phi_x, out, step.selected, &step.mask, step.feedback,
            &d_grad, 1.0, &mut d_theta, c, d, precision,
        );

        a = d_theta;
    }

    params.add_l2_gradient(cfg.reg, cfg.regularize_bias, &mut grads);

    for buf in grads.buffers_mut() {
        precision.round_slice(buf);
    }
    for buf in grads.buffers() {
        ensure_finite(buf, "gate gradient", steps.len())?;
    }
    Ok(grads)
}
