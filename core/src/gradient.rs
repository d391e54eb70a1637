/// Gradient orchestration and verification.
///
/// Provides:
/// - `compute_gradients`: total loss and analytic gate gradients of one sequence
/// - `fd_single`: central finite difference of the total loss for one weight
/// - `check_buffer_gradient` / `check_all_gradients`: sampled FD comparison
/// - `compare_gradient`: the comparison loop itself, reusable for any model

use crate::error::Result;
use crate::features::FeatureTensor;
use crate::model::{BUFFER_NAMES, GatedConfig, GatedParams};
use crate::recurrence::{Step, sequence_backward, sequence_forward, total_loss};

/// Outcome of checking one buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f64,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.checked == self.passed
    }
}

/// Total loss and dJ/dW for every gate tensor.
pub fn compute_gradients(
    params: &GatedParams,
    cfg: &GatedConfig,
    phi: &FeatureTensor,
    steps: &[Step],
    theta_0: &[f64],
) -> Result<(f64, GatedParams)> {
    let (seq_loss, cache) = sequence_forward(params, cfg, phi, steps, theta_0)?;
    let grads = sequence_backward(params, cfg, phi, steps, &cache)?;
    Ok((total_loss(params, cfg, seq_loss), grads))
}

fn loss_at(params: &GatedParams, cfg: &GatedConfig, phi: &FeatureTensor, steps: &[Step], theta_0: &[f64]) -> Result<f64> {
    let (seq_loss, _) = sequence_forward(params, cfg, phi, steps, theta_0)?;
    Ok(total_loss(params, cfg, seq_loss))
}

/// Finite-difference gradient for a single weight element.
/// Uses central differences: (f(x+eps) - f(x-eps)) / (2*eps).
#[allow(clippy::too_many_arguments)]
pub fn fd_single(
    params: &GatedParams,
    cfg: &GatedConfig,
    phi: &FeatureTensor,
    steps: &[Step],
    theta_0: &[f64],
    buf: usize,
    idx: usize,
    eps: f64,
) -> Result<f64> {
    let mut p_plus = params.clone();
    p_plus.buffers_mut()[buf][idx] += eps;
    let loss_plus = loss_at(&p_plus, cfg, phi, steps, theta_0)?;

    let mut p_minus = params.clone();
    p_minus.buffers_mut()[buf][idx] -= eps;
    let loss_minus = loss_at(&p_minus, cfg, phi, steps, theta_0)?;

    Ok((loss_plus - loss_minus) / (2.0 * eps))
}

/// Compare `analytical` against `numerical(idx)` on up to `num_samples`
/// evenly strided entries.
///
/// Uses relative error with denominator = max(|a|, |b|). Entries where both
/// are below `abs_threshold` are auto-passed (below FD resolution).
pub fn compare_gradient(
    name: &str,
    analytical: &[f64],
    mut numerical: impl FnMut(usize) -> Result<f64>,
    num_samples: usize,
    tol: f64,
    abs_threshold: f64,
) -> Result<GradCheck> {
    let n = analytical.len();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut result = GradCheck::default();

    for idx in (0..n).step_by(step).take(num_samples) {
        let a = analytical[idx];
        let fd = numerical(idx)?;
        let denom = a.abs().max(fd.abs());
        result.checked += 1;

        if denom < abs_threshold {
            result.passed += 1;
            continue;
        }

        let rel_err = (a - fd).abs() / denom;
        if rel_err > result.max_rel_err {
            result.max_rel_err = rel_err;
        }
        if rel_err < tol {
            result.passed += 1;
        } else {
            eprintln!(
                "  FAIL {name}[{idx}]: analytical={a:.6e}, numerical={fd:.6e}, rel_err={rel_err:.4e}"
            );
        }
    }
    Ok(result)
}

/// Check one gate buffer (index into `BUFFER_NAMES`).
#[allow(clippy::too_many_arguments)]
pub fn check_buffer_gradient(
    params: &GatedParams,
    cfg: &GatedConfig,
    phi: &FeatureTensor,
    steps: &[Step],
    theta_0: &[f64],
    grads: &GatedParams,
    buf: usize,
    num_samples: usize,
    eps: f64,
    tol: f64,
) -> Result<GradCheck> {
    compare_gradient(
        BUFFER_NAMES[buf],
        grads.buffers()[buf],
        |idx| fd_single(params, cfg, phi, steps, theta_0, buf, idx, eps),
        num_samples,
        tol,
        1e-6,
    )
}

/// Check every gate buffer; returns (name, result) pairs.
#[allow(clippy::too_many_arguments)]
pub fn check_all_gradients(
    params: &GatedParams,
    cfg: &GatedConfig,
    phi: &FeatureTensor,
    steps: &[Step],
    theta_0: &[f64],
    num_samples: usize,
    eps: f64,
    tol: f64,
) -> Result<Vec<(&'static str, GradCheck)>> {
    let (_, grads) = compute_gradients(params, cfg, phi, steps, theta_0)?;
    (0..BUFFER_NAMES.len())
        .map(|buf| {
            let r = check_buffer_gradient(params, cfg, phi, steps, theta_0, &grads, buf, num_samples, eps, tol)?;
            Ok((BUFFER_NAMES[buf], r))
        })
        .collect()
}
