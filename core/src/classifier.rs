/// Per-step log-linear classifier and cross-entropy loss.
///
/// Forward, for one event x with feature slice Φ_x [C, D]:
///   score  = Φ_x @ θ                         [C]
///   p      = softmax(score) over eligible     [C], 0 elsewhere
///   ŷ      = clip(p, ε, 1-ε) on eligible      [C]
///   τ      = one-hot(selected)                if feedback
///          = ŷ with selected zeroed, / Σ       otherwise
///   loss   = -Σ τ_c ln(ŷ_c + ε)
///   grad   = Φ_xᵀ @ (ŷ - τ)                   [D]
///
/// Backward differentiates both `loss` and `grad` with respect to θ, since
/// `grad` feeds the next θ through the recurrence.

use crate::error::{LearnerError, Result};
use crate::tensor::{Precision, masked_softmax_f64, matvec_f64, matvec_t_acc_f64, matvec_t_f64};

/// Forward values of one step, cached for the reverse sweep.
#[derive(Clone, Debug)]
pub struct StepOutput {
    /// Unclipped masked softmax.
    pub p: Vec<f64>,
    /// Clipped prediction ŷ.
    pub y_hat: Vec<f64>,
    /// Training target τ.
    pub target: Vec<f64>,
    /// Σ of the zeroed prediction used to renormalize τ (0 when feedback).
    pub target_norm: f64,
    pub loss: f64,
    /// dloss/dθ for this step. [D]
    pub grad: Vec<f64>,
}

/// Classifier forward pass.
///
/// Fails with `Data` if no class is eligible, or if negative feedback leaves
/// no eligible alternative to renormalize over.
#[allow(clippy::too_many_arguments)]
pub fn classifier_forward(
    theta: &[f64],
    phi_x: &[f64],
    selected: usize,
    mask: &[bool],
    feedback: bool,
    c: usize,
    d: usize,
    precision: Precision,
) -> Result<StepOutput> {
    debug_assert_eq!(theta.len(), d);
    debug_assert_eq!(phi_x.len(), c * d);
    debug_assert_eq!(mask.len(), c);
    let eps = precision.eps();

    // ── Scores + masked softmax ──
    let mut scores = vec![0.0f64; c];
    matvec_f64(phi_x, theta, &mut scores, c, d);
    let mut p = vec![0.0f64; c];
    if masked_softmax_f64(&scores, mask, &mut p) == 0 {
        return Err(LearnerError::Data("step has no eligible class".into()));
    }

    let mut y_hat = vec![0.0f64; c];
    for ci in 0..c {
        if mask[ci] {
            y_hat[ci] = precision.round(p[ci].clamp(eps, 1.0 - eps));
        }
    }

    // ── Target ──
    let mut target = vec![0.0f64; c];
    let mut target_norm = 0.0f64;
    if feedback {
        target[selected] = 1.0;
    } else {
        for ci in 0..c {
            if ci != selected {
                target[ci] = y_hat[ci];
                target_norm += y_hat[ci];
            }
        }
        if target_norm <= 0.0 {
            return Err(LearnerError::Data(format!(
                "negative feedback on class {selected} leaves no eligible alternative"
            )));
        }
        for t in target.iter_mut() {
            *t = precision.round(*t / target_norm);
        }
    }

    // ── Loss + analytic gradient ──
    let mut loss = 0.0f64;
    for ci in 0..c {
        if target[ci] != 0.0 {
            loss -= target[ci] * (y_hat[ci] + eps).ln();
        }
    }
    let residual: Vec<f64> = y_hat.iter().zip(&target).map(|(y, t)| y - t).collect();
    let mut grad = vec![0.0f64; d];
    matvec_t_f64(phi_x, &residual, &mut grad, c, d);
    precision.round_slice(&mut grad);

    Ok(StepOutput {
        p,
        y_hat,
        target,
        target_norm,
        loss: precision.round(loss),
        grad,
    })
}

/// Classifier backward pass.
///
/// `d_grad` is dJ/dgrad [D], `d_loss` is dJ/dloss. Accumulates dJ/dθ into
/// `d_theta`.
#[allow(clippy::too_many_arguments)]
pub fn classifier_backward(
    phi_x: &[f64],
    out: &StepOutput,
    selected: usize,
    mask: &[bool],
    feedback: bool,
    d_grad: &[f64],
    d_loss: f64,
    d_theta: &mut [f64],
    c: usize,
    d: usize,
    precision: Precision,
) {
    debug_assert_eq!(d_grad.len(), d);
    debug_assert_eq!(d_theta.len(), d);
    let eps = precision.eps();

    // grad = Φᵀ(ŷ - τ)  ⇒  d(ŷ - τ) = Φ @ d_grad
    let mut du = vec![0.0f64; c];
    matvec_f64(phi_x, d_grad, &mut du, c, d);

    let mut d_y_hat = vec![0.0f64; c];
    let mut d_target = vec![0.0f64; c];
    for ci in 0..c {
        if !mask[ci] {
            continue;
        }
        let lp = out.y_hat[ci] + eps;
        d_y_hat[ci] = du[ci] - d_loss * out.target[ci] / lp;
        d_target[ci] = -du[ci] - d_loss * lp.ln();
    }

    // ── Self-training target: τ_c = ŷ_c / S for c ≠ selected ──
    if !feedback {
        let weighted: f64 = d_target.iter().zip(&out.target).map(|(g, t)| g * t).sum();
        for ci in 0..c {
            if ci != selected && mask[ci] {
                d_y_hat[ci] += (d_target[ci] - weighted) / out.target_norm;
            }
        }
    }

    // ── Clip: pass-through only strictly inside [ε, 1-ε] ──
    let mut d_p = vec![0.0f64; c];
    for ci in 0..c {
        let p = out.p[ci];
        if mask[ci] && p > eps && p < 1.0 - eps {
            d_p[ci] = d_y_hat[ci];
        }
    }

    // ── Softmax ──
    let dot: f64 = out.p.iter().zip(&d_p).map(|(p, g)| p * g).sum();
    let d_scores: Vec<f64> = out.p.iter().zip(&d_p).map(|(p, g)| p * (g - dot)).collect();

    matvec_t_acc_f64(phi_x, &d_scores, d_theta, c, d);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::SimpleRng;

    fn random_phi(c: usize, d: usize, seed: u64) -> Vec<f64> {
        let mut rng = SimpleRng::new(seed);
        let mut phi = vec![0.0; c * d];
        rng.fill_uniform(&mut phi, 1.0);
        phi
    }

    #[test]
    fn test_masked_class_gets_zero() {
        let (c, d) = (4, 3);
        let phi = random_phi(c, d, 1);
        let theta = [0.5, -0.3, 0.8];
        let mask = [true, false, true, true];
        let out = classifier_forward(&theta, &phi, 0, &mask, true, c, d, Precision::Double).unwrap();
        assert_eq!(out.y_hat[1], 0.0);
        let sum: f64 = out.y_hat.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_mask_is_data_error() {
        let phi = random_phi(2, 2, 1);
        let err = classifier_forward(&[0.0, 0.0], &phi, 0, &[false, false], true, 2, 2, Precision::Double)
            .unwrap_err();
        assert!(matches!(err, LearnerError::Data(_)));
    }

    #[test]
    fn test_negative_feedback_target_blend() {
        // Three equal scores: ŷ = 1/3 each; zero the selected class and renormalize.
        let (c, d) = (3, 2);
        let phi = vec![0.0; c * d];
        let out = classifier_forward(&[0.0, 0.0], &phi, 1, &[true; 3], false, c, d, Precision::Double).unwrap();
        assert_eq!(out.target[1], 0.0);
        assert!((out.target[0] - 0.5).abs() < 1e-12);
        assert!((out.target[2] - 0.5).abs() < 1e-12);
        let expected = -(1.0f64 / 3.0 + f64::EPSILON).ln();
        assert!((out.loss - expected).abs() < 1e-12);
    }

    #[test]
    fn test_positive_feedback_one_hot() {
        let (c, d) = (3, 2);
        let phi = vec![0.0; c * d];
        let out = classifier_forward(&[0.0, 0.0], &phi, 2, &[true; 3], true, c, d, Precision::Double).unwrap();
        assert_eq!(out.target, vec![0.0, 0.0, 1.0]);
        assert_eq!(out.target_norm, 0.0);
    }

    #[test]
    fn test_negative_feedback_single_eligible_is_data_error() {
        let phi = vec![0.0; 4];
        let err = classifier_forward(&[0.0, 0.0], &phi, 0, &[true, false], false, 2, 2, Precision::Double)
            .unwrap_err();
        assert!(err.to_string().contains("no eligible alternative"));
    }

    #[test]
    fn test_clip_bounds() {
        // One class dominates: ŷ must stay within [ε, 1-ε].
        let (c, d) = (2, 1);
        let phi = vec![1000.0, -1000.0];
        for precision in [Precision::Single, Precision::Double] {
            let out = classifier_forward(&[1.0], &phi, 0, &[true, true], true, c, d, precision).unwrap();
            assert!(out.y_hat[0] < 1.0);
            assert!(out.y_hat[1] > 0.0);
            assert!(out.loss.is_finite());
        }
    }

    #[test]
    fn test_grad_matches_loss_derivative_with_feedback() {
        // With a one-hot target, grad is exactly dloss/dθ.
        let (c, d) = (3, 4);
        let phi = random_phi(c, d, 3);
        let theta = [0.1, 0.2, -0.3, 0.4];
        let mask = [true, true, true];
        let p = Precision::Double;
        let out = classifier_forward(&theta, &phi, 1, &mask, true, c, d, p).unwrap();
        let h = 1e-6;
        for i in 0..d {
            let mut tp = theta;
            let mut tm = theta;
            tp[i] += h;
            tm[i] -= h;
            let lp = classifier_forward(&tp, &phi, 1, &mask, true, c, d, p).unwrap().loss;
            let lm = classifier_forward(&tm, &phi, 1, &mask, true, c, d, p).unwrap().loss;
            let fd = (lp - lm) / (2.0 * h);
            assert!((fd - out.grad[i]).abs() < 1e-6, "i={i} fd={fd} grad={}", out.grad[i]);
        }
    }

    #[test]
    fn test_backward_matches_fd() {
        // J = loss + w·grad, both feedback modes, with a masked class.
        let (c, d) = (4, 3);
        let phi = random_phi(c, d, 9);
        let theta = [0.4, -0.6, 0.2];
        let mask = [true, true, false, true];
        let w = [0.7, -1.1, 0.3];
        let p = Precision::Double;

        for feedback in [true, false] {
            let objective = |th: &[f64]| -> f64 {
                let o = classifier_forward(th, &phi, 0, &mask, feedback, c, d, p).unwrap();
                o.loss + o.grad.iter().zip(&w).map(|(g, wi)| g * wi).sum::<f64>()
            };
            let out = classifier_forward(&theta, &phi, 0, &mask, feedback, c, d, p).unwrap();
            let mut d_theta = vec![0.0; d];
            classifier_backward(&phi, &out, 0, &mask, feedback, &w, 1.0, &mut d_theta, c, d, p);

            let h = 1e-6;
            for i in 0..d {
                let mut tp = theta;
                let mut tm = theta;
                tp[i] += h;
                tm[i] -= h;
                let fd = (objective(&tp) - objective(&tm)) / (2.0 * h);
                assert!(
                    (fd - d_theta[i]).abs() < 1e-5,
                    "feedback={feedback} i={i} fd={fd} analytic={}",
                    d_theta[i]
                );
            }
        }
    }
}
