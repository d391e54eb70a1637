/// Retention / update gate.
///
/// Forward:
///   h    = W_l2 @ θ                       [k]
///   pre  = W_l1 @ h + Φ_xᵀ @ w_x + b        [D]
///   gate = clamp(σ(pre), ε, 1-ε)           [D]
///
/// The clamp keeps the gate strictly inside (0, 1) even where σ saturates
/// at the configured precision. Backward accumulates into a GateParams
/// shadow and into dθ.

use crate::model::GateParams;
use crate::tensor::{Precision, matvec_f64, matvec_t_acc_f64, outer_acc_f64, sigmoid_f64};

/// Cached forward values of one gate at one step.
#[derive(Clone, Debug)]
pub struct GateActivation {
    /// Low-rank projection W_l2 @ θ. [k]
    pub hidden: Vec<f64>,
    /// Gate output in [ε, 1-ε]. [D]
    pub value: Vec<f64>,
}

/// Gate forward pass. `phi_x` is the event's `[C, D]` feature slice.
pub fn gate_forward(
    gate: &GateParams,
    theta: &[f64],
    phi_x: &[f64],
    d: usize,
    k: usize,
    c: usize,
    precision: Precision,
) -> GateActivation {
    debug_assert_eq!(theta.len(), d);
    debug_assert_eq!(phi_x.len(), c * d);

    let mut hidden = vec![0.0f64; k];
    matvec_f64(&gate.w_l2, theta, &mut hidden, k, d);

    let mut pre = gate.b.clone();
    let mut expanded = vec![0.0f64; d];
    matvec_f64(&gate.w_l1, &hidden, &mut expanded, d, k);
    for i in 0..d {
        pre[i] += expanded[i];
    }
    matvec_t_acc_f64(phi_x, &gate.w_x, &mut pre, c, d);

    let eps = precision.eps();
    let lo = precision.round(eps);
    let hi = precision.round(1.0 - eps);
    let value = pre
        .iter()
        .map(|&p| precision.round(sigmoid_f64(p)).clamp(lo, hi))
        .collect();
    GateActivation { hidden, value }
}

/// Gate backward pass.
///
/// Given `d_value` = dJ/dgate, accumulates dJ/dW into `grads` and dJ/dθ into
/// `d_theta`. Entries pinned by the clamp pass no gradient.
#[allow(clippy::too_many_arguments)]
pub fn gate_backward(
    gate: &GateParams,
    theta: &[f64],
    phi_x: &[f64],
    act: &GateActivation,
    d_value: &[f64],
    grads: &mut GateParams,
    d_theta: &mut [f64],
    d: usize,
    k: usize,
    c: usize,
    precision: Precision,
) {
    debug_assert_eq!(d_value.len(), d);
    debug_assert_eq!(d_theta.len(), d);

    let eps = precision.eps();
    let lo = precision.round(eps);
    let hi = precision.round(1.0 - eps);

    // ── σ' ──
    let mut d_pre = vec![0.0f64; d];
    for i in 0..d {
        let v = act.value[i];
        if v > lo && v < hi {
            d_pre[i] = d_value[i] * v * (1.0 - v);
        }
    }

    // ── bias + input projection ──
    for i in 0..d {
        grads.b[i] += d_pre[i];
    }
    for ci in 0..c {
        let row = &phi_x[ci * d..(ci + 1) * d];
        let mut s = 0.0f64;
        for i in 0..d {
            s += row[i] * d_pre[i];
        }
        grads.w_x[ci] += s;
    }

    // ── low-rank path ──
    outer_acc_f64(&d_pre, &act.hidden, &mut grads.w_l1);
    let mut d_hidden = vec![0.0f64; k];
    matvec_t_acc_f64(&gate.w_l1, &d_pre, &mut d_hidden, d, k);
    outer_acc_f64(&d_hidden, theta, &mut grads.w_l2);
    matvec_t_acc_f64(&gate.w_l2, &d_hidden, d_theta, k, d);
}
