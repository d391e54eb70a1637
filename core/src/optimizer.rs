/// Gate-parameter optimizers: plain SGD and RMSProp.
///
/// RMSProp keeps one squared-gradient accumulator per parameter buffer,
/// zero-initialized, persisting across sequences and epochs. The learning
/// rate is supplied per call so the trainer can decay it.
///
///   accu  ← ρ·accu + (1-ρ)·g²
///   param ← param - lr·g / sqrt(accu + ε)

use serde::{Serialize, Deserialize};

use crate::error::{LearnerError, Result};
use crate::tensor::Precision;

/// Which update rule to apply.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum UpdateRule {
    Sgd,
    RmsProp { rho: f64, eps: f64 },
}

impl UpdateRule {
    /// RMSProp with ρ = 0.9, ε = 1e-6.
    pub fn rmsprop() -> Self {
        UpdateRule::RmsProp { rho: 0.9, eps: 1e-6 }
    }

    pub fn validate(&self) -> Result<()> {
        if let UpdateRule::RmsProp { rho, eps } = *self {
            if !(0.0..1.0).contains(&rho) {
                return Err(LearnerError::Config(format!("rmsprop rho must be in [0, 1), got {rho}")));
            }
            if !(eps > 0.0 && eps.is_finite()) {
                return Err(LearnerError::Config(format!("rmsprop eps must be positive, got {eps}")));
            }
        }
        Ok(())
    }
}

/// Plain SGD on one buffer: params -= lr * grads.
#[inline]
pub fn sgd_step_buf(params: &mut [f64], grads: &[f64], lr: f64) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        params[i] -= lr * grads[i];
    }
}

/// RMSProp on one buffer. Modifies params and accu in place.
#[inline]
pub fn rmsprop_step_buf(params: &mut [f64], grads: &[f64], accu: &mut [f64], lr: f64, rho: f64, eps: f64) {
    debug_assert_eq!(params.len(), grads.len());
    debug_assert_eq!(params.len(), accu.len());
    for i in 0..params.len() {
        let g = grads[i];
        accu[i] = rho * accu[i] + (1.0 - rho) * g * g;
        params[i] -= lr * g / (accu[i] + eps).sqrt();
    }
}

/// Optimizer state: the rule plus per-buffer accumulators.
///
/// Buffers are addressed positionally, so callers must always pass parameter
/// and gradient buffers in the same order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub rule: UpdateRule,
    accu: Vec<Vec<f64>>,
    steps: u64,
}

impl OptimizerState {
    /// Zero accumulators sized to `buffer_lens`.
    pub fn new(rule: UpdateRule, buffer_lens: &[usize]) -> Self {
        let accu = match rule {
            UpdateRule::Sgd => Vec::new(),
            UpdateRule::RmsProp { .. } => buffer_lens.iter().map(|&n| vec![0.0; n]).collect(),
        };
        OptimizerState { rule, accu, steps: 0 }
    }

    /// Number of update calls applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Squared-gradient accumulator of one buffer (empty for SGD).
    pub fn accumulator(&self, buf: usize) -> &[f64] {
        self.accu.get(buf).map(|a| a.as_slice()).unwrap_or(&[])
    }

    /// Apply one update to every (param, grad) buffer pair.
    ///
    /// Fails with `Config` on a buffer count or length mismatch; nothing is
    /// modified in that case.
    pub fn step(
        &mut self,
        params: Vec<&mut [f64]>,
        grads: Vec<&[f64]>,
        lr: f64,
        precision: Precision,
    ) -> Result<()> {
        if params.len() != grads.len() {
            return Err(LearnerError::Config(format!(
                "optimizer got {} parameter buffers but {} gradient buffers",
                params.len(),
                grads.len()
            )));
        }
        for (i, (p, g)) in params.iter().zip(&grads).enumerate() {
            if p.len() != g.len() {
                return Err(LearnerError::Config(format!(
                    "buffer {i}: {} parameters but {} gradients", p.len(), g.len()
                )));
            }
            if let UpdateRule::RmsProp { .. } = self.rule {
                if self.accu.get(i).map(|a| a.len()) != Some(p.len()) {
                    return Err(LearnerError::Config(format!(
                        "buffer {i}: optimizer state does not match parameter shape"
                    )));
                }
            }
        }

        for (i, (p, g)) in params.into_iter().zip(grads).enumerate() {
            match self.rule {
                UpdateRule::Sgd => sgd_step_buf(p, g, lr),
                UpdateRule::RmsProp { rho, eps } => {
                    rmsprop_step_buf(p, g, &mut self.accu[i], lr, rho, eps);
                    precision.round_slice(&mut self.accu[i]);
                }
            }
            precision.round_slice(p);
        }
        self.steps += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_step() {
        let mut p = [1.0, -2.0];
        sgd_step_buf(&mut p, &[0.5, -1.0], 0.1);
        assert!((p[0] - 0.95).abs() < 1e-12);
        assert!((p[1] + 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_rmsprop_first_step() {
        // accu = 0.1 * g², step = lr * g / sqrt(0.1 g² + eps)
        let mut p = [0.0];
        let mut accu = [0.0];
        rmsprop_step_buf(&mut p, &[2.0], &mut accu, 0.01, 0.9, 1e-6);
        assert!((accu[0] - 0.4).abs() < 1e-12);
        let expected = -0.01 * 2.0 / (0.4f64 + 1e-6).sqrt();
        assert!((p[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rmsprop_accumulator_persists() {
        let mut state = OptimizerState::new(UpdateRule::rmsprop(), &[1]);
        let mut w = vec![0.0];
        for _ in 0..3 {
            state.step(vec![&mut w[..]], vec![&[1.0][..]], 0.1, Precision::Double).unwrap();
        }
        // 1 - 0.9^3
        assert!((state.accumulator(0)[0] - 0.271).abs() < 1e-12);
        assert_eq!(state.steps(), 3);
    }

    #[test]
    fn test_sgd_state_has_no_accumulators() {
        let mut state = OptimizerState::new(UpdateRule::Sgd, &[2, 3]);
        assert!(state.accumulator(0).is_empty());
        let mut a = vec![1.0, 1.0];
        state.step(vec![&mut a[..]], vec![&[1.0, 2.0][..]], 0.5, Precision::Double).unwrap();
        assert_eq!(a, vec![0.5, 0.0]);
    }

    #[test]
    fn test_shape_mismatch_leaves_params_untouched() {
        let mut state = OptimizerState::new(UpdateRule::rmsprop(), &[2, 2]);
        let mut a = vec![1.0, 1.0];
        let mut b = vec![1.0, 1.0];
        let err = state
            .step(vec![&mut a[..], &mut b[..]], vec![&[1.0, 1.0][..], &[1.0][..]], 0.1, Precision::Double)
            .unwrap_err();
        assert!(matches!(err, LearnerError::Config(_)));
        assert_eq!(a, vec![1.0, 1.0]);
        assert_eq!(state.steps(), 0);
    }

    #[test]
    fn test_validate_rule() {
        assert!(UpdateRule::rmsprop().validate().is_ok());
        assert!(UpdateRule::Sgd.validate().is_ok());
        assert!(UpdateRule::RmsProp { rho: 1.0, eps: 1e-6 }.validate().is_err());
        assert!(UpdateRule::RmsProp { rho: 0.9, eps: 0.0 }.validate().is_err());
    }
}
