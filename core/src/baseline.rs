/// Online log-linear baseline without gates.
///
/// θ restarts at zero for every sequence. Each step is scored with the
/// current θ, then θ ← θ - lr·(grad + 2·reg·θ). Reports the probability the
/// model gave the learner's selection on scored steps.

use serde::{Serialize, Deserialize};

use crate::classifier::classifier_forward;
use crate::error::{LearnerError, Result, ensure_finite};
use crate::eval::Summary;
use crate::features::FeatureTensor;
use crate::recurrence::Sequence;
use crate::tensor::Precision;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    pub learning_rate: f64,
    pub reg: f64,
    pub precision: Precision,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        BaselineConfig { learning_rate: 1.8, reg: 0.0, precision: Precision::Single }
    }
}

/// Run the baseline over every sequence; returns the p_u summary.
pub fn run_baseline(cfg: &BaselineConfig, phi: &FeatureTensor, sequences: &[Sequence]) -> Result<Summary> {
    let (c, d) = (phi.num_classes(), phi.feature_dim());
    let precision = cfg.precision;
    let mut probs = Vec::new();
    let mut global_step = 0usize;

    for seq in sequences {
        let mut theta = vec![0.0f64; d];
        for step in &seq.steps {
            if step.event >= phi.num_events() || step.mask.len() != c || step.selected >= c {
                return Err(LearnerError::Data(format!(
                    "user {}: step {global_step} does not fit the feature tensor", seq.user
                )));
            }
            let out = classifier_forward(
                &theta, phi.slice(step.event), step.selected, &step.mask, step.feedback, c, d, precision,
            )?;
            ensure_finite(&[out.loss], "loss", global_step)?;
            ensure_finite(&out.grad, "gradient", global_step)?;

            if step.is_scored() {
                probs.push(out.y_hat[step.selected]);
            }
            for i in 0..d {
                theta[i] = precision.round(theta[i] - cfg.learning_rate * (out.grad[i] + 2.0 * cfg.reg * theta[i]));
            }
            ensure_finite(&theta, "theta", global_step + 1)?;
            global_step += 1;
        }
    }
    Ok(Summary::of(&probs))
}
