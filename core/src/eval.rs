/// Held-out evaluation and the one-line report.
///
/// Line format (three decimals):
///   ave model loss:M,S,N,K p_u:M,S,K p_c:M,S,K p_ic:M,S,K p_ict:M,S,K acc:A
///
/// With a `dev:` or `train:` prefix, splitting on whitespace and ':' and
/// dropping empty tokens and the prefix puts the loss mean at index 3, the
/// p_u mean at 5 and the accuracy at 13.

use std::fmt;

use crate::error::Result;
use crate::features::FeatureTensor;
use crate::corpus::FeedbackLabel;
use crate::learner::GatedLogLinear;
use crate::recurrence::Sequence;
use crate::tensor::{argmax_f64, mean_std_f64};

/// Mean, population std and count of a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

impl Summary {
    pub fn of(values: &[f64]) -> Self {
        let (mean, std) = mean_std_f64(values);
        Summary { mean, std, count: values.len() }
    }
}

/// Everything the report line shows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvalStats {
    /// Summed loss per sequence.
    pub loss: Summary,
    /// Number of scored steps.
    pub scored_steps: usize,
    /// ŷ of the selected class, all scored steps.
    pub p_u: Summary,
    /// Same, correct-labelled steps.
    pub p_c: Summary,
    /// Same, incorrect-labelled steps.
    pub p_ic: Summary,
    /// ŷ of the true class on incorrect steps where it is known.
    pub p_ict: Summary,
    /// Fraction of scored steps whose argmax ŷ is the selected class.
    pub acc: f64,
}

impl fmt::Display for EvalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ave model loss:{:.3},{:.3},{},{} p_u:{:.3},{:.3},{} p_c:{:.3},{:.3},{} p_ic:{:.3},{:.3},{} p_ict:{:.3},{:.3},{} acc:{:.3}",
            self.loss.mean, self.loss.std, self.loss.count, self.scored_steps,
            self.p_u.mean, self.p_u.std, self.p_u.count,
            self.p_c.mean, self.p_c.std, self.p_c.count,
            self.p_ic.mean, self.p_ic.std, self.p_ic.count,
            self.p_ict.mean, self.p_ict.std, self.p_ict.count,
            self.acc,
        )
    }
}

/// Loss mean, p_u mean and accuracy recovered from a prefixed report line.
pub fn parse_report_line(line: &str) -> Option<(f64, f64, f64)> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ':')
        .filter(|t| !t.is_empty())
        .skip(1)
        .collect();
    let first = |i: usize| -> Option<f64> { tokens.get(i)?.split(',').next()?.parse().ok() };
    Some((first(3)?, first(5)?, first(13)?))
}

/// Run every sequence from `theta_0` without touching the parameters.
pub fn evaluate(
    model: &GatedLogLinear,
    phi: &FeatureTensor,
    sequences: &[Sequence],
    theta_0: &[f64],
) -> Result<EvalStats> {
    let mut seq_losses = Vec::with_capacity(sequences.len());
    let mut p_u = Vec::new();
    let mut p_c = Vec::new();
    let mut p_ic = Vec::new();
    let mut p_ict = Vec::new();
    let mut hits = 0usize;

    for seq in sequences {
        let (loss, cache) = model.forward(phi, &seq.steps, theta_0)?;
        seq_losses.push(loss);
        for (t, step) in seq.steps.iter().enumerate() {
            if !step.is_scored() {
                continue;
            }
            let y_hat = cache.y_hat(t);
            let p = y_hat[step.selected];
            p_u.push(p);
            match step.label {
                FeedbackLabel::Correct => p_c.push(p),
                FeedbackLabel::Incorrect => {
                    p_ic.push(p);
                    if let Some(tc) = step.true_class {
                        p_ict.push(y_hat[tc]);
                    }
                }
                _ => {}
            }
            if argmax_f64(y_hat) == Some(step.selected) {
                hits += 1;
            }
        }
    }

    let scored_steps = p_u.len();
    Ok(EvalStats {
        loss: Summary::of(&seq_losses),
        scored_steps,
        p_u: Summary::of(&p_u),
        p_c: Summary::of(&p_c),
        p_ic: Summary::of(&p_ic),
        p_ict: Summary::of(&p_ict),
        acc: if scored_steps == 0 { 0.0 } else { hits as f64 / scored_steps as f64 },
    })
}
