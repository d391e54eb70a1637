/// Crate-wide error type.
///
/// Three failure classes are unrecoverable at the point of detection:
/// - `Config`: malformed feature/vocabulary files, out-of-range indices,
///   invalid configuration values. Fatal at startup.
/// - `Data`: a step with no eligible class, an unknown event or class label,
///   a malformed corpus record. Fatal at the record.
/// - `NumericalDivergence`: NaN/Inf produced during or after a recurrence step.
///   Fatal for the run.
///
/// The core never retries; callers decide whether to skip, restart or halt.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LearnerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("numerical divergence: non-finite {quantity} at step {step}")]
    NumericalDivergence { quantity: &'static str, step: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LearnerError {
    pub fn is_divergence(&self) -> bool {
        matches!(self, LearnerError::NumericalDivergence { .. })
    }
}

pub type Result<T> = std::result::Result<T, LearnerError>;

/// Fail with `NumericalDivergence` unless every value in `buf` is finite.
pub fn ensure_finite(buf: &[f64], quantity: &'static str, step: usize) -> Result<()> {
    if buf.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(LearnerError::NumericalDivergence { quantity, step })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_finite_ok() {
        assert!(ensure_finite(&[0.0, -1.5, 3.0], "theta", 0).is_ok());
        assert!(ensure_finite(&[], "theta", 0).is_ok());
    }

    #[test]
    fn test_ensure_finite_nan_and_inf() {
        let err = ensure_finite(&[0.0, f64::NAN], "loss", 3).unwrap_err();
        assert!(err.is_divergence());
        assert_eq!(err.to_string(), "numerical divergence: non-finite loss at step 3");

        let err = ensure_finite(&[f64::INFINITY], "grad", 0).unwrap_err();
        assert!(matches!(err, LearnerError::NumericalDivergence { quantity: "grad", step: 0 }));
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(LearnerError::Config("bad".into()).to_string(), "config error: bad");
        assert_eq!(LearnerError::Data("empty mask".into()).to_string(), "data error: empty mask");
        assert!(!LearnerError::Data("x".into()).is_divergence());
    }
}
