/// Epoch loop: online updates, per-epoch evaluation, early stopping.
///
/// Per epoch e:
///   lr_e = learning_rate / (1 + lr_decay·e)    (÷ #train sequences if scaled)
///   shuffle the training sequences, one `update` per sequence
///   evaluate dev then train, log both report lines
///   checkpoint whenever dev accuracy beats the previous epoch's

use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};
use tracing::{debug, error, info};

use crate::error::{LearnerError, Result};
use crate::eval::{EvalStats, evaluate};
use crate::features::FeatureTensor;
use crate::learner::GatedLogLinear;
use crate::recurrence::Sequence;
use crate::tensor::SimpleRng;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub max_epochs: usize,
    pub learning_rate: f64,
    pub lr_decay: f64,
    /// Divide the learning rate by the number of training sequences.
    pub scale_lr_by_corpus: bool,
    /// Early stopping never fires within this many epochs.
    pub warmup_epochs: usize,
    /// Consecutive non-improving epochs that stop training.
    pub patience: usize,
    pub shuffle_seed: u64,
    /// Checkpoint path; the parameter export goes next to it.
    #[serde(default)]
    pub save_path: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            max_epochs: 100,
            learning_rate: 0.05,
            lr_decay: 0.001,
            scale_lr_by_corpus: true,
            warmup_epochs: 10,
            patience: 2,
            shuffle_seed: 124,
            save_path: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(LearnerError::Config(format!("learning_rate must be positive, got {}", self.learning_rate)));
        }
        if !(self.lr_decay >= 0.0 && self.lr_decay.is_finite()) {
            return Err(LearnerError::Config(format!("lr_decay must be >= 0, got {}", self.lr_decay)));
        }
        if self.patience == 0 {
            return Err(LearnerError::Config("patience must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let cfg: TrainConfig = serde_json::from_str(&json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Learning rate for `epoch`.
    pub fn epoch_lr(&self, epoch: usize, num_train: usize) -> f64 {
        let lr = self.learning_rate / (1.0 + self.lr_decay * epoch as f64);
        if self.scale_lr_by_corpus && num_train > 0 {
            lr / num_train as f64
        } else {
            lr
        }
    }
}

/// Stops once the last `patience` epochs all failed to beat their
/// predecessor and more than `warmup` epochs have been observed.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    warmup: usize,
    patience: usize,
    prev: f64,
    history: Vec<bool>,
}

impl EarlyStopping {
    pub fn new(warmup: usize, patience: usize) -> Self {
        EarlyStopping { warmup, patience, prev: 0.0, history: Vec::new() }
    }

    /// Record this epoch's dev accuracy. Returns whether it improved on the
    /// previous epoch (not on the best so far).
    pub fn observe(&mut self, acc: f64) -> bool {
        let improved = acc > self.prev;
        self.history.push(improved);
        self.prev = acc;
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.history.len() > self.warmup
            && self.history.len() >= self.patience
            && self.history[self.history.len() - self.patience..].iter().all(|&b| !b)
    }

    pub fn epochs(&self) -> usize {
        self.history.len()
    }
}

#[derive(Clone, Debug)]
pub struct EpochReport {
    pub epoch: usize,
    pub lr: f64,
    pub dev: EvalStats,
    pub train: EvalStats,
    pub improved: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TrainReport {
    pub epochs: Vec<EpochReport>,
    pub stopped_early: bool,
}

impl TrainReport {
    pub fn best_dev_acc(&self) -> f64 {
        self.epochs.iter().map(|e| e.dev.acc).fold(0.0, f64::max)
    }
}

/// Where the human-readable export is written for a checkpoint path.
pub fn export_path(checkpoint: &Path) -> PathBuf {
    let mut name = checkpoint.as_os_str().to_owned();
    name.push(".params.json");
    PathBuf::from(name)
}

pub struct Trainer {
    pub config: TrainConfig,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Trainer { config })
    }

    /// Train `model` in place. Every sequence starts from θ_0 = 0.
    pub fn run(
        &self,
        model: &mut GatedLogLinear,
        phi: &FeatureTensor,
        train: &[Sequence],
        dev: &[Sequence],
    ) -> Result<TrainReport> {
        let theta_0 = vec![0.0f64; model.config().feature_dim];
        let mut rng = SimpleRng::new(self.config.shuffle_seed);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut stopping = EarlyStopping::new(self.config.warmup_epochs, self.config.patience);
        let mut report = TrainReport::default();

        info!(
            train = train.len(),
            dev = dev.len(),
            params = model.params().num_params(),
            "starting training"
        );

        for epoch in 0..self.config.max_epochs {
            let lr = self.config.epoch_lr(epoch, train.len());
            rng.shuffle(&mut order);

            for &idx in &order {
                let seq = &train[idx];
                match model.update(phi, &seq.steps, &theta_0, lr) {
                    Ok(out) => debug!(epoch, user = %seq.user, seq_loss = out.seq_loss, "trained sequence"),
                    Err(e) => {
                        error!(epoch, user = %seq.user, error = %e, "training aborted");
                        return Err(e);
                    }
                }
            }

            let dev_stats = evaluate(model, phi, dev, &theta_0)?;
            info!("dev: {dev_stats}");
            let train_stats = evaluate(model, phi, train, &theta_0)?;
            info!("train: {train_stats}");

            let improved = stopping.observe(dev_stats.acc);
            if improved {
                if let Some(path) = &self.config.save_path {
                    model.save(path)?;
                    model.export_params(&export_path(path))?;
                    info!(epoch, path = %path.display(), "saved checkpoint");
                }
            }
            report.epochs.push(EpochReport { epoch, lr, dev: dev_stats, train: train_stats, improved });

            if stopping.should_stop() {
                info!(epoch, "early stopping");
                report.stopped_early = true;
                break;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_waits_for_warmup() {
        let mut es = EarlyStopping::new(10, 2);
        es.observe(0.5);
        for _ in 0..9 {
            es.observe(0.5);
            assert!(!es.should_stop(), "stopped after {} epochs", es.epochs());
        }
        assert_eq!(es.epochs(), 10);
        es.observe(0.5);
        assert!(es.should_stop());
    }

    #[test]
    fn test_early_stopping_one_improvement_resets() {
        let mut es = EarlyStopping::new(0, 2);
        assert!(es.observe(0.1));
        assert!(!es.observe(0.1));
        assert!(!es.should_stop());
        assert!(es.observe(0.2));
        assert!(!es.observe(0.15));
        assert!(!es.should_stop());
        // 0.18 > 0.15: an improvement over the previous epoch, not the best
        assert!(es.observe(0.18));
        assert!(!es.observe(0.1));
        assert!(!es.observe(0.1));
        assert!(es.should_stop());
    }

    #[test]
    fn test_epoch_lr() {
        let cfg = TrainConfig { learning_rate: 1.0, lr_decay: 0.5, scale_lr_by_corpus: false, ..Default::default() };
        assert_eq!(cfg.epoch_lr(0, 10), 1.0);
        assert_eq!(cfg.epoch_lr(2, 10), 0.5);
        let cfg = TrainConfig { scale_lr_by_corpus: true, ..cfg };
        assert_eq!(cfg.epoch_lr(2, 10), 0.05);
    }

    #[test]
    fn test_validate() {
        assert!(TrainConfig::default().validate().is_ok());
        let bad = TrainConfig { learning_rate: 0.0, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = TrainConfig { patience: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_export_path() {
        assert_eq!(export_path(Path::new("/tmp/m.json")), PathBuf::from("/tmp/m.json.params.json"));
    }
}
