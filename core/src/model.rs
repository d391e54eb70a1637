/// Gated log-linear model configuration and gate parameters.
///
/// The trainable parameters are the two gates (retention `r`, update `z`);
/// the log-linear weight vector θ is recurrent state, not a parameter.
/// All weight matrices are flat Vec<f64> in row-major layout.

use std::path::Path;

use serde::{Serialize, Deserialize};

use crate::error::{LearnerError, Result};
use crate::optimizer::{OptimizerState, UpdateRule};
use crate::tensor::{Precision, SimpleRng, sum_sq_f64};

/// How gate weights are initialized. Biases always start at zero.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParamInit {
    /// All-zero weights. Note: with zero low-rank factors both factors receive
    /// zero gradient, so only `w_x` and `b` ever move.
    Zeros,
    /// Uniform in [-scale, scale] from a seeded xorshift stream.
    Uniform { scale: f64, seed: u64 },
}

/// Model configuration. Immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatedConfig {
    /// Number of distinct input events (rows of Φ).
    pub num_events: usize,
    /// Number of output classes C.
    pub num_classes: usize,
    /// Feature dimension D (length of θ).
    pub feature_dim: usize,
    /// Bottleneck k of the low-rank θ→gate projection.
    pub low_rank_dim: usize,
    /// L2 strength λ on the gate parameters.
    pub reg: f64,
    /// Whether the L2 penalty also covers the gate biases.
    pub regularize_bias: bool,
    pub update_rule: UpdateRule,
    pub precision: Precision,
    pub init: ParamInit,
}

impl GatedConfig {
    /// Configuration sized for a feature tensor, with the research defaults
    /// (k=20, λ=0.01, RMSProp, f32).
    pub fn for_dims(num_events: usize, num_classes: usize, feature_dim: usize) -> Self {
        GatedConfig {
            num_events,
            num_classes,
            feature_dim,
            low_rank_dim: 20,
            reg: 0.01,
            regularize_bias: true,
            update_rule: UpdateRule::rmsprop(),
            precision: Precision::Single,
            init: ParamInit::Uniform { scale: 0.01, seed: 42 },
        }
    }

    /// Tiny configuration for gradient checking: double precision, k=2.
    pub fn test_config() -> Self {
        GatedConfig {
            num_events: 3,
            num_classes: 4,
            feature_dim: 6,
            low_rank_dim: 2,
            reg: 0.01,
            regularize_bias: true,
            update_rule: UpdateRule::rmsprop(),
            precision: Precision::Double,
            init: ParamInit::Uniform { scale: 0.3, seed: 42 },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_events == 0 || self.num_classes == 0 || self.feature_dim == 0 {
            return Err(LearnerError::Config(format!(
                "dimensions must be positive (events={}, classes={}, features={})",
                self.num_events, self.num_classes, self.feature_dim
            )));
        }
        if self.low_rank_dim == 0 {
            return Err(LearnerError::Config("low_rank_dim must be positive".into()));
        }
        if !self.reg.is_finite() || self.reg < 0.0 {
            return Err(LearnerError::Config(format!("reg must be finite and >= 0, got {}", self.reg)));
        }
        if let ParamInit::Uniform { scale, .. } = self.init {
            if !scale.is_finite() || scale < 0.0 {
                return Err(LearnerError::Config(format!("init scale must be finite and >= 0, got {scale}")));
            }
        }
        self.update_rule.validate()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let cfg: GatedConfig = serde_json::from_str(&json)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

// ── Gate Parameters ──────────────────────────────────────────────────

/// One gate's weights.
///
/// Layout (row-major):
///   w_l1: [D, k]  low-rank expansion
///   w_l2: [k, D]  low-rank compression of θ
///   w_x:  [C]     input projection: W_x @ Φ_x gives a [D] contribution
///   b:    [D]     bias
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateParams {
    pub w_l1: Vec<f64>,
    pub w_l2: Vec<f64>,
    pub w_x: Vec<f64>,
    pub b: Vec<f64>,
}

impl GateParams {
    pub fn zeros(d: usize, k: usize, c: usize) -> Self {
        GateParams {
            w_l1: vec![0.0; d * k],
            w_l2: vec![0.0; k * d],
            w_x: vec![0.0; c],
            b: vec![0.0; d],
        }
    }

    fn init(d: usize, k: usize, c: usize, rng: &mut SimpleRng, scale: f64) -> Self {
        let mut g = Self::zeros(d, k, c);
        rng.fill_uniform(&mut g.w_l1, scale);
        rng.fill_uniform(&mut g.w_l2, scale);
        rng.fill_uniform(&mut g.w_x, scale);
        g
    }

    pub fn num_params(&self) -> usize {
        self.w_l1.len() + self.w_l2.len() + self.w_x.len() + self.b.len()
    }

    fn buffers(&self) -> [&[f64]; 4] {
        [&self.w_l1, &self.w_l2, &self.w_x, &self.b]
    }

    fn buffers_mut(&mut self) -> [&mut [f64]; 4] {
        [&mut self.w_l1, &mut self.w_l2, &mut self.w_x, &mut self.b]
    }
}

/// Names of the eight trainable buffers, in `GatedParams::buffers()` order.
pub const BUFFER_NAMES: [&str; 8] = [
    "retain.w_l1", "retain.w_l2", "retain.w_x", "retain.b",
    "update.w_l1", "update.w_l2", "update.w_x", "update.b",
];

/// Index of each bias buffer in `BUFFER_NAMES`.
const BIAS_BUFFERS: [usize; 2] = [3, 7];

/// All trainable parameters: retention gate r and update gate z.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatedParams {
    pub retain: GateParams,
    pub update: GateParams,
}

impl GatedParams {
    pub fn init(cfg: &GatedConfig) -> Self {
        let (d, k, c) = (cfg.feature_dim, cfg.low_rank_dim, cfg.num_classes);
        match cfg.init {
            ParamInit::Zeros => Self::zeros_like(cfg),
            ParamInit::Uniform { scale, seed } => {
                // Different seed offset per gate to avoid correlation
                let mut r_rng = SimpleRng::new(seed);
                let mut z_rng = SimpleRng::new(seed.wrapping_add(1000));
                GatedParams {
                    retain: GateParams::init(d, k, c, &mut r_rng, scale),
                    update: GateParams::init(d, k, c, &mut z_rng, scale),
                }
            }
        }
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(cfg: &GatedConfig) -> Self {
        let (d, k, c) = (cfg.feature_dim, cfg.low_rank_dim, cfg.num_classes);
        GatedParams {
            retain: GateParams::zeros(d, k, c),
            update: GateParams::zeros(d, k, c),
        }
    }

    pub fn num_params(&self) -> usize {
        self.retain.num_params() + self.update.num_params()
    }

    /// The eight buffers in `BUFFER_NAMES` order.
    pub fn buffers(&self) -> Vec<&[f64]> {
        let mut out = Vec::with_capacity(8);
        out.extend(self.retain.buffers());
        out.extend(self.update.buffers());
        out
    }

    pub fn buffers_mut(&mut self) -> Vec<&mut [f64]> {
        let mut out = Vec::with_capacity(8);
        out.extend(self.retain.buffers_mut());
        out.extend(self.update.buffers_mut());
        out
    }

    /// Shape of each buffer in `BUFFER_NAMES` order.
    pub fn shapes(cfg: &GatedConfig) -> [Vec<usize>; 8] {
        let (d, k, c) = (cfg.feature_dim, cfg.low_rank_dim, cfg.num_classes);
        [
            vec![d, k], vec![k, d], vec![c], vec![d],
            vec![d, k], vec![k, d], vec![c], vec![d],
        ]
    }

    /// Fail with `Config` unless every buffer has the size `cfg` implies.
    pub fn check_shapes(&self, cfg: &GatedConfig) -> Result<()> {
        for ((name, buf), shape) in BUFFER_NAMES.iter().zip(self.buffers()).zip(Self::shapes(cfg)) {
            let expected: usize = shape.iter().product();
            if buf.len() != expected {
                return Err(LearnerError::Config(format!(
                    "{name}: expected {expected} values for shape {shape:?}, found {}",
                    buf.len()
                )));
            }
        }
        Ok(())
    }

    /// Σ‖W‖² over the regularized buffers.
    pub fn l2_penalty(&self, regularize_bias: bool) -> f64 {
        self.buffers()
            .iter()
            .enumerate()
            .filter(|(i, _)| regularize_bias || !BIAS_BUFFERS.contains(i))
            .map(|(_, b)| sum_sq_f64(b))
            .sum()
    }

    /// grads += 2λW over the regularized buffers.
    pub fn add_l2_gradient(&self, reg: f64, regularize_bias: bool, grads: &mut GatedParams) {
        if reg == 0.0 {
            return;
        }
        for (i, (g, w)) in grads.buffers_mut().into_iter().zip(self.buffers()).enumerate() {
            if !regularize_bias && BIAS_BUFFERS.contains(&i) {
                continue;
            }
            for (gi, wi) in g.iter_mut().zip(w) {
                *gi += 2.0 * reg * wi;
            }
        }
    }

    /// Element-wise accumulate: self += other.
    pub fn accumulate(&mut self, other: &GatedParams) {
        for (dst, src) in self.buffers_mut().into_iter().zip(other.buffers()) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
    }

    /// Frobenius norm across all buffers.
    pub fn norm(&self) -> f64 {
        self.buffers().iter().map(|b| sum_sq_f64(b)).sum::<f64>().sqrt()
    }

    pub fn all_finite(&self) -> bool {
        self.buffers().iter().all(|b| b.iter().all(|v| v.is_finite()))
    }
}

// ── Checkpoint Serialization ─────────────────────────────────────────

/// Internal wrapper for the JSON checkpoint format.
#[derive(Serialize, Deserialize)]
struct ModelCheckpoint {
    config: GatedConfig,
    params: GatedParams,
    optimizer: OptimizerState,
}

/// Save config + params + optimizer state to a JSON file.
pub fn save_checkpoint(
    path: &Path,
    config: &GatedConfig,
    params: &GatedParams,
    optimizer: &OptimizerState,
) -> Result<()> {
    let checkpoint = ModelCheckpoint {
        config: config.clone(),
        params: params.clone(),
        optimizer: optimizer.clone(),
    };
    let json = serde_json::to_string(&checkpoint)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load config + params + optimizer state from a JSON file.
pub fn load_checkpoint(path: &Path) -> Result<(GatedConfig, GatedParams, OptimizerState)> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: ModelCheckpoint = serde_json::from_str(&json)?;
    checkpoint.config.validate()?;
    checkpoint.params.check_shapes(&checkpoint.config)?;
    Ok((checkpoint.config, checkpoint.params, checkpoint.optimizer))
}

// ── Human-readable export ────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct NamedArray {
    name: String,
    shape: Vec<usize>,
    values: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct ParamExport {
    arrays: Vec<NamedArray>,
}

/// Write every gate buffer as a named, shaped array (pretty-printed JSON).
pub fn export_params(path: &Path, config: &GatedConfig, params: &GatedParams) -> Result<()> {
    let arrays = BUFFER_NAMES
        .iter()
        .zip(params.buffers())
        .zip(GatedParams::shapes(config))
        .map(|((name, buf), shape)| NamedArray {
            name: name.to_string(),
            shape,
            values: buf.to_vec(),
        })
        .collect();
    let json = serde_json::to_string_pretty(&ParamExport { arrays })?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read an export written by `export_params` back into parameters for `config`.
pub fn import_params(path: &Path, config: &GatedConfig) -> Result<GatedParams> {
    let json = std::fs::read_to_string(path)?;
    let export: ParamExport = serde_json::from_str(&json)?;
    let mut params = GatedParams::zeros_like(config);
    let shapes = GatedParams::shapes(config);
    for (i, (dst, name)) in params.buffers_mut().into_iter().zip(BUFFER_NAMES).enumerate() {
        let array = export
            .arrays
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| LearnerError::Config(format!("export is missing array {name}")))?;
        if array.shape != shapes[i] || array.values.len() != dst.len() {
            return Err(LearnerError::Config(format!(
                "{name}: export shape {:?} does not match model shape {:?}",
                array.shape, shapes[i]
            )));
        }
        dst.copy_from_slice(&array.values);
    }
    Ok(params)
}
