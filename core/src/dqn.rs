/// Feed-forward Q-network trained on TD targets.
///
/// Forward (per state s, layers l = 1..L, weights W_l: [in, out]):
///   z_l = a_{l-1} @ W_l + b_l
///   a_l = leaky_relu(z_l, 0.1)      for l < L
///   Q   = z_L                        (linear output, one value per action)
///
/// Loss on a batch of transitions (s, a, r, s', terminal):
///   target = r                                  if terminal
///          = r + γ·max_a' Q_target(s')          otherwise (held constant)
///   batch  = mean_n ℓ(target_n - Q(s_n)[a_n])   ℓ = ½d² or Huber(δ=2)
///   total  = batch + λ·Σ_l ‖W_l‖²               (biases unregularized)
///
/// With target networks the target copy tracks the online one through a
/// soft update with τ = 0.1; without, τ = 1 and the copy is exact.

use std::path::Path;

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::error::{LearnerError, Result, ensure_finite};
use crate::optimizer::{OptimizerState, UpdateRule};
use crate::tensor::{Precision, SimpleRng, argmax_f64, matvec_f64, matvec_t_f64, outer_acc_f64, sum_sq_f64};

const LEAKY_SLOPE: f64 = 0.1;
const HUBER_DELTA: f64 = 2.0;
const HUBER_SHIFT: f64 = 1e-8;
const BIAS_INIT: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TdLoss {
    Squared,
    Huber,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DqnConfig {
    /// [state_dim, hidden..., num_actions]
    pub layer_dims: Vec<usize>,
    pub reg: f64,
    pub use_target_networks: bool,
    pub loss: TdLoss,
    pub update_rule: UpdateRule,
    pub precision: Precision,
    pub seed: u64,
}

impl DqnConfig {
    pub fn new(layer_dims: Vec<usize>) -> Self {
        DqnConfig {
            layer_dims,
            reg: 0.1,
            use_target_networks: false,
            loss: TdLoss::Squared,
            update_rule: UpdateRule::rmsprop(),
            precision: Precision::Single,
            seed: 124,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.layer_dims.len() < 2 || self.layer_dims.iter().any(|&n| n == 0) {
            return Err(LearnerError::Config(format!(
                "layer_dims needs at least two positive entries, got {:?}", self.layer_dims
            )));
        }
        if !(self.reg >= 0.0 && self.reg.is_finite()) {
            return Err(LearnerError::Config(format!("reg must be finite and >= 0, got {}", self.reg)));
        }
        self.update_rule.validate()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let cfg: DqnConfig = serde_json::from_str(&json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Soft-update rate of the target copy.
    pub fn tau(&self) -> f64 {
        if self.use_target_networks { 0.1 } else { 1.0 }
    }

    pub fn state_dim(&self) -> usize {
        self.layer_dims[0]
    }

    pub fn num_actions(&self) -> usize {
        self.layer_dims[self.layer_dims.len() - 1]
    }
}

/// One dense layer. `w` is [fan_in, fan_out], row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub w: Vec<f64>,
    pub b: Vec<f64>,
    pub fan_in: usize,
    pub fan_out: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    pub layers: Vec<Layer>,
}

impl QParams {
    /// Weights uniform in ±1/fan_in, biases uniform in ±0.01.
    pub fn init(cfg: &DqnConfig) -> Self {
        let mut rng = SimpleRng::new(cfg.seed);
        let layers = cfg
            .layer_dims
            .windows(2)
            .map(|w| {
                let (fan_in, fan_out) = (w[0], w[1]);
                let mut layer = Layer { w: vec![0.0; fan_in * fan_out], b: vec![0.0; fan_out], fan_in, fan_out };
                rng.fill_uniform(&mut layer.w, 1.0 / fan_in as f64);
                rng.fill_uniform(&mut layer.b, BIAS_INIT);
                cfg.precision.round_slice(&mut layer.w);
                cfg.precision.round_slice(&mut layer.b);
                layer
            })
            .collect();
        QParams { layers }
    }

    pub fn zeros_like(&self) -> Self {
        QParams {
            layers: self
                .layers
                .iter()
                .map(|l| Layer { w: vec![0.0; l.w.len()], b: vec![0.0; l.b.len()], fan_in: l.fan_in, fan_out: l.fan_out })
                .collect(),
        }
    }

    /// w_1, b_1, w_2, b_2, ...
    pub fn buffers(&self) -> Vec<&[f64]> {
        self.layers.iter().flat_map(|l| [l.w.as_slice(), l.b.as_slice()]).collect()
    }

    pub fn buffers_mut(&mut self) -> Vec<&mut [f64]> {
        self.layers.iter_mut().flat_map(|l| [l.w.as_mut_slice(), l.b.as_mut_slice()]).collect()
    }

    /// Σ‖W‖² over weights only.
    pub fn l2_penalty(&self) -> f64 {
        self.layers.iter().map(|l| sum_sq_f64(&l.w)).sum()
    }

    pub fn all_finite(&self) -> bool {
        self.buffers().iter().all(|b| b.iter().all(|v| v.is_finite()))
    }

    /// Q values for one state, with per-layer caches (pre-activation, input).
    fn forward(&self, state: &[f64]) -> (Vec<f64>, Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let n = self.layers.len();
        let mut inputs = Vec::with_capacity(n);
        let mut pres = Vec::with_capacity(n);
        let mut a = state.to_vec();
        for (idx, layer) in self.layers.iter().enumerate() {
            let mut z = vec![0.0f64; layer.fan_out];
            matvec_t_f64(&layer.w, &a, &mut z, layer.fan_in, layer.fan_out);
            for j in 0..layer.fan_out {
                z[j] += layer.b[j];
            }
            let next = if idx + 1 == n {
                z.clone()
            } else {
                z.iter().map(|&v| if v > 0.0 { v } else { LEAKY_SLOPE * v }).collect()
            };
            inputs.push(std::mem::replace(&mut a, next));
            pres.push(z);
        }
        (a, pres, inputs)
    }
}

/// One (s, a, r, s', terminal) transition.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: Vec<f64>,
    pub action: usize,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub terminal: bool,
}

/// Per-transition diagnostics of a batch.
#[derive(Clone, Debug)]
pub struct TdLosses {
    pub losses: Vec<f64>,
    pub targets: Vec<f64>,
    pub q_taken: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct DqnUpdate {
    pub total_loss: f64,
    pub batch_loss: f64,
    pub losses: Vec<f64>,
}

fn td_loss(kind: TdLoss, d: f64) -> (f64, f64) {
    // returns (ℓ(d), dℓ/dQ) with d = target - Q
    match kind {
        TdLoss::Squared => (0.5 * d * d, -d),
        TdLoss::Huber => {
            let shifted = d + HUBER_SHIFT;
            if shifted.abs() < HUBER_DELTA {
                (0.5 * d * d, -d)
            } else {
                (HUBER_DELTA * (shifted.abs() - HUBER_DELTA / 2.0), -HUBER_DELTA * shifted.signum())
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct QCheckpoint {
    config: DqnConfig,
    online: QParams,
    target: QParams,
    optimizer: OptimizerState,
}

#[derive(Clone, Debug)]
pub struct QNetwork {
    cfg: DqnConfig,
    online: QParams,
    target: QParams,
    optimizer: OptimizerState,
}

impl QNetwork {
    pub fn new(cfg: DqnConfig) -> Result<Self> {
        cfg.validate()?;
        let online = QParams::init(&cfg);
        let target = online.clone();
        let lens: Vec<usize> = online.buffers().iter().map(|b| b.len()).collect();
        let optimizer = OptimizerState::new(cfg.update_rule, &lens);
        Ok(QNetwork { cfg, online, target, optimizer })
    }

    pub fn config(&self) -> &DqnConfig {
        &self.cfg
    }

    pub fn params(&self) -> &QParams {
        &self.online
    }

    pub fn target_params(&self) -> &QParams {
        &self.target
    }

    fn check_shape(&self, params: &QParams) -> Result<()> {
        let same_shape = params.layers.len() == self.online.layers.len()
            && params.layers.iter().zip(&self.online.layers).all(|(a, b)| a.w.len() == b.w.len() && a.b.len() == b.b.len());
        if !same_shape {
            return Err(LearnerError::Config("q-network parameters do not match layer_dims".into()));
        }
        Ok(())
    }

    pub fn set_params(&mut self, params: QParams) -> Result<()> {
        self.check_shape(&params)?;
        self.online = params;
        Ok(())
    }

    fn check_state(&self, state: &[f64]) -> Result<()> {
        if state.len() != self.cfg.state_dim() {
            return Err(LearnerError::Data(format!(
                "state has {} entries, expected {}", state.len(), self.cfg.state_dim()
            )));
        }
        Ok(())
    }

    pub fn q_values(&self, state: &[f64]) -> Result<Vec<f64>> {
        self.check_state(state)?;
        let (q, _, _) = self.online.forward(state);
        ensure_finite(&q, "q values", 0)?;
        Ok(q)
    }

    /// Greedy action.
    pub fn predict_action(&self, state: &[f64]) -> Result<usize> {
        let q = self.q_values(state)?;
        argmax_f64(&q).ok_or_else(|| LearnerError::Config("network has no actions".into()))
    }

    /// λ·Σ‖W‖².
    pub fn reg_penalty(&self) -> f64 {
        self.cfg.reg * self.online.l2_penalty()
    }

    fn validate_batch(&self, batch: &[Transition]) -> Result<()> {
        if batch.is_empty() {
            return Err(LearnerError::Data("empty transition batch".into()));
        }
        for (n, tr) in batch.iter().enumerate() {
            self.check_state(&tr.state)?;
            self.check_state(&tr.next_state)?;
            if tr.action >= self.cfg.num_actions() {
                return Err(LearnerError::Data(format!(
                    "transition {n}: action {} out of range ({} actions)", tr.action, self.cfg.num_actions()
                )));
            }
            ensure_finite(&[tr.reward], "reward", n)?;
        }
        Ok(())
    }

    fn td_target(&self, tr: &Transition, gamma: f64) -> f64 {
        if tr.terminal {
            return tr.reward;
        }
        let net = if self.cfg.use_target_networks { &self.target } else { &self.online };
        let (q_next, _, _) = net.forward(&tr.next_state);
        let max_q = q_next.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        tr.reward + gamma * max_q
    }

    /// Per-transition losses, TD targets and Q(s, a).
    pub fn td_losses(&self, batch: &[Transition], gamma: f64) -> Result<TdLosses> {
        self.validate_batch(batch)?;
        let mut out = TdLosses { losses: Vec::new(), targets: Vec::new(), q_taken: Vec::new() };
        for (n, tr) in batch.iter().enumerate() {
            let target = self.td_target(tr, gamma);
            let (q, _, _) = self.online.forward(&tr.state);
            let (loss, _) = td_loss(self.cfg.loss, target - q[tr.action]);
            ensure_finite(&[target, loss], "td loss", n)?;
            out.losses.push(loss);
            out.targets.push(target);
            out.q_taken.push(q[tr.action]);
        }
        Ok(out)
    }

    /// (total loss, batch loss, per-transition losses, gradients).
    fn loss_and_grads(&self, batch: &[Transition], gamma: f64) -> Result<(f64, f64, Vec<f64>, QParams)> {
        self.validate_batch(batch)?;
        let mut grads = self.online.zeros_like();
        let scale = 1.0 / batch.len() as f64;
        let mut losses = Vec::with_capacity(batch.len());

        for (n, tr) in batch.iter().enumerate() {
            let target = self.td_target(tr, gamma);
            let (q, pres, inputs) = self.online.forward(&tr.state);
            let (loss, d_q_a) = td_loss(self.cfg.loss, target - q[tr.action]);
            ensure_finite(&[target, loss], "td loss", n)?;
            losses.push(loss);

            // ── Reverse layer loop ──
            let mut d_z = vec![0.0f64; q.len()];
            d_z[tr.action] = d_q_a * scale;
            for idx in (0..self.online.layers.len()).rev() {
                let layer = &self.online.layers[idx];
                let g = &mut grads.layers[idx];
                outer_acc_f64(&inputs[idx], &d_z, &mut g.w);
                for j in 0..layer.fan_out {
                    g.b[j] += d_z[j];
                }
                if idx == 0 {
                    break;
                }
                let mut d_a = vec![0.0f64; layer.fan_in];
                matvec_f64(&layer.w, &d_z, &mut d_a, layer.fan_in, layer.fan_out);
                let prev_pre = &pres[idx - 1];
                d_z = d_a
                    .iter()
                    .zip(prev_pre)
                    .map(|(&da, &z)| if z > 0.0 { da } else { LEAKY_SLOPE * da })
                    .collect();
            }
        }

        for (g, l) in grads.layers.iter_mut().zip(&self.online.layers) {
            for (gi, wi) in g.w.iter_mut().zip(&l.w) {
                *gi += 2.0 * self.cfg.reg * wi;
            }
        }
        for buf in grads.buffers() {
            ensure_finite(buf, "q-network gradient", batch.len())?;
        }

        let batch_loss = losses.iter().sum::<f64>() * scale;
        let total = batch_loss + self.reg_penalty();
        Ok((total, batch_loss, losses, grads))
    }

    /// Total loss and its gradient w.r.t. every online buffer.
    pub fn gradients(&self, batch: &[Transition], gamma: f64) -> Result<(f64, QParams)> {
        let (total, _, _, grads) = self.loss_and_grads(batch, gamma)?;
        Ok((total, grads))
    }

    /// One optimizer step. Nothing changes on error.
    pub fn update(&mut self, batch: &[Transition], gamma: f64, lr: f64) -> Result<DqnUpdate> {
        let (total_loss, batch_loss, losses, grads) = self.loss_and_grads(batch, gamma)?;
        let mut online = self.online.clone();
        let mut optimizer = self.optimizer.clone();
        optimizer.step(online.buffers_mut(), grads.buffers(), lr, self.cfg.precision)?;
        if !online.all_finite() {
            return Err(LearnerError::NumericalDivergence { quantity: "q-network parameters", step: batch.len() });
        }
        debug!(batch = batch.len(), total_loss, batch_loss, "q-network update");
        self.online = online;
        self.optimizer = optimizer;
        Ok(DqnUpdate { total_loss, batch_loss, losses })
    }

    /// target ← τ·online + (1-τ)·target.
    pub fn target_update(&mut self) {
        let tau = self.cfg.tau();
        let precision = self.cfg.precision;
        for (t, p) in self.target.buffers_mut().into_iter().zip(self.online.buffers()) {
            for (ti, pi) in t.iter_mut().zip(p) {
                *ti = precision.round(tau * pi + (1.0 - tau) * *ti);
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let checkpoint = QCheckpoint {
            config: self.cfg.clone(),
            online: self.online.clone(),
            target: self.target.clone(),
            optimizer: self.optimizer.clone(),
        };
        std::fs::write(path, serde_json::to_string(&checkpoint)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let checkpoint: QCheckpoint = serde_json::from_str(&json)?;
        let mut net = QNetwork::new(checkpoint.config)?;
        net.check_shape(&checkpoint.target)?;
        net.set_params(checkpoint.online)?;
        net.target = checkpoint.target;
        net.optimizer = checkpoint.optimizer;
        Ok(net)
    }
}
