/// Minimal tensor utilities for the gated log-linear learner.
///
/// All operations are free functions on flat f64 slices with explicit dimensions.
/// No generics, no traits on tensors. Row-major layout throughout.

use serde::{Serialize, Deserialize};

// ── Precision ────────────────────────────────────────────────────────
//
// Buffers are always f64. `Precision::Single` emulates an f32 model by
// rounding every stored value through f32 at storage boundaries (θ, gates,
// predictions, losses, gradients, parameters after an update). The Double
// path stays unrounded so finite-difference checks are clean.

/// Numeric width of the model, injected at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Single,
    Double,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Single
    }
}

impl Precision {
    /// Machine epsilon for this width. Used for softmax clipping, the log
    /// floor in the cross-entropy and the gate clamp.
    pub fn eps(self) -> f64 {
        match self {
            Precision::Single => f32::EPSILON as f64,
            Precision::Double => f64::EPSILON,
        }
    }

    /// Round one value to this width.
    #[inline]
    pub fn round(self, x: f64) -> f64 {
        match self {
            Precision::Single => x as f32 as f64,
            Precision::Double => x,
        }
    }

    /// Round a buffer in place.
    pub fn round_slice(self, buf: &mut [f64]) {
        if self == Precision::Single {
            for v in buf.iter_mut() {
                *v = *v as f32 as f64;
            }
        }
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix-vector product: out[M] = A[M,N] @ x[N].
pub fn matvec_f64(a: &[f64], x: &[f64], out: &mut [f64], m: usize, n: usize) {
    debug_assert_eq!(a.len(), m * n);
    debug_assert_eq!(x.len(), n);
    debug_assert_eq!(out.len(), m);

    for i in 0..m {
        let row = &a[i * n..(i + 1) * n];
        let mut sum = 0.0f64;
        for j in 0..n {
            sum += row[j] * x[j];
        }
        out[i] = sum;
    }
}

/// Transposed matrix-vector product: out[N] = A[M,N]^T @ x[M].
pub fn matvec_t_f64(a: &[f64], x: &[f64], out: &mut [f64], m: usize, n: usize) {
    debug_assert_eq!(out.len(), n);
    out.iter_mut().for_each(|v| *v = 0.0);
    matvec_t_acc_f64(a, x, out, m, n);
}

/// Transposed matrix-vector product with accumulation: out[N] += A[M,N]^T @ x[M].
pub fn matvec_t_acc_f64(a: &[f64], x: &[f64], out: &mut [f64], m: usize, n: usize) {
    debug_assert_eq!(a.len(), m * n);
    debug_assert_eq!(x.len(), m);
    debug_assert_eq!(out.len(), n);

    for i in 0..m {
        let xi = x[i];
        if xi == 0.0 {
            continue;
        }
        let row = &a[i * n..(i + 1) * n];
        for j in 0..n {
            out[j] += xi * row[j];
        }
    }
}

/// Outer product with accumulation: out[d1, d2] += a[d1] * b[d2]. Row-major.
pub fn outer_acc_f64(a: &[f64], b: &[f64], out: &mut [f64]) {
    let d1 = a.len();
    let d2 = b.len();
    debug_assert_eq!(out.len(), d1 * d2);
    for i in 0..d1 {
        let ai = a[i];
        for j in 0..d2 {
            out[i * d2 + j] += ai * b[j];
        }
    }
}

/// Dot product: sum_i a[i] * b[i].
pub fn dot_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f64;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Sum of squares: sum_i a[i]^2.
pub fn sum_sq_f64(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum()
}

/// Numerically stable logistic sigmoid.
#[inline]
pub fn sigmoid_f64(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Softmax restricted to the entries where `mask` is true.
///
/// Masked-out entries get exactly 0.0 (the -inf logit convention).
/// Returns the number of eligible entries; if it is 0, `out` is all zeros.
pub fn masked_softmax_f64(scores: &[f64], mask: &[bool], out: &mut [f64]) -> usize {
    debug_assert_eq!(scores.len(), mask.len());
    debug_assert_eq!(scores.len(), out.len());

    let mut max_val = f64::NEG_INFINITY;
    let mut eligible = 0usize;
    for (s, &m) in scores.iter().zip(mask) {
        if m {
            eligible += 1;
            if *s > max_val {
                max_val = *s;
            }
        }
    }

    let mut sum_exp = 0.0f64;
    for c in 0..scores.len() {
        if mask[c] {
            let e = (scores[c] - max_val).exp();
            out[c] = e;
            sum_exp += e;
        } else {
            out[c] = 0.0;
        }
    }
    if sum_exp > 0.0 {
        for c in 0..scores.len() {
            out[c] /= sum_exp;
        }
    }
    eligible
}

/// Index of the largest value. Ties resolve to the lowest index.
pub fn argmax_f64(a: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in a.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Population mean and standard deviation. (0, 0) for an empty slice.
pub fn mean_std_f64(a: &[f64]) -> (f64, f64) {
    if a.is_empty() {
        return (0.0, 0.0);
    }
    let n = a.len() as f64;
    let mean = a.iter().sum::<f64>() / n;
    let var = a.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Simple xorshift64 PRNG for deterministic init and shuffling. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f64) -> f64 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f64], scale: f64) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }

    /// Uniform integer in [0, n). `n` must be > 0.
    pub fn next_below(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        (self.next_u64() % n as u64) as usize
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_below(i + 1);
            items.swap(i, j);
        }
    }
}
