//! Deterministic polynomial time features.
//!
//! The recurrent core is driven only by normalized time: for a series of
//! length `T`, step `i` sees `t = (i+1)/T` together with `t²` and `t³`.

use candle_core::{Device, Tensor};

use crate::error::{DeepVarError, Result};

/// Number of time functions (linear, quadratic, cubic).
pub const TIME_BASIS_DIM: usize = 3;

/// Time-basis matrix of shape `(3, T)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBasis {
    rows: [Vec<f64>; TIME_BASIS_DIM],
}

impl TimeBasis {
    /// Sequence length `T`.
    pub fn len(&self) -> usize {
        self.rows[0].len()
    }

    /// Always false: a basis is never built for `T == 0`.
    pub fn is_empty(&self) -> bool {
        self.rows[0].is_empty()
    }

    /// Row `k` (0 = linear, 1 = quadratic, 2 = cubic).
    pub fn row(&self, k: usize) -> &[f64] {
        &self.rows[k]
    }

    /// Value of time function `k` at step `i`.
    pub fn value(&self, k: usize, i: usize) -> f64 {
        self.rows[k][i]
    }

    /// Batch-major model input of shape `(1, T, 3)`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let t = self.len();
        let mut flat = Vec::with_capacity(t * TIME_BASIS_DIM);
        for i in 0..t {
            for row in &self.rows {
                flat.push(row[i] as f32);
            }
        }
        Ok(Tensor::from_vec(flat, (1, t, TIME_BASIS_DIM), device)?)
    }
}

/// Compute the time-basis matrix for a sequence of length `seq_len`.
///
/// Row `k` (k = 1, 2, 3) at position `i` equals `((i+1)/T)^k`.
///
/// # Errors
///
/// Returns [`DeepVarError::InvalidInput`] when `seq_len == 0`.
pub fn time_function_values(seq_len: usize) -> Result<TimeBasis> {
    if seq_len == 0 {
        return Err(DeepVarError::invalid_input(
            "sequence length must be positive",
        ));
    }

    let t: Vec<f64> = (0..seq_len)
        .map(|i| (i + 1) as f64 / seq_len as f64)
        .collect();
    let t2: Vec<f64> = t.iter().map(|&v| v * v).collect();
    let t3: Vec<f64> = t.iter().map(|&v| v * v * v).collect();

    Ok(TimeBasis { rows: [t, t2, t3] })
}
