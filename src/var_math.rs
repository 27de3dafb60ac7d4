//! Maps raw per-step parameters to valid VAR quantities.
//!
//! Both transforms are differentiable candle graphs batched over time:
//! - [`causal_coefficients`] rescales raw lag matrices so that
//!   `Σ_i ‖A_i‖_F < 1`, which bounds the companion spectral radius below one.
//! - [`cholesky_factor`] places raw residual parameters into a lower
//!   triangular matrix with positive (exponentiated) diagonal.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{DeepVarError, Result};

/// Keeps the Frobenius norm differentiable at an all-zero lag matrix.
const NORM_EPS: f64 = 1e-12;

/// Number of raw residual parameters for `m` series.
pub fn residual_width(m: usize) -> usize {
    m * (m + 1) / 2
}

/// Number of raw VAR coefficients for `m` series and lag `order`.
pub fn ar_width(m: usize, order: usize) -> usize {
    order * m * m
}

fn steps_and_width(raw: &Tensor, what: &str) -> Result<(usize, usize)> {
    let dims = raw.dims();
    match *dims {
        [t, w] => Ok((t, w)),
        [t, 1, w] => Ok((t, w)),
        _ => Err(DeepVarError::shape_mismatch(
            format!("{what} of shape (T, width) or (T, 1, width)"),
            format!("{dims:?}"),
        )),
    }
}

/// Stationary VAR coefficients, shape `(T, order, m, m)`.
///
/// Lag `i` at step `t` is `R_{t,i} / (1 + Σ_j ‖R_{t,j}‖_F)`.
pub fn causal_coefficients(raw: &Tensor, m: usize, order: usize) -> Result<Tensor> {
    let (steps, width) = steps_and_width(raw, "VAR coefficients")?;
    if width != ar_width(m, order) {
        return Err(DeepVarError::shape_mismatch(
            format!("{} VAR coefficients per step", ar_width(m, order)),
            format!("{width}"),
        ));
    }

    let lags = raw.reshape((steps, order, m, m))?;
    let norms = lags
        .sqr()?
        .sum(D::Minus1)?
        .sum(D::Minus1)?
        .affine(1.0, NORM_EPS)?
        .sqrt()?;
    let scale = norms.sum(1)?.affine(1.0, 1.0)?.reshape((steps, 1, 1, 1))?;
    Ok(lags.broadcast_div(&scale)?)
}

fn placement(m: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let k = residual_width(m);
    let mut place = vec![0f32; k * m * m];
    let mut diag = vec![0f32; m * m];
    let mut idx = 0;
    for i in 0..m {
        for j in 0..=i {
            place[idx * m * m + i * m + j] = 1.0;
            idx += 1;
        }
        diag[i * m + i] = 1.0;
    }
    Ok((
        Tensor::from_vec(place, (k, m * m), device)?,
        Tensor::from_vec(diag, (m, m), device)?,
    ))
}

/// Lower-triangular factor `L_t` of the innovation covariance, `(T, m, m)`.
///
/// Raw parameters fill the lower triangle row by row; diagonal entries are
/// exponentiated.
pub fn cholesky_factor(raw: &Tensor, m: usize) -> Result<Tensor> {
    let (steps, width) = steps_and_width(raw, "residual parameters")?;
    if width != residual_width(m) {
        return Err(DeepVarError::shape_mismatch(
            format!("{} residual parameters per step", residual_width(m)),
            format!("{width}"),
        ));
    }

    let (place, diag_mask) = placement(m, raw.device())?;
    let off_mask = diag_mask.affine(-1.0, 1.0)?;
    let full = raw
        .reshape((steps, width))?
        .to_dtype(DType::F32)?
        .matmul(&place)?
        .reshape((steps, m, m))?;

    let off = full.broadcast_mul(&off_mask)?;
    let diag = full
        .broadcast_mul(&diag_mask)?
        .exp()?
        .broadcast_mul(&diag_mask)?;
    Ok(off.add(&diag)?)
}

/// Innovation covariance `Σ_t = L_t L_tᵀ`, shape `(T, m, m)`.
pub fn innovation_covariance(raw: &Tensor, m: usize) -> Result<Tensor> {
    let l = cholesky_factor(raw, m)?;
    let lt = l.transpose(1, 2)?.contiguous()?;
    Ok(l.matmul(&lt)?)
}

/// Lag matrices at one step as nested rows: `[lag][row][col]`.
pub fn lag_matrices(coeffs: &Tensor, step: usize) -> Result<Vec<Vec<Vec<f64>>>> {
    let (steps, order, m, _) = coeffs.dims4()?;
    if step >= steps {
        return Err(DeepVarError::invalid_input(format!(
            "step {step} out of range for {steps} steps"
        )));
    }
    let at = coeffs.get(step)?.to_dtype(DType::F64)?;
    (0..order)
        .map(|lag| {
            Ok(at
                .get(lag)?
                .reshape((m, m))?
                .to_vec2::<f64>()?)
        })
        .collect()
}
