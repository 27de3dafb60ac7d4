//! Training objectives.
//!
//! - [`trend_error`]: mean squared error between a trend slice and an
//!   externally filtered trend (phase 1).
//! - [`log_likelihood`]: conditional Gaussian negative log-likelihood of the
//!   detrended series under the time-varying VAR(p) (phase 2).
//!
//! Both return scalar tensors that stay attached to the autograd graph.

use candle_core::{DType, Tensor, D};

use crate::error::{DeepVarError, Result};
use crate::var_math::{causal_coefficients, cholesky_factor};

/// Mean squared error between `trend` and `target`.
///
/// `trend` may carry a unit batch axis, `(N, 1, m)`; it must otherwise match
/// `target`, `(N, m)`.
pub fn trend_error(target: &Tensor, trend: &Tensor) -> Result<Tensor> {
    if target.elem_count() != trend.elem_count() || target.rank() != 2 {
        return Err(DeepVarError::shape_mismatch(
            format!("trend matching target {:?}", target.dims()),
            format!("{:?}", trend.dims()),
        ));
    }
    let trend = trend.reshape(target.dims())?;
    let target = target.to_dtype(trend.dtype())?;
    Ok(trend.sub(&target)?.sqr()?.mean_all()?)
}

/// Negative log-likelihood of `target` given per-step VAR parameters.
///
/// With `x_t = y_t - μ_t` and `e_t = x_t - Σ_i A_{t,i} x_{t-i}`:
///
/// ```text
/// NLL = ½ Σ_{t=p}^{T-1} [ m ln 2π + ln|Σ_t| + e_tᵀ Σ_t⁻¹ e_t ]
/// ```
///
/// The first `order` observations are conditioned on.
///
/// # Errors
///
/// Returns [`DeepVarError::InvalidInput`] when `T <= order`, and
/// [`DeepVarError::ShapeMismatch`] when any per-step tensor does not have `T`
/// steps.
pub fn log_likelihood(
    target: &Tensor,
    var_coeffs: &Tensor,
    residual_params: &Tensor,
    m: usize,
    order: usize,
    trend: &Tensor,
) -> Result<Tensor> {
    let (steps, series) = target.dims2()?;
    if series != m {
        return Err(DeepVarError::shape_mismatch(
            format!("{m} series"),
            format!("{series} series"),
        ));
    }
    if order == 0 || steps <= order {
        return Err(DeepVarError::invalid_input(format!(
            "series length {steps} must exceed VAR order {order}"
        )));
    }
    for (name, t) in [
        ("VAR coefficients", var_coeffs),
        ("residual parameters", residual_params),
        ("trend", trend),
    ] {
        if t.dims().first() != Some(&steps) {
            return Err(DeepVarError::shape_mismatch(
                format!("{name} with {steps} steps"),
                format!("{:?}", t.dims()),
            ));
        }
    }

    let dtype = trend.dtype();
    let trend = trend.reshape((steps, m))?;
    let x = target.to_dtype(dtype)?.sub(&trend)?;

    let n = steps - order;
    let coeffs = causal_coefficients(var_coeffs, m, order)?.narrow(0, order, n)?;

    let current = x.narrow(0, order, n)?;
    let mut predicted = Tensor::zeros((n, m), dtype, x.device())?;
    for lag in 1..=order {
        let a = coeffs.narrow(1, lag - 1, 1)?.squeeze(1)?.contiguous()?;
        let lagged = x.narrow(0, order - lag, n)?.unsqueeze(2)?.contiguous()?;
        predicted = predicted.add(&a.matmul(&lagged)?.squeeze(2)?)?;
    }
    let residuals = current.sub(&predicted)?;

    let l = cholesky_factor(residual_params, m)?.narrow(0, order, n)?;

    // Forward substitution L z = e, one column at a time.
    let entry = |i: usize, j: usize| -> Result<Tensor> {
        Ok(l.narrow(1, i, 1)?.narrow(2, j, 1)?.reshape(n)?)
    };
    let mut z: Vec<Tensor> = Vec::with_capacity(m);
    let mut log_det = Tensor::zeros(n, dtype, x.device())?;
    for i in 0..m {
        let mut acc = residuals.narrow(1, i, 1)?.reshape(n)?;
        for (j, zj) in z.iter().enumerate() {
            acc = acc.sub(&entry(i, j)?.mul(zj)?)?;
        }
        let diag = entry(i, i)?;
        log_det = log_det.add(&diag.log()?)?;
        z.push(acc.div(&diag)?);
    }
    let quad = Tensor::stack(&z, 1)?.sqr()?.sum(D::Minus1)?;

    // ln|Σ_t| = 2 Σ_i ln L_ii
    let per_step = log_det.affine(2.0, 0.0)?.add(&quad)?;
    let constant = 0.5 * (n * m) as f64 * (2.0 * std::f64::consts::PI).ln();
    Ok(per_step.sum_all()?.affine(0.5, constant)?)
}

/// Loss value as `f64`.
pub fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
