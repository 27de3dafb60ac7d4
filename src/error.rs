//! Error types for deepvarwt-rs.
//!
//! Shape and input problems are reported before any training iteration runs.
//! Numeric failures during training abort the current phase and name the last
//! iteration whose loss was still finite.
//!
//! # Example
//!
//! ```rust
//! use deepvarwt_rs::{DeepVarError, Result};
//! use deepvarwt_rs::time_basis::time_function_values;
//!
//! fn basis_len(t: usize) -> Result<usize> {
//!     Ok(time_function_values(t)?.len())
//! }
//!
//! assert_eq!(basis_len(10).unwrap(), 10);
//! assert!(matches!(basis_len(0), Err(DeepVarError::InvalidInput(_))));
//! ```

use std::fmt;

use thiserror::Error;

/// Result type alias for deepvarwt-rs operations.
pub type Result<T> = std::result::Result<T, DeepVarError>;

/// Training phase, used to locate numeric failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Trend pretraining against the filtered trend.
    Trend,
    /// Joint trend and VAR fitting by likelihood.
    Likelihood,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Trend => write!(f, "phase 1 (trend)"),
            Phase::Likelihood => write!(f, "phase 2 (likelihood)"),
        }
    }
}

/// Errors that can occur in deepvarwt-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeepVarError {
    /// Invalid input value (zero sequence length, malformed table cell).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tensor or table dimensions incompatible with the configuration.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// What the caller required.
        expected: String,
        /// What was actually provided.
        got: String,
    },

    /// Loss became NaN or infinite.
    #[error("numeric divergence in {phase} at iteration {iteration} (last valid iteration: {})", .last_valid.map_or_else(|| "none".to_string(), |i| i.to_string()))]
    NumericDivergence {
        /// Phase in which the loss diverged.
        phase: Phase,
        /// Zero-based iteration that produced the non-finite loss.
        iteration: usize,
        /// Last iteration with a finite loss, if any.
        last_valid: Option<usize>,
    },

    /// Early-stopping ratio would divide by a zero loss.
    #[error("relative change undefined at iteration {iteration}: previous loss is zero")]
    ZeroDivision {
        /// Iteration whose ratio could not be formed.
        iteration: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read or write error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Plot encoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),
}

impl DeepVarError {
    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_shape_mismatch_display() {
        let error = DeepVarError::shape_mismatch("input width 3", "input width 6");
        assert_eq!(
            error.to_string(),
            "shape mismatch: expected input width 3, got input width 6"
        );
    }

    #[test]
    fn test_numeric_divergence_display() {
        let error = DeepVarError::NumericDivergence {
            phase: Phase::Likelihood,
            iteration: 7,
            last_valid: Some(6),
        };
        let msg = error.to_string();
        assert!(msg.contains("phase 2"));
        assert!(msg.contains("iteration 7"));
        assert!(msg.contains("last valid iteration: 6"));

        let error = DeepVarError::NumericDivergence {
            phase: Phase::Trend,
            iteration: 0,
            last_valid: None,
        };
        assert!(error.to_string().contains("last valid iteration: none"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: DeepVarError = io_error.into();
        assert!(matches!(error, DeepVarError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: DeepVarError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_template_error_conversion() {
        let result = indicatif::ProgressStyle::default_bar().template("{bar:10x}");

        if let Err(template_error) = result {
            let error: DeepVarError = template_error.into();
            assert!(matches!(error, DeepVarError::Template(_)));
            assert!(error.to_string().starts_with("template error"));
        }
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: DeepVarError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }
}
