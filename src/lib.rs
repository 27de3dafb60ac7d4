//! # deepvarwt-rs
//!
//! Two-phase fitting of a time-varying vector autoregression with trend,
//! where an LSTM driven by polynomial time functions produces the trend,
//! the VAR coefficients and the innovation covariance at every step.
//!
//! ## Features
//!
//! - **YAML Configuration** - network size, VAR order and schedule in one file
//! - **Two-Phase Training** - trend pretraining, then a joint likelihood fit
//!   with per-group learning rates and relative-change early stopping
//! - **Stationary by Construction** - raw coefficients are mapped to a
//!   causal VAR at every step
//! - **Artifacts** - loss traces, estimated trend (CSV and PNG), safetensors
//!   checkpoint
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Generate a config
//! deepvarwt init config.yaml --preset bivariate
//!
//! # Validate configuration
//! deepvarwt validate config.yaml
//!
//! # Fit
//! deepvarwt train config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use deepvarwt_rs::{DeepVarConfig, SeriesTable, Trainer};
//!
//! # fn main() -> deepvarwt_rs::Result<()> {
//! let config = DeepVarConfig::from_file("config.yaml")?;
//! let train = SeriesTable::from_csv("data/train.csv")?;
//! let filtered = SeriesTable::from_csv("data/filtered.csv")?;
//!
//! let mut trainer = Trainer::new(config)?;
//! let outcome = trainer.fit(&train, &filtered)?;
//! for (lag, matrix) in outcome.causal_matrices.iter().enumerate() {
//!     println!("A_{}: {:?}", lag + 1, matrix);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod artifacts;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod error;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod time_basis;
pub mod trainer;
pub mod var_math;

pub use config::{DeepVarConfig, ModelConfig, TrainingConfig};
pub use data::SeriesTable;
pub use error::{DeepVarError, Phase, Result};
pub use model::{DeepVarModel, ParamGroup};
pub use trainer::{FitOutcome, Trainer};
