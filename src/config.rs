//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DeepVarError, Result};
use crate::var_math;

/// Main configuration for a two-phase fit.
///
/// # Example
///
/// ```rust
/// use deepvarwt_rs::DeepVarConfig;
///
/// # fn main() -> deepvarwt_rs::Result<()> {
/// let config = DeepVarConfig::from_preset("quarterly-macro")?;
/// config.validate()?;
/// assert_eq!(config.model.order, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepVarConfig {
    /// Network and VAR dimensions.
    pub model: ModelConfig,

    /// Optimization schedule.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Input tables.
    #[serde(default)]
    pub data: DataConfig,

    /// Output directory for losses, trend and checkpoint.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

/// Network and VAR dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of stacked LSTM layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// LSTM hidden width.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Number of series.
    pub m: usize,

    /// VAR lag order.
    #[serde(default = "default_order")]
    pub order: usize,

    /// Seed for parameter initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_num_layers() -> usize {
    1
}
fn default_hidden_dim() -> usize {
    20
}
fn default_order() -> usize {
    2
}
fn default_seed() -> u64 {
    42
}

impl ModelConfig {
    /// Width of the raw VAR coefficient output.
    pub fn ar_width(&self) -> usize {
        var_math::ar_width(self.m, self.order)
    }

    /// Width of the raw residual parameter output.
    pub fn residual_width(&self) -> usize {
        var_math::residual_width(self.m)
    }

    /// Check dimensions are usable.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(DeepVarError::config("num_layers must be > 0"));
        }
        if self.hidden_dim == 0 {
            return Err(DeepVarError::config("hidden_dim must be > 0"));
        }
        if self.m == 0 {
            return Err(DeepVarError::config("m (number of series) must be > 0"));
        }
        if self.order == 0 {
            return Err(DeepVarError::config("order must be > 0"));
        }
        Ok(())
    }
}

/// Optimization schedule for both phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Phase 1 iterations.
    #[serde(default = "default_iterations_trend")]
    pub iterations_trend: usize,

    /// Maximum phase 2 iterations.
    #[serde(default = "default_iterations_ar")]
    pub iterations_ar: usize,

    /// Phase 1 learning rate, and phase 2 rate for the initial vectors.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// Phase 2 rate for the recurrent core and trend projection.
    #[serde(default = "default_lr_trend")]
    pub lr_trend: f64,

    /// Relative-change threshold for early stopping.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Half-width `w` of the two-sided filter behind the filtered trend.
    #[serde(default = "default_filter_window")]
    pub filter_window: usize,
}

fn default_iterations_trend() -> usize {
    400
}
fn default_iterations_ar() -> usize {
    1200
}
fn default_lr() -> f64 {
    0.01
}
fn default_lr_trend() -> f64 {
    0.001
}
fn default_threshold() -> f64 {
    1e-5
}
fn default_filter_window() -> usize {
    8
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations_trend: default_iterations_trend(),
            iterations_ar: default_iterations_ar(),
            lr: default_lr(),
            lr_trend: default_lr_trend(),
            threshold: default_threshold(),
            filter_window: default_filter_window(),
        }
    }
}

/// Input table locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Observed series, CSV with a label column.
    #[serde(default)]
    pub train_path: String,

    /// Filtered trend covering rows `[w, T-w)`, same layout.
    #[serde(default)]
    pub filtered_path: String,
}

impl DeepVarConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"quarterly-macro"` - three quarterly series, VAR(2)
    /// - `"bivariate"` - two series, VAR(1), small network
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "quarterly-macro" => Ok(Self::quarterly_macro_preset()),
            "bivariate" => Ok(Self::bivariate_preset()),
            _ => Err(DeepVarError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Three quarterly macro series with a VAR(2).
    #[must_use]
    pub fn quarterly_macro_preset() -> Self {
        Self {
            model: ModelConfig {
                num_layers: 1,
                hidden_dim: 20,
                m: 3,
                order: 2,
                seed: default_seed(),
            },
            training: TrainingConfig::default(),
            data: DataConfig {
                train_path: "./data/train.csv".into(),
                filtered_path: "./data/filtered.csv".into(),
            },
            output_dir: default_output_dir(),
        }
    }

    /// Two series with a VAR(1) and a small network.
    #[must_use]
    pub fn bivariate_preset() -> Self {
        Self {
            model: ModelConfig {
                num_layers: 1,
                hidden_dim: 10,
                m: 2,
                order: 1,
                seed: default_seed(),
            },
            training: TrainingConfig {
                iterations_trend: 200,
                iterations_ar: 600,
                ..Default::default()
            },
            data: DataConfig {
                train_path: "./data/train.csv".into(),
                filtered_path: "./data/filtered.csv".into(),
            },
            output_dir: default_output_dir(),
        }
    }

    /// Validate the configuration.
    ///
    /// Table-dependent checks (row counts, series count) run in the trainer
    /// once data is loaded.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;

        let t = &self.training;
        for (name, lr) in [("lr", t.lr), ("lr_trend", t.lr_trend)] {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(DeepVarError::config(format!("{name} must be > 0")));
            }
        }
        if t.iterations_ar == 0 {
            return Err(DeepVarError::config("iterations_ar must be > 0"));
        }
        if !(t.threshold.is_finite() && t.threshold >= 0.0) {
            return Err(DeepVarError::config("threshold must be >= 0"));
        }
        if self.output_dir.is_empty() {
            return Err(DeepVarError::config("output_dir must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_presets_validate() {
        for name in ["quarterly-macro", "bivariate"] {
            let config = DeepVarConfig::from_preset(name).unwrap();
            assert!(config.validate().is_ok(), "{name}");
        }
        assert!(DeepVarConfig::from_preset("unknown").is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = DeepVarConfig::bivariate_preset();
        let file = NamedTempFile::new().unwrap();
        config.to_file(file.path()).unwrap();
        let loaded = DeepVarConfig::from_file(file.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = "model:\n  m: 4\n";
        let config: DeepVarConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model.m, 4);
        assert_eq!(config.model.num_layers, 1);
        assert_eq!(config.model.order, 2);
        assert_eq!(config.training.filter_window, 8);
        assert_eq!(config.output_dir, "./outputs");
        assert!(config.data.train_path.is_empty());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DeepVarConfig::bivariate_preset();
        config.model.order = 0;
        assert!(matches!(config.validate(), Err(DeepVarError::Config(_))));

        let mut config = DeepVarConfig::bivariate_preset();
        config.training.lr_trend = 0.0;
        assert!(config.validate().is_err());

        let mut config = DeepVarConfig::bivariate_preset();
        config.training.threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = DeepVarConfig::bivariate_preset();
        config.training.iterations_ar = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_widths() {
        let model = DeepVarConfig::quarterly_macro_preset().model;
        assert_eq!(model.ar_width(), 18);
        assert_eq!(model.residual_width(), 6);
    }
}
