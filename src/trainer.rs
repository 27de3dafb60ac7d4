//! Two-phase training loop.
//!
//! Phase 1 fits the trend to an externally filtered trend over the window
//! `[w, T-w)`. Phase 2 fits trend and VAR parameters jointly by likelihood
//! until the iteration budget runs out or the relative-change rule fires.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use crate::artifacts::{
    write_loss_trace, write_series, ArtifactLayout, PngTrendPlotter, RunSummary, TrendPlotter,
};
use crate::config::DeepVarConfig;
use crate::data::{prepare, sequence_rows, to_sequence_major, SeriesTable};
use crate::early_stopping::{RelativeChangeStopping, StoppingDecision};
use crate::error::{DeepVarError, Phase, Result};
use crate::loss::{log_likelihood, scalar, trend_error};
use crate::model::{DeepVarModel, VarOutput};
use crate::optimizer::{joint_groups, uniform_groups, GroupedAdam, OptimizerConfig};
use crate::time_basis::TIME_BASIS_DIM;
use crate::var_math::{causal_coefficients, lag_matrices};

/// Result of a completed two-phase fit.
pub struct FitOutcome {
    /// Phase 1 loss per iteration.
    pub trend_losses: Vec<f64>,
    /// Phase 2 loss per iteration.
    pub likelihood_losses: Vec<f64>,
    /// Zero-based index of the last phase 2 iteration.
    pub stop_iteration: usize,
    /// Whether phase 2 ended on the relative-change rule.
    pub early_stopped: bool,
    /// Estimated trend, `T` rows of `m` values.
    pub trend: Vec<Vec<f64>>,
    /// Raw VAR coefficients from the last phase 2 forward pass.
    pub var_coeffs: Tensor,
    /// Raw residual parameters from the last phase 2 forward pass.
    pub residual_params: Tensor,
    /// Stationary lag matrices at the final step, `[lag][row][col]`.
    pub causal_matrices: Vec<Vec<Vec<f64>>>,
    /// Where the parameters were saved.
    pub checkpoint: PathBuf,
    /// Fitted model.
    pub model: DeepVarModel,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use deepvarwt_rs::{DeepVarConfig, Trainer};
///
/// # fn main() -> deepvarwt_rs::Result<()> {
/// let config = DeepVarConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// let outcome = trainer.train()?;
/// println!("stopped at iteration {}", outcome.stop_iteration);
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: DeepVarConfig,
    device: Device,
    layout: ArtifactLayout,
    plotter: Box<dyn TrendPlotter>,
    optimizer: OptimizerConfig,
}

/// Pick the training device.
///
/// CUDA is used when built with the `cuda` feature and a device is present,
/// unless `DEEPVARWT_FORCE_CPU` is set to `1` or `true`.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("DEEPVARWT_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("DEEPVARWT_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU.");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via DEEPVARWT_FORCE_CPU.");
        } else {
            tracing::debug!("CUDA feature disabled; training on CPU.");
        }
        Device::Cpu
    }
}

fn progress_bar(len: usize, phase: Phase) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>6}/{len:6} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_prefix(phase.to_string());
    Ok(pb)
}

/// Fail with [`DeepVarError::NumericDivergence`] if `loss` is not finite.
pub fn check_finite(phase: Phase, iteration: usize, loss: f64) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(DeepVarError::NumericDivergence {
            phase,
            iteration,
            last_valid: iteration.checked_sub(1),
        })
    }
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: DeepVarConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device();
        let layout = ArtifactLayout::new(&config.output_dir);
        Ok(Self {
            config,
            device,
            layout,
            plotter: Box::new(PngTrendPlotter::default()),
            optimizer: OptimizerConfig::default(),
        })
    }

    /// Replace the trend plotter.
    #[must_use]
    pub fn with_plotter(mut self, plotter: Box<dyn TrendPlotter>) -> Self {
        self.plotter = plotter;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &DeepVarConfig {
        &self.config
    }

    /// Output layout.
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Training device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Load the tables named in the configuration and fit.
    pub fn train(&mut self) -> Result<FitOutcome> {
        let data = &self.config.data;
        if data.train_path.is_empty() || data.filtered_path.is_empty() {
            return Err(DeepVarError::config(
                "data.train_path and data.filtered_path are required for training",
            ));
        }
        let train = SeriesTable::from_csv(&data.train_path)?;
        let filtered = SeriesTable::from_csv(&data.filtered_path)?;
        tracing::info!(
            "Loaded {} observations of {} series from {}",
            train.rows(),
            train.series(),
            data.train_path
        );
        self.fit(&train, &filtered)
    }

    /// Check table shapes against the configuration.
    ///
    /// Runs before any training iteration.
    pub fn validate_inputs(&self, train: &SeriesTable, filtered: &SeriesTable) -> Result<()> {
        let m = self.config.model.m;
        let order = self.config.model.order;
        let w = self.config.training.filter_window;
        let t = train.rows();

        if train.series() != m {
            return Err(DeepVarError::shape_mismatch(
                format!("{m} series in training table"),
                format!("{} series", train.series()),
            ));
        }
        if filtered.series() != m {
            return Err(DeepVarError::shape_mismatch(
                format!("{m} series in filtered trend"),
                format!("{} series", filtered.series()),
            ));
        }
        if t <= order {
            return Err(DeepVarError::invalid_input(format!(
                "series length {t} must exceed VAR order {order}"
            )));
        }
        if t <= 2 * w {
            return Err(DeepVarError::invalid_input(format!(
                "series length {t} must exceed twice the filter window {w}"
            )));
        }
        if filtered.rows() != t - 2 * w {
            return Err(DeepVarError::shape_mismatch(
                format!("{} filtered rows (T - 2w)", t - 2 * w),
                format!("{} rows", filtered.rows()),
            ));
        }
        Ok(())
    }

    /// Run both phases on in-memory tables and write all artifacts.
    pub fn fit(&mut self, train: &SeriesTable, filtered: &SeriesTable) -> Result<FitOutcome> {
        self.validate_inputs(train, filtered)?;

        let data = prepare(train, &self.device)?;
        let x = to_sequence_major(&data.t_functions)?;
        let filtered_trend = filtered.to_tensor(&self.device)?;

        let mut model = DeepVarModel::new(&self.config.model, TIME_BASIS_DIM, &self.device)?;
        tracing::info!("Starting fit");
        tracing::info!("  Series: {}, order: {}", self.config.model.m, self.config.model.order);
        tracing::info!("  Observations: {}", data.seq_len());
        tracing::info!("  Parameters: {}", model.parameter_count());

        self.layout.ensure_dirs()?;

        let trend_losses = self.pretrain_trend(&mut model, &x, &filtered_trend)?;
        write_loss_trace(self.layout.trend_loss(), "trend_loss", &trend_losses)?;
        model.unfreeze_all();

        let phase2 = self.fit_var(&mut model, &x, &data.targets)?;
        write_loss_trace(
            self.layout.likelihood_loss(),
            "likelihood",
            &phase2.losses,
        )?;

        let trend = sequence_rows(&phase2.output.trend)?;
        write_series(self.layout.estimated_trend(), &trend)?;
        self.plotter.plot(
            train.values(),
            &trend,
            train.column_names(),
            &self.layout.trend_plot(),
        )?;

        let m = self.config.model.m;
        let order = self.config.model.order;
        let causal = causal_coefficients(&phase2.output.var_coeffs, m, order)?;
        let causal_matrices = lag_matrices(&causal, data.seq_len() - 1)?;
        for (lag, matrix) in causal_matrices.iter().enumerate() {
            tracing::info!("Causal VAR coefficients, lag {}:", lag + 1);
            for row in matrix {
                let cells: Vec<String> = row.iter().map(|v| format!("{v:>10.6}")).collect();
                tracing::info!("  [{}]", cells.join(" "));
            }
        }

        let checkpoint = self.layout.checkpoint(phase2.stop_iteration);
        model.save(&checkpoint)?;
        tracing::info!("Saved parameters to: {}", checkpoint.display());

        let summary = RunSummary {
            series: m,
            order,
            seq_len: data.seq_len(),
            trend_iterations: trend_losses.len(),
            likelihood_iterations: phase2.losses.len(),
            stop_iteration: phase2.stop_iteration,
            early_stopped: phase2.early_stopped,
            final_trend_loss: trend_losses.last().copied(),
            final_likelihood: phase2.losses.last().copied(),
            checkpoint: checkpoint.display().to_string(),
        };
        summary.save(self.layout.run_summary())?;

        Ok(FitOutcome {
            trend_losses,
            likelihood_losses: phase2.losses,
            stop_iteration: phase2.stop_iteration,
            early_stopped: phase2.early_stopped,
            trend,
            var_coeffs: phase2.output.var_coeffs,
            residual_params: phase2.output.residual_params,
            causal_matrices,
            checkpoint,
            model,
        })
    }

    /// Phase 1: every group at `lr` against the filtered trend.
    ///
    /// `x` is the sequence-major time basis `(T, 1, 3)`; `filtered` is
    /// `(T - 2w, m)`.
    pub fn pretrain_trend(
        &self,
        model: &mut DeepVarModel,
        x: &Tensor,
        filtered: &Tensor,
    ) -> Result<Vec<f64>> {
        let training = &self.config.training;
        let mut optimizer = GroupedAdam::new(model, &uniform_groups(training.lr), &self.optimizer)?;

        let w = training.filter_window;
        let window = filtered.dims()[0];
        let pb = progress_bar(training.iterations_trend, Phase::Trend)?;
        let mut losses = Vec::with_capacity(training.iterations_trend);

        for iteration in 0..training.iterations_trend {
            let output = model.forward(x)?;
            let trend_part = output.trend.narrow(0, w, window)?;
            let loss = trend_error(filtered, &trend_part)?;
            let value = scalar(&loss)?;
            check_finite(Phase::Trend, iteration, value)?;

            optimizer.backward_step(&loss)?;
            losses.push(value);

            pb.set_message(format!("{value:.6}"));
            pb.inc(1);
            tracing::debug!("Phase 1 iteration {}: trend error {:.6}", iteration + 1, value);
        }

        pb.finish_with_message("trend pretraining complete");
        if let Some(last) = losses.last() {
            tracing::info!("Phase 1 finished after {} iterations, trend error {:.6}", losses.len(), last);
        }
        Ok(losses)
    }

    /// Phase 2: joint likelihood fit with differential learning rates.
    pub fn fit_var(
        &self,
        model: &mut DeepVarModel,
        x: &Tensor,
        targets: &Tensor,
    ) -> Result<LikelihoodPhase> {
        let training = &self.config.training;
        let m = self.config.model.m;
        let order = self.config.model.order;

        let specs = joint_groups(training.lr, training.lr_trend);
        let mut optimizer = GroupedAdam::new(model, &specs, &self.optimizer)?;
        let mut stopper = RelativeChangeStopping::new(training.threshold);

        let pb = progress_bar(training.iterations_ar, Phase::Likelihood)?;
        let mut last: Option<VarOutput> = None;
        let mut early_stopped = false;

        for iteration in 0..training.iterations_ar {
            let output = model.forward(x)?;
            let loss = log_likelihood(
                targets,
                &output.var_coeffs,
                &output.residual_params,
                m,
                order,
                &output.trend,
            )?;
            let value = scalar(&loss)?;
            check_finite(Phase::Likelihood, iteration, value)?;

            optimizer.backward_step(&loss)?;
            last = Some(output);

            pb.set_message(format!("{value:.6}"));
            pb.inc(1);
            tracing::debug!("Phase 2 iteration {}: negative log-likelihood {:.6}", iteration + 1, value);

            if stopper.check(value)? == StoppingDecision::Stop {
                tracing::info!("Early stopping at iteration {}", iteration);
                early_stopped = true;
                break;
            }
        }
        pb.finish_with_message("likelihood fit complete");

        let output = last.ok_or_else(|| DeepVarError::training("phase 2 ran no iterations"))?;
        let losses = stopper.history().to_vec();
        let stop_iteration = losses.len() - 1;
        tracing::info!(
            "Phase 2 finished at iteration {}, negative log-likelihood {:.6}",
            stop_iteration,
            losses[stop_iteration]
        );

        Ok(LikelihoodPhase {
            losses,
            stop_iteration,
            early_stopped,
            output,
        })
    }
}

/// Result of phase 2.
pub struct LikelihoodPhase {
    /// Loss per iteration.
    pub losses: Vec<f64>,
    /// Zero-based index of the last iteration.
    pub stop_iteration: usize,
    /// Whether the relative-change rule fired.
    pub early_stopped: bool,
    /// Outputs of the last forward pass.
    pub output: VarOutput,
}
