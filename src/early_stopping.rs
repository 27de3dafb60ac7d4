//! Early stopping on relative loss change.
//!
//! From the third recorded loss on, training stops when two consecutive
//! relative changes both fall below the threshold:
//!
//! ```text
//! r1 = |(L[i] - L[i-1]) / L[i-1]|
//! r2 = |(L[i-1] - L[i-2]) / L[i-2]|      (only examined when r1 < threshold)
//! ```
//!
//! # Example
//!
//! ```
//! use deepvarwt_rs::early_stopping::{RelativeChangeStopping, StoppingDecision};
//!
//! let mut stopper = RelativeChangeStopping::new(0.01);
//! let mut stopped_at = None;
//! for (i, loss) in [10.0, 9.0, 8.95, 8.94, 8.939].into_iter().enumerate() {
//!     if stopper.check(loss).unwrap() == StoppingDecision::Stop {
//!         stopped_at = Some(i);
//!         break;
//!     }
//! }
//! assert_eq!(stopped_at, Some(3));
//! ```

use crate::error::{DeepVarError, Result};

/// Result of checking a new loss value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoppingDecision {
    /// Fewer than three losses recorded.
    Warmup,
    /// Keep training.
    Continue,
    /// Latest change is below threshold, the one before is not.
    Settling {
        /// Latest relative change.
        relative_change: f64,
    },
    /// Both changes below threshold.
    Stop,
}

/// Relative-change early stopping tracker.
#[derive(Debug, Clone)]
pub struct RelativeChangeStopping {
    threshold: f64,
    history: Vec<f64>,
    stopped: bool,
}

impl RelativeChangeStopping {
    /// Create a tracker that stops below `threshold`.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            history: Vec::new(),
            stopped: false,
        }
    }

    /// Record the loss of the next iteration and decide.
    ///
    /// # Errors
    ///
    /// Returns [`DeepVarError::ZeroDivision`] when a ratio would divide by a
    /// zero previous loss.
    pub fn check(&mut self, loss: f64) -> Result<StoppingDecision> {
        self.history.push(loss);
        let i = self.history.len() - 1;
        let decision = decide(&self.history, i, self.threshold)?;
        if decision == StoppingDecision::Stop {
            self.stopped = true;
        }
        Ok(decision)
    }

    /// Whether a stop has been signalled.
    pub fn should_stop(&self) -> bool {
        self.stopped
    }

    /// Losses recorded so far.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Configured threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

fn relative_change(current: f64, previous: f64, iteration: usize) -> Result<f64> {
    if previous == 0.0 {
        return Err(DeepVarError::ZeroDivision { iteration });
    }
    Ok(((current - previous) / previous).abs())
}

/// Decision for iteration `i` given the loss trace up to and including `i`.
pub fn decide(losses: &[f64], i: usize, threshold: f64) -> Result<StoppingDecision> {
    if i < 2 || i >= losses.len() {
        return Ok(StoppingDecision::Warmup);
    }
    let r1 = relative_change(losses[i], losses[i - 1], i)?;
    if r1 >= threshold {
        return Ok(StoppingDecision::Continue);
    }
    let r2 = relative_change(losses[i - 1], losses[i - 2], i)?;
    if r2 < threshold {
        Ok(StoppingDecision::Stop)
    } else {
        Ok(StoppingDecision::Settling { relative_change: r1 })
    }
}
