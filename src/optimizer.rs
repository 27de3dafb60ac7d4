//! Adam with per-group learning rates.

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::error::{DeepVarError, Result};
use crate::model::{DeepVarModel, ParamGroup};

/// Adam hyperparameters shared by every group.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Learning rate and trainability of one parameter group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupSpec {
    /// Group addressed by this entry.
    pub group: ParamGroup,
    /// Learning rate.
    pub lr: f64,
    /// Whether the group is updated at all.
    pub trainable: bool,
}

impl GroupSpec {
    /// Trainable group at `lr`.
    pub fn new(group: ParamGroup, lr: f64) -> Self {
        Self {
            group,
            lr,
            trainable: true,
        }
    }

    /// Group held fixed.
    pub fn frozen(group: ParamGroup) -> Self {
        Self {
            group,
            lr: 0.0,
            trainable: false,
        }
    }
}

/// Phase 1 schedule: every group at `lr`.
pub fn uniform_groups(lr: f64) -> Vec<GroupSpec> {
    ParamGroup::ALL
        .iter()
        .map(|&group| GroupSpec::new(group, lr))
        .collect()
}

/// Phase 2 schedule: network groups at `lr_trend`, initial vectors at `lr`.
pub fn joint_groups(lr: f64, lr_trend: f64) -> Vec<GroupSpec> {
    vec![
        GroupSpec::new(ParamGroup::RecurrentCore, lr_trend),
        GroupSpec::new(ParamGroup::TrendProjection, lr_trend),
        GroupSpec::new(ParamGroup::InitArParameters, lr),
        GroupSpec::new(ParamGroup::InitResidualParameters, lr),
    ]
}

/// One Adam state per trainable group.
///
/// Weight decay is zero, which makes candle's `AdamW` plain Adam.
pub struct GroupedAdam {
    groups: Vec<(ParamGroup, AdamW)>,
}

impl GroupedAdam {
    /// Build an optimizer over `model` from group descriptors.
    ///
    /// Also applies each spec's trainability to the model, so frozen groups
    /// are detached in the next forward pass.
    ///
    /// # Errors
    ///
    /// Returns an error if a group is listed twice or a learning rate is not
    /// a positive finite number.
    pub fn new(model: &mut DeepVarModel, specs: &[GroupSpec], config: &OptimizerConfig) -> Result<Self> {
        let mut groups = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            if specs[..idx].iter().any(|s| s.group == spec.group) {
                return Err(DeepVarError::config(format!(
                    "parameter group {} listed twice",
                    spec.group
                )));
            }
            model.set_trainable(spec.group, spec.trainable);
            if !spec.trainable {
                continue;
            }
            if !(spec.lr.is_finite() && spec.lr > 0.0) {
                return Err(DeepVarError::config(format!(
                    "learning rate for {} must be > 0, got {}",
                    spec.group, spec.lr
                )));
            }

            let params = ParamsAdamW {
                lr: spec.lr,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay: 0.0,
            };
            let opt = AdamW::new(model.vars(spec.group)?, params).map_err(|e| {
                DeepVarError::Training(format!("Failed to create Adam for {}: {}", spec.group, e))
            })?;
            groups.push((spec.group, opt));
        }

        // Groups not listed are not updated.
        for group in ParamGroup::ALL {
            if !specs.iter().any(|s| s.group == group) {
                model.set_trainable(group, false);
            }
        }

        Ok(Self { groups })
    }

    /// Backpropagate `loss` once and update every trainable group.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Update every trainable group from a computed gradient store.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (group, opt) in &mut self.groups {
            opt.step(grads).map_err(|e| {
                DeepVarError::Training(format!("Optimizer step failed for {group}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Learning rate of `group`, if it is being updated.
    pub fn learning_rate(&self, group: ParamGroup) -> Option<f64> {
        self.groups
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, opt)| opt.learning_rate())
    }

    /// Groups being updated, in construction order.
    pub fn trainable_groups(&self) -> Vec<ParamGroup> {
        self.groups.iter().map(|(g, _)| *g).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::{prepare, to_sequence_major, SeriesTable};
    use candle_core::Device;

    fn model() -> DeepVarModel {
        let config = ModelConfig {
            num_layers: 1,
            hidden_dim: 6,
            m: 2,
            order: 1,
            seed: 3,
        };
        DeepVarModel::new(&config, 3, &Device::Cpu).unwrap()
    }

    fn input(seq_len: usize) -> Tensor {
        let labels = (0..seq_len).map(|i| i.to_string()).collect();
        let values = (0..seq_len).map(|i| vec![i as f64, 1.0]).collect();
        let data = prepare(&SeriesTable::new(labels, values).unwrap(), &Device::Cpu).unwrap();
        to_sequence_major(&data.t_functions).unwrap()
    }

    fn snapshot(model: &DeepVarModel, group: ParamGroup) -> Vec<Vec<f32>> {
        model
            .vars(group)
            .unwrap()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    fn trend_loss(model: &DeepVarModel, x: &Tensor) -> Tensor {
        let out = model.forward(x).unwrap();
        out.trend
            .affine(1.0, -1.0)
            .unwrap()
            .sqr()
            .unwrap()
            .mean_all()
            .unwrap()
    }

    #[test]
    fn test_phase_schedules() {
        let uniform = uniform_groups(0.01);
        assert_eq!(uniform.len(), 4);
        assert!(uniform.iter().all(|s| s.lr == 0.01 && s.trainable));

        let joint = joint_groups(0.01, 0.001);
        assert_eq!(joint[0].lr, 0.001);
        assert_eq!(joint[1].lr, 0.001);
        assert_eq!(joint[2].lr, 0.01);
        assert_eq!(joint[3].lr, 0.01);
    }

    #[test]
    fn test_learning_rates_per_group() {
        let mut model = model();
        let opt = GroupedAdam::new(&mut model, &joint_groups(0.01, 0.001), &OptimizerConfig::default())
            .unwrap();
        assert_eq!(opt.learning_rate(ParamGroup::RecurrentCore), Some(0.001));
        assert_eq!(opt.learning_rate(ParamGroup::InitArParameters), Some(0.01));
        assert_eq!(opt.trainable_groups().len(), 4);
    }

    #[test]
    fn test_frozen_group_unchanged_by_step() {
        let mut model = model();
        let specs = vec![
            GroupSpec::new(ParamGroup::RecurrentCore, 0.05),
            GroupSpec::frozen(ParamGroup::TrendProjection),
            GroupSpec::new(ParamGroup::InitArParameters, 0.05),
            GroupSpec::new(ParamGroup::InitResidualParameters, 0.05),
        ];
        let mut opt = GroupedAdam::new(&mut model, &specs, &OptimizerConfig::default()).unwrap();
        assert!(!model.is_trainable(ParamGroup::TrendProjection));
        assert_eq!(opt.learning_rate(ParamGroup::TrendProjection), None);

        let x = input(12);
        let trend_before = snapshot(&model, ParamGroup::TrendProjection);
        let core_before = snapshot(&model, ParamGroup::RecurrentCore);

        for _ in 0..3 {
            let loss = trend_loss(&model, &x);
            opt.backward_step(&loss).unwrap();
        }

        assert_eq!(trend_before, snapshot(&model, ParamGroup::TrendProjection));
        assert_ne!(core_before, snapshot(&model, ParamGroup::RecurrentCore));
    }

    #[test]
    fn test_steps_reduce_trend_loss() {
        let mut model = model();
        let mut opt =
            GroupedAdam::new(&mut model, &uniform_groups(0.05), &OptimizerConfig::default()).unwrap();
        let x = input(10);

        let first = trend_loss(&model, &x).to_scalar::<f32>().unwrap();
        for _ in 0..30 {
            let loss = trend_loss(&model, &x);
            opt.backward_step(&loss).unwrap();
        }
        let last = trend_loss(&model, &x).to_scalar::<f32>().unwrap();
        assert!(last < first, "{last} >= {first}");
    }

    #[test]
    fn test_invalid_specs_rejected() {
        let mut model = model();
        let twice = vec![
            GroupSpec::new(ParamGroup::RecurrentCore, 0.1),
            GroupSpec::new(ParamGroup::RecurrentCore, 0.2),
        ];
        assert!(GroupedAdam::new(&mut model, &twice, &OptimizerConfig::default()).is_err());

        let zero_lr = vec![GroupSpec::new(ParamGroup::InitArParameters, 0.0)];
        assert!(GroupedAdam::new(&mut model, &zero_lr, &OptimizerConfig::default()).is_err());
    }

    #[test]
    fn test_unlisted_groups_are_frozen() {
        let mut model = model();
        let specs = vec![GroupSpec::new(ParamGroup::TrendProjection, 0.1)];
        let opt = GroupedAdam::new(&mut model, &specs, &OptimizerConfig::default()).unwrap();
        assert_eq!(opt.trainable_groups(), vec![ParamGroup::TrendProjection]);
        assert!(!model.is_trainable(ParamGroup::RecurrentCore));
        assert!(model.is_trainable(ParamGroup::TrendProjection));
    }
}
