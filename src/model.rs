//! LSTM-driven time-varying VAR model with trend.
//!
//! The network reads only the time basis. At every step the stacked LSTM
//! hidden state is projected to:
//! - a trend vector of length `m` (`add_trend`),
//! - raw VAR coefficients: `init_ar_parameters + ar_head(h_t)`,
//! - raw residual parameters: `init_residual_params + residual_head(h_t)`.
//!
//! Both heads start at zero, so an untrained model emits the initial
//! parameter vectors at every step.
//!
//! # Parameter groups
//!
//! Parameters are addressed through [`ParamGroup`]. A frozen group is
//! detached in the forward pass, so backward never produces gradients for
//! it, and [`crate::optimizer::GroupedAdam`] skips it.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, Linear, Module, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ModelConfig;
use crate::error::{DeepVarError, Result};

/// Named parameter subsets with independent trainability and learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamGroup {
    /// LSTM weights and biases, including the per-step parameter heads.
    RecurrentCore,
    /// Trend projection weights and bias.
    TrendProjection,
    /// Initial AR parameter vector.
    InitArParameters,
    /// Initial residual parameter vector.
    InitResidualParameters,
}

impl ParamGroup {
    /// All groups in a stable order.
    pub const ALL: [ParamGroup; 4] = [
        ParamGroup::RecurrentCore,
        ParamGroup::TrendProjection,
        ParamGroup::InitArParameters,
        ParamGroup::InitResidualParameters,
    ];

    /// Group owning the variable `name`.
    pub fn of(name: &str) -> Option<Self> {
        if name.starts_with("lstm.") {
            Some(ParamGroup::RecurrentCore)
        } else if name.starts_with("add_trend.") {
            Some(ParamGroup::TrendProjection)
        } else if name == INIT_AR_NAME {
            Some(ParamGroup::InitArParameters)
        } else if name == INIT_RESIDUAL_NAME {
            Some(ParamGroup::InitResidualParameters)
        } else {
            None
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamGroup::RecurrentCore => "recurrent_core",
            ParamGroup::TrendProjection => "trend_projection",
            ParamGroup::InitArParameters => "init_ar_parameters",
            ParamGroup::InitResidualParameters => "init_residual_params",
        };
        f.write_str(name)
    }
}

const INIT_AR_NAME: &str = "init_ar_parameters";
const INIT_RESIDUAL_NAME: &str = "init_residual_params";

/// Bound of the uniform draw for `init_ar_parameters`.
const INIT_AR_SCALE: f64 = 0.1;

/// Hidden and cell state of one LSTM layer, each `(batch, hidden)`.
#[derive(Debug, Clone)]
pub struct LstmState {
    /// Hidden state.
    pub h: Tensor,
    /// Cell state.
    pub c: Tensor,
}

/// Recurrent state threaded through [`DeepVarModel::step`].
#[derive(Debug, Clone)]
pub struct RecurrentState {
    layers: Vec<LstmState>,
}

impl RecurrentState {
    /// Per-layer states, bottom layer first.
    pub fn layers(&self) -> &[LstmState] {
        &self.layers
    }

    /// Hidden state of the top layer, `(batch, hidden)`.
    pub fn output(&self) -> &Tensor {
        // A model always has at least one layer (checked by ModelConfig::validate).
        &self.layers[self.layers.len() - 1].h
    }
}

/// One LSTM layer with PyTorch gate layout (input, forget, cell, output).
#[derive(Debug, Clone)]
struct LstmLayer {
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
    hidden_dim: usize,
}

impl LstmLayer {
    fn new(in_dim: usize, hidden_dim: usize, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let init = Init::Const(0.0);
        Ok(Self {
            weight_ih: vb.get_with_hints(
                (4 * hidden_dim, in_dim),
                &format!("weight_ih_l{layer_idx}"),
                init,
            )?,
            weight_hh: vb.get_with_hints(
                (4 * hidden_dim, hidden_dim),
                &format!("weight_hh_l{layer_idx}"),
                init,
            )?,
            bias_ih: vb.get_with_hints(4 * hidden_dim, &format!("bias_ih_l{layer_idx}"), init)?,
            bias_hh: vb.get_with_hints(4 * hidden_dim, &format!("bias_hh_l{layer_idx}"), init)?,
            hidden_dim,
        })
    }

    fn zero_state(&self, batch: usize, device: &Device) -> Result<LstmState> {
        let zeros = Tensor::zeros((batch, self.hidden_dim), DType::F32, device)?;
        Ok(LstmState {
            h: zeros.clone(),
            c: zeros,
        })
    }

    fn step(&self, x: &Tensor, state: &LstmState, frozen: bool) -> Result<LstmState> {
        let w_ih = param(&self.weight_ih, frozen);
        let w_hh = param(&self.weight_hh, frozen);
        let b_ih = param(&self.bias_ih, frozen);
        let b_hh = param(&self.bias_hh, frozen);

        let gates = x
            .matmul(&w_ih.t()?)?
            .broadcast_add(&b_ih)?
            .add(&state.h.matmul(&w_hh.t()?)?.broadcast_add(&b_hh)?)?;
        let chunks = gates.chunk(4, 1)?;

        let in_gate = candle_nn::ops::sigmoid(&chunks[0])?;
        let forget_gate = candle_nn::ops::sigmoid(&chunks[1])?;
        let cell_gate = chunks[2].tanh()?;
        let out_gate = candle_nn::ops::sigmoid(&chunks[3])?;

        let c = forget_gate
            .mul(&state.c)?
            .add(&in_gate.mul(&cell_gate)?)?;
        let h = out_gate.mul(&c.tanh()?)?;
        Ok(LstmState { h, c })
    }
}

fn param(t: &Tensor, frozen: bool) -> Tensor {
    if frozen {
        t.detach()
    } else {
        t.clone()
    }
}

fn linear_view(linear: &Linear, frozen: bool) -> Linear {
    if frozen {
        Linear::new(linear.weight().detach(), linear.bias().map(Tensor::detach))
    } else {
        linear.clone()
    }
}

/// Per-step outputs of a full-sequence forward pass.
#[derive(Debug, Clone)]
pub struct VarOutput {
    /// Raw VAR coefficients, `(T, batch, order·m·m)`.
    pub var_coeffs: Tensor,
    /// Raw residual parameters, `(T, batch, m(m+1)/2)`.
    pub residual_params: Tensor,
    /// Trend, `(T, batch, m)`.
    pub trend: Tensor,
}

/// The DeepVARwT network.
pub struct DeepVarModel {
    layers: Vec<LstmLayer>,
    add_trend: Linear,
    ar_head: Linear,
    residual_head: Linear,
    init_ar_parameters: Tensor,
    init_residual_params: Tensor,
    input_size: usize,
    config: ModelConfig,
    frozen: HashSet<ParamGroup>,
    var_map: VarMap,
    device: Device,
}

impl DeepVarModel {
    /// Create a model whose parameters are drawn from `config.seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or tensors cannot be
    /// allocated on `device`.
    pub fn new(config: &ModelConfig, input_size: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        if input_size == 0 {
            return Err(DeepVarError::config("input size must be > 0"));
        }

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let hidden = config.hidden_dim;

        let core_vb = vb.pp("lstm");
        let mut layers = Vec::with_capacity(config.num_layers);
        for layer_idx in 0..config.num_layers {
            let in_dim = if layer_idx == 0 { input_size } else { hidden };
            layers.push(LstmLayer::new(in_dim, hidden, layer_idx, core_vb.clone())?);
        }
        let ar_head = candle_nn::linear(hidden, config.ar_width(), core_vb.pp("ar_head"))?;
        let residual_head =
            candle_nn::linear(hidden, config.residual_width(), core_vb.pp("residual_head"))?;

        let add_trend = candle_nn::linear(hidden, config.m, vb.pp("add_trend"))?;
        let init_ar_parameters =
            vb.get_with_hints(config.ar_width(), INIT_AR_NAME, Init::Const(0.0))?;
        let init_residual_params =
            vb.get_with_hints(config.residual_width(), INIT_RESIDUAL_NAME, Init::Const(0.0))?;

        let model = Self {
            layers,
            add_trend,
            ar_head,
            residual_head,
            init_ar_parameters,
            init_residual_params,
            input_size,
            config: config.clone(),
            frozen: HashSet::new(),
            var_map,
            device: device.clone(),
        };
        model.reset_parameters(config.seed)?;

        tracing::debug!(
            "Built DeepVarModel: {} layers, hidden {}, m {}, order {}, {} parameters",
            config.num_layers,
            hidden,
            config.m,
            config.order,
            model.parameter_count()
        );
        Ok(model)
    }

    /// Redraw every parameter from `seed`.
    ///
    /// Variables are visited in name order so the draw is independent of
    /// hash-map iteration order.
    pub fn reset_parameters(&self, seed: u64) -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let bound = 1.0 / (self.config.hidden_dim as f64).sqrt();

        for (name, var) in self.named_vars()? {
            let n = var.elem_count();
            let values: Vec<f32> = if name.starts_with("lstm.ar_head")
                || name.starts_with("lstm.residual_head")
                || name == INIT_RESIDUAL_NAME
            {
                vec![0.0; n]
            } else if name == INIT_AR_NAME {
                (0..n)
                    .map(|_| rng.gen_range(-INIT_AR_SCALE..INIT_AR_SCALE) as f32)
                    .collect()
            } else {
                (0..n).map(|_| rng.gen_range(-bound..bound) as f32).collect()
            };
            let tensor = Tensor::from_vec(values, var.shape(), &self.device)?;
            var.set(&tensor)?;
        }
        Ok(())
    }

    /// Fresh zero state for a pass over `batch` sequences.
    pub fn zero_state(&self, batch: usize) -> Result<RecurrentState> {
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.zero_state(batch, &self.device))
            .collect::<Result<Vec<_>>>()?;
        Ok(RecurrentState { layers })
    }

    /// Advance every layer by one timestep; `x_t` is `(batch, input_size)`.
    pub fn step(&self, x_t: &Tensor, state: &RecurrentState) -> Result<RecurrentState> {
        let (_, width) = x_t.dims2()?;
        if width != self.input_size {
            return Err(DeepVarError::shape_mismatch(
                format!("input width {}", self.input_size),
                format!("input width {width}"),
            ));
        }

        if state.layers.len() != self.layers.len() {
            return Err(DeepVarError::shape_mismatch(
                format!("state for {} layers", self.layers.len()),
                format!("state for {} layers", state.layers.len()),
            ));
        }

        let frozen = !self.is_trainable(ParamGroup::RecurrentCore);
        let mut input = x_t.clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, layer_state) in self.layers.iter().zip(&state.layers) {
            let new_state = layer.step(&input, layer_state, frozen)?;
            input = new_state.h.clone();
            next.push(new_state);
        }
        Ok(RecurrentState { layers: next })
    }

    /// Run the full sequence `x` of shape `(T, batch, input_size)`.
    ///
    /// # Errors
    ///
    /// Returns [`DeepVarError::ShapeMismatch`] if `x` is not rank 3 or its
    /// feature width differs from the configured input size.
    pub fn forward(&self, x: &Tensor) -> Result<VarOutput> {
        if x.rank() != 3 {
            return Err(DeepVarError::shape_mismatch(
                "(seq, batch, features)",
                format!("{:?}", x.dims()),
            ));
        }
        let (seq_len, batch, width) = x.dims3()?;
        if width != self.input_size {
            return Err(DeepVarError::shape_mismatch(
                format!("input width {}", self.input_size),
                format!("input width {width}"),
            ));
        }
        if seq_len == 0 {
            return Err(DeepVarError::invalid_input("empty input sequence"));
        }

        let mut state = self.zero_state(batch)?;
        let mut hidden = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            state = self.step(&x.get(t)?, &state)?;
            hidden.push(state.output().clone());
        }
        let hidden = Tensor::stack(&hidden, 0)?;

        let core_frozen = !self.is_trainable(ParamGroup::RecurrentCore);
        let trend = linear_view(
            &self.add_trend,
            !self.is_trainable(ParamGroup::TrendProjection),
        )
        .forward(&hidden)?;

        let init_ar = param(
            &self.init_ar_parameters,
            !self.is_trainable(ParamGroup::InitArParameters),
        );
        let var_coeffs = linear_view(&self.ar_head, core_frozen)
            .forward(&hidden)?
            .broadcast_add(&init_ar)?;

        let init_residual = param(
            &self.init_residual_params,
            !self.is_trainable(ParamGroup::InitResidualParameters),
        );
        let residual_params = linear_view(&self.residual_head, core_frozen)
            .forward(&hidden)?
            .broadcast_add(&init_residual)?;

        Ok(VarOutput {
            var_coeffs,
            residual_params,
            trend,
        })
    }

    /// Enable or disable gradient computation for a group.
    pub fn set_trainable(&mut self, group: ParamGroup, trainable: bool) {
        if trainable {
            self.frozen.remove(&group);
        } else {
            self.frozen.insert(group);
        }
    }

    /// Whether a group currently receives gradients.
    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        !self.frozen.contains(&group)
    }

    /// Make every group trainable.
    pub fn unfreeze_all(&mut self) {
        self.frozen.clear();
    }

    /// Variables belonging to `group`, in name order.
    pub fn vars(&self, group: ParamGroup) -> Result<Vec<Var>> {
        Ok(self
            .named_vars()?
            .into_iter()
            .filter(|(name, _)| ParamGroup::of(name) == Some(group))
            .map(|(_, var)| var)
            .collect())
    }

    /// All variables with their names, in name order.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| DeepVarError::training(format!("parameter store poisoned: {e}")))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Persist all parameters as safetensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Load parameters previously written by [`DeepVarModel::save`].
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    /// Underlying variable store.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Configured input feature width.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{prepare, to_sequence_major, SeriesTable};

    fn test_config(m: usize, order: usize) -> ModelConfig {
        ModelConfig {
            num_layers: 1,
            hidden_dim: 8,
            m,
            order,
            seed: 7,
        }
    }

    fn time_input(seq_len: usize) -> Tensor {
        let labels = (0..seq_len).map(|i| i.to_string()).collect();
        let values = (0..seq_len).map(|i| vec![i as f64]).collect();
        let table = SeriesTable::new(labels, values).unwrap();
        let data = prepare(&table, &Device::Cpu).unwrap();
        to_sequence_major(&data.t_functions).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        for (m, order, seq_len) in [(1, 1, 5), (2, 1, 20), (3, 2, 11)] {
            let config = test_config(m, order);
            let model = DeepVarModel::new(&config, 3, &Device::Cpu).unwrap();
            let out = model.forward(&time_input(seq_len)).unwrap();
            assert_eq!(out.trend.dims(), &[seq_len, 1, m]);
            assert_eq!(out.var_coeffs.dims(), &[seq_len, 1, order * m * m]);
            assert_eq!(out.residual_params.dims(), &[seq_len, 1, m * (m + 1) / 2]);
        }
    }

    #[test]
    fn test_stacked_layers_forward() {
        let mut config = test_config(2, 2);
        config.num_layers = 3;
        let model = DeepVarModel::new(&config, 3, &Device::Cpu).unwrap();
        let out = model.forward(&time_input(9)).unwrap();
        assert_eq!(out.trend.dims(), &[9, 1, 2]);
        assert_eq!(model.zero_state(1).unwrap().layers().len(), 3);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let model = DeepVarModel::new(&test_config(2, 1), 3, &Device::Cpu).unwrap();
        let x = Tensor::zeros((10, 1, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&x),
            Err(DeepVarError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_untrained_heads_emit_initial_vectors() {
        let model = DeepVarModel::new(&test_config(2, 1), 3, &Device::Cpu).unwrap();
        let out = model.forward(&time_input(6)).unwrap();

        let init = model.vars(ParamGroup::InitArParameters).unwrap()[0]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        let first = out.var_coeffs.get(0).unwrap().squeeze(0).unwrap().to_vec1::<f32>().unwrap();
        let last = out.var_coeffs.get(5).unwrap().squeeze(0).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, init);
        assert_eq!(last, init);

        let residual = out.residual_params.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(residual.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_single_step_in_isolation() {
        let model = DeepVarModel::new(&test_config(2, 1), 3, &Device::Cpu).unwrap();
        let state = model.zero_state(1).unwrap();
        let x_t = Tensor::from_vec(vec![0.5f32, 0.25, 0.125], (1, 3), &Device::Cpu).unwrap();

        let next = model.step(&x_t, &state).unwrap();
        assert_eq!(next.output().dims(), &[1, 8]);

        let bad = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(model.step(&bad, &state).is_err());
    }

    #[test]
    fn test_step_rejects_state_with_other_layer_count() {
        let mut deep = test_config(2, 1);
        deep.num_layers = 2;
        let model = DeepVarModel::new(&deep, 3, &Device::Cpu).unwrap();
        let shallow = DeepVarModel::new(&test_config(2, 1), 3, &Device::Cpu).unwrap();
        let x_t = Tensor::from_vec(vec![0.5f32, 0.25, 0.125], (1, 3), &Device::Cpu).unwrap();

        let state = shallow.zero_state(1).unwrap();
        assert!(matches!(
            model.step(&x_t, &state),
            Err(DeepVarError::ShapeMismatch { .. })
        ));
        assert!(shallow.step(&x_t, &model.zero_state(1).unwrap()).is_err());
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let config = test_config(2, 1);
        let a = DeepVarModel::new(&config, 3, &Device::Cpu).unwrap();
        let b = DeepVarModel::new(&config, 3, &Device::Cpu).unwrap();
        let input = time_input(10);
        let ta = a.forward(&input).unwrap().trend.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let tb = b.forward(&input).unwrap().trend.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(ta, tb);

        let mut other = config.clone();
        other.seed = 8;
        let c = DeepVarModel::new(&other, 3, &Device::Cpu).unwrap();
        let tc = c.forward(&input).unwrap().trend.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(ta, tc);
    }

    #[test]
    fn test_parameter_groups_cover_every_variable() {
        let config = test_config(2, 2);
        let model = DeepVarModel::new(&config, 3, &Device::Cpu).unwrap();

        let total: usize = ParamGroup::ALL
            .iter()
            .map(|&g| model.vars(g).unwrap().iter().map(|v| v.elem_count()).sum::<usize>())
            .sum();
        assert_eq!(total, model.parameter_count());

        let names: Vec<String> = model.named_vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"lstm.weight_ih_l0".to_string()));
        assert!(names.contains(&"lstm.bias_hh_l0".to_string()));
        assert!(names.contains(&"add_trend.weight".to_string()));
        assert_eq!(model.vars(ParamGroup::InitArParameters).unwrap()[0].elem_count(), 8);
        assert_eq!(model.vars(ParamGroup::InitResidualParameters).unwrap()[0].elem_count(), 3);
    }

    #[test]
    fn test_frozen_group_gets_no_gradient() {
        let mut model = DeepVarModel::new(&test_config(2, 1), 3, &Device::Cpu).unwrap();
        model.set_trainable(ParamGroup::TrendProjection, false);
        assert!(!model.is_trainable(ParamGroup::TrendProjection));

        let out = model.forward(&time_input(6)).unwrap();
        let grads = out.trend.sqr().unwrap().sum_all().unwrap().backward().unwrap();

        for var in model.vars(ParamGroup::TrendProjection).unwrap() {
            assert!(grads.get(var.as_tensor()).is_none());
        }
        let core = model.vars(ParamGroup::RecurrentCore).unwrap();
        assert!(core.iter().any(|v| grads.get(v.as_tensor()).is_some()));

        model.unfreeze_all();
        assert!(ParamGroup::ALL.iter().all(|&g| model.is_trainable(g)));
    }

    #[test]
    fn test_group_lookup_by_name() {
        assert_eq!(ParamGroup::of("lstm.weight_hh_l1"), Some(ParamGroup::RecurrentCore));
        assert_eq!(ParamGroup::of("lstm.ar_head.bias"), Some(ParamGroup::RecurrentCore));
        assert_eq!(ParamGroup::of("add_trend.bias"), Some(ParamGroup::TrendProjection));
        assert_eq!(ParamGroup::of("init_ar_parameters"), Some(ParamGroup::InitArParameters));
        assert_eq!(
            ParamGroup::of("init_residual_params"),
            Some(ParamGroup::InitResidualParameters)
        );
        assert_eq!(ParamGroup::of("unknown"), None);
    }
}
