//! Multi-layer perceptron with a horizon-conditioned value head
//!
//! Reference [`TvfModel`] built on tch-rs. The encoder is shared between a
//! policy head and a value head; the value head sees the encoder features
//! concatenated with the scaled horizon and time of every query.
//!
//! # Architecture
//!
//! ```text
//! Input (observations)         aux [B, H, 2]
//!         |                         |
//!     [Dense(64)]             ScaleFunction
//!         |                         |
//!      Tanh                         |
//!         |                         |
//!     [Dense(64)]                   |
//!         |                         |
//!      Tanh ----------+             |
//!         |           |             |
//!  [Dense(actions)]   +---concat----+
//!         |                 |
//!   log_softmax        [Dense(64)] + Tanh
//!                        /        \
//!                 [Dense(1)]    [Dense(1)] (optional)
//!                      |             |
//!                  value [B, H]  sqrt_m2 [B, H]
//! ```

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView3};
use tch::{
    nn::{self, Init, Module, OptimizerConfig},
    Device, Kind, Tensor,
};

use super::{TvfModel, ValuePrediction};
use crate::config::TvfConfig;
use crate::tvf::ScaleFunction;

/// Configuration for the TVF network
#[derive(Debug, Clone)]
pub struct TvfMlpConfig {
    /// Encoder depth, 2 or 3
    pub num_layers: usize,
    /// Width of every hidden layer
    pub hidden_dim: i64,
    /// Orthogonal initialization for hidden layers
    pub use_orthogonal_init: bool,
    /// Hidden activation
    pub activation: Activation,
    /// Largest horizon the value head is queried at
    pub max_horizon: usize,
    /// Scaling of the horizon feature
    pub horizon_scale: ScaleFunction,
    /// Scaling of the time feature
    pub time_scale: ScaleFunction,
    /// Add a square-root second-moment head
    pub second_moment: bool,
}

/// Hidden activation
#[derive(Debug, Clone, Copy)]
pub enum Activation {
    /// Rectified linear unit
    ReLU,
    /// Hyperbolic tangent
    Tanh,
}

impl Activation {
    fn apply(self, x: &Tensor) -> Tensor {
        match self {
            Activation::ReLU => x.relu(),
            Activation::Tanh => x.tanh(),
        }
    }
}

impl Default for TvfMlpConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            hidden_dim: 64,
            use_orthogonal_init: true,
            activation: Activation::Tanh,
            max_horizon: 1000,
            horizon_scale: ScaleFunction::Default,
            time_scale: ScaleFunction::Default,
            second_moment: false,
        }
    }
}

impl From<&TvfConfig> for TvfMlpConfig {
    /// Value-head settings from a run configuration, default architecture
    fn from(config: &TvfConfig) -> Self {
        Self {
            max_horizon: config.tvf_max_horizon,
            horizon_scale: config.tvf_horizon_scale,
            time_scale: config.tvf_time_scale,
            second_moment: config.learn_second_moment,
            ..Default::default()
        }
    }
}

/// Actor-critic MLP whose critic predicts a value curve
pub struct TvfMlp {
    vs: nn::VarStore,
    encoder: nn::Sequential,
    policy_head: nn::Linear,
    value_hidden: nn::Linear,
    value_head: nn::Linear,
    m2_head: Option<nn::Linear>,
    device: Device,
    config: TvfMlpConfig,
    obs_dim: i64,
    num_actions: usize,
}

impl TvfMlp {
    /// Create a network with the default architecture
    ///
    /// # Arguments
    ///
    /// * `obs_dim` - Observation space dimensionality
    /// * `num_actions` - Number of discrete actions
    /// * `max_horizon` - Largest horizon the value curve covers
    pub fn new(obs_dim: i64, num_actions: usize, max_horizon: usize) -> Self {
        let config = TvfMlpConfig { max_horizon, ..Default::default() };
        Self::with_config(obs_dim, num_actions, config)
    }

    /// Create a network with a custom configuration
    pub fn with_config(obs_dim: i64, num_actions: usize, config: TvfMlpConfig) -> Self {
        let device = Device::cuda_if_available();
        tracing::info!("TvfMlp using device: {:?}", device);
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let hidden_init = if config.use_orthogonal_init {
            Init::Orthogonal { gain: 2.0_f64.sqrt() }
        } else {
            Init::Randn { mean: 0.0, stdev: 0.01 }
        };
        let hidden_config = nn::LinearConfig { ws_init: hidden_init, ..Default::default() };

        let activation = config.activation;
        let mut encoder = nn::seq();
        let mut in_dim = obs_dim;
        for layer in 0..config.num_layers.max(1) {
            encoder = encoder
                .add(nn::linear(
                    &root / "encoder" / format!("fc{}", layer + 1),
                    in_dim,
                    config.hidden_dim,
                    hidden_config,
                ))
                .add_fn(move |x| activation.apply(x));
            in_dim = config.hidden_dim;
        }

        let output_init = if config.use_orthogonal_init {
            Init::Orthogonal { gain: 0.01 }
        } else {
            Init::Randn { mean: 0.0, stdev: 0.01 }
        };
        let output_config = nn::LinearConfig { ws_init: output_init, ..Default::default() };

        let policy_head =
            nn::linear(&root / "policy", config.hidden_dim, num_actions as i64, output_config);
        let value_hidden =
            nn::linear(&root / "value" / "fc", config.hidden_dim + 2, config.hidden_dim, hidden_config);
        let value_head = nn::linear(&root / "value" / "out", config.hidden_dim, 1, output_config);
        let m2_head = config
            .second_moment
            .then(|| nn::linear(&root / "value_m2" / "out", config.hidden_dim, 1, output_config));
        let device = vs.device();

        Self {
            vs,
            encoder,
            policy_head,
            value_hidden,
            value_head,
            m2_head,
            device,
            config,
            obs_dim,
            num_actions,
        }
    }

    /// Action log-probabilities `[B, actions]` for observations `[B, obs_dim]`
    pub fn forward_policy(&self, obs: &Tensor) -> Tensor {
        let features = self.encoder.forward(obs);
        self.policy_head.forward(&features).log_softmax(-1, Kind::Float)
    }

    /// Value curve `[B, H]` and optional square-root second moment for
    /// observations `[B, obs_dim]` and scaled aux features `[B, H, 2]`
    pub fn forward_values(&self, obs: &Tensor, aux: &Tensor) -> (Tensor, Option<Tensor>) {
        let features = self.encoder.forward(obs);
        let size = aux.size();
        let (batch, horizons) = (size[0], size[1]);
        let expanded = features.unsqueeze(1).expand([batch, horizons, self.config.hidden_dim], false);
        let joined = Tensor::cat(&[expanded, aux.shallow_clone()], -1);
        let hidden = self.config.activation.apply(&self.value_hidden.forward(&joined));

        let value = self.value_head.forward(&hidden).squeeze_dim(-1);
        let sqrt_m2 = self.m2_head.as_ref().map(|head| head.forward(&hidden).squeeze_dim(-1));
        (value, sqrt_m2)
    }

    /// Get the device this network is on (CPU or CUDA)
    pub fn device(&self) -> Device {
        self.device
    }

    /// Get mutable reference to variable store (for optimizer creation)
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Create an Adam optimizer for this network
    pub fn optimizer(&mut self, learning_rate: f64) -> Result<nn::Optimizer> {
        Ok(nn::Adam::default().build(&self.vs, learning_rate)?)
    }

    /// Save model parameters to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    /// Load model parameters from a file
    pub fn load<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        self.vs.load(path)?;
        Ok(())
    }

    fn observations_to_tensor(&self, observations: &[Vec<f32>]) -> Result<Tensor> {
        let mut flat = Vec::with_capacity(observations.len() * self.obs_dim as usize);
        for obs in observations {
            if obs.len() as i64 != self.obs_dim {
                bail!("observation has {} features, expected {}", obs.len(), self.obs_dim);
            }
            flat.extend_from_slice(obs);
        }
        Ok(Tensor::from_slice(&flat)
            .view([observations.len() as i64, self.obs_dim])
            .to_device(self.device))
    }

    fn aux_to_tensor(&self, aux: ArrayView3<f32>) -> Tensor {
        let max_horizon = self.config.max_horizon as f32;
        let mut scaled = aux.to_owned();
        self.config.horizon_scale.apply_channel(&mut scaled, 0, max_horizon);
        self.config.time_scale.apply_channel(&mut scaled, 1, 1.0);

        let (b, h, c) = scaled.dim();
        let flat: Vec<f32> = scaled.iter().copied().collect();
        Tensor::from_slice(&flat).view([b as i64, h as i64, c as i64]).to_device(self.device)
    }
}

fn tensor_to_array2(tensor: &Tensor) -> Result<Array2<f32>> {
    let size = tensor.size();
    if size.len() != 2 {
        bail!("expected a 2D tensor, got shape {:?}", size);
    }
    let cpu = tensor.to_device(Device::Cpu).to_kind(Kind::Float).contiguous();
    let flat = Vec::<f32>::try_from(cpu.view([-1]))?;
    Ok(Array2::from_shape_vec((size[0] as usize, size[1] as usize), flat)?)
}

impl TvfModel for TvfMlp {
    fn num_actions(&self) -> usize {
        self.num_actions
    }

    fn log_policy(&self, observations: &[Vec<f32>]) -> Result<Array2<f32>> {
        let obs = self.observations_to_tensor(observations)?;
        let log_probs = tch::no_grad(|| self.forward_policy(&obs));
        tensor_to_array2(&log_probs)
    }

    fn predict_values(
        &self,
        observations: &[Vec<f32>],
        aux: ArrayView3<f32>,
    ) -> Result<ValuePrediction> {
        let obs = self.observations_to_tensor(observations)?;
        let aux = self.aux_to_tensor(aux);
        let (value, sqrt_m2) = tch::no_grad(|| self.forward_values(&obs, &aux));
        Ok(ValuePrediction {
            value: tensor_to_array2(&value)?,
            sqrt_m2: sqrt_m2.as_ref().map(tensor_to_array2).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvf::features::package_aux_features;
    use ndarray::array;

    #[test]
    fn test_config_from_run_config() {
        let run = TvfConfig::new()
            .tvf_max_horizon(500)
            .feature_scales(ScaleFunction::Log, ScaleFunction::Zero)
            .learn_second_moment(true, None);
        let config = TvfMlpConfig::from(&run);

        assert_eq!(config.max_horizon, 500);
        assert_eq!(config.horizon_scale, ScaleFunction::Log);
        assert_eq!(config.time_scale, ScaleFunction::Zero);
        assert!(config.second_moment);
        assert_eq!(config.hidden_dim, 64);
    }

    #[test]
    fn test_log_policy_is_normalized() {
        let model = TvfMlp::new(3, 4, 100);
        let obs = vec![vec![0.1, 0.2, 0.3], vec![-1.0, 0.0, 1.0]];
        let log_probs = model.log_policy(&obs).unwrap();

        assert_eq!(log_probs.dim(), (2, 4));
        for row in log_probs.rows() {
            let total: f32 = row.iter().map(|lp| lp.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_predict_values_shape() {
        let config = TvfMlpConfig { second_moment: true, ..Default::default() };
        let model = TvfMlp::with_config(2, 2, config);
        let obs = vec![vec![0.0, 1.0]; 3];
        let aux = package_aux_features(&[0, 10, 100, 1000], array![0.0_f32, 0.5, 1.0].view());

        let prediction = model.predict_values(&obs, aux.view()).unwrap();
        assert_eq!(prediction.value.dim(), (3, 4));
        assert_eq!(prediction.sqrt_m2.map(|m2| m2.dim()), Some((3, 4)));
    }

    #[test]
    fn test_no_second_moment_head_by_default() {
        let model = TvfMlp::new(2, 2, 100);
        let aux = package_aux_features(&[0, 50], array![0.0_f32].view());
        let prediction = model.predict_values(&[vec![0.5, 0.5]], aux.view()).unwrap();
        assert!(prediction.sqrt_m2.is_none());
    }

    #[test]
    fn test_rejects_wrong_observation_size() {
        let model = TvfMlp::new(3, 2, 100);
        assert!(model.log_policy(&[vec![0.0, 1.0]]).is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tvf_mlp.safetensors");

        let model = TvfMlp::new(2, 2, 100);
        let obs = vec![vec![0.3, -0.7]];
        let before = model.log_policy(&obs).unwrap();
        model.save(&path).unwrap();

        let mut restored = TvfMlp::new(2, 2, 100);
        restored.load(&path).unwrap();
        let after = restored.log_policy(&obs).unwrap();

        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
