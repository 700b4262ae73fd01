//! Model contract for policy and value-curve networks
//!
//! The runner and the value-curve estimator only ever talk to a model
//! through [`TvfModel`]. A tch-backed implementation lives in [`mlp`] behind
//! the `training` feature; tests use small closed-form models.

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView1, ArrayView3};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

#[cfg(feature = "training")]
pub mod mlp;

/// Output of a value-curve forward pass
#[derive(Debug, Clone)]
pub struct ValuePrediction {
    /// Value estimate per row and horizon `[B, H]`
    pub value: Array2<f32>,
    /// Square root of the second moment `[B, H]`, when the model has that head
    pub sqrt_m2: Option<Array2<f32>>,
}

/// A policy network with a horizon-conditioned value head
pub trait TvfModel {
    /// Number of discrete actions
    fn num_actions(&self) -> usize;

    /// Log-probabilities of each action `[B, num_actions]`
    fn log_policy(&self, observations: &[Vec<f32>]) -> Result<Array2<f32>>;

    /// Value curve at the horizons packed into `aux` (`[B, H, 2]`, see
    /// [`crate::tvf::features::package_aux_features`])
    fn predict_values(
        &self,
        observations: &[Vec<f32>],
        aux: ArrayView3<f32>,
    ) -> Result<ValuePrediction>;
}

impl<M: TvfModel + ?Sized> TvfModel for &M {
    fn num_actions(&self) -> usize {
        (**self).num_actions()
    }

    fn log_policy(&self, observations: &[Vec<f32>]) -> Result<Array2<f32>> {
        (**self).log_policy(observations)
    }

    fn predict_values(
        &self,
        observations: &[Vec<f32>],
        aux: ArrayView3<f32>,
    ) -> Result<ValuePrediction> {
        (**self).predict_values(observations, aux)
    }
}

/// Sample an action from a row of log-probabilities
pub fn sample_action<R: Rng + ?Sized>(log_probs: ArrayView1<f32>, rng: &mut R) -> Result<usize> {
    let probs: Vec<f32> = log_probs.iter().map(|lp| lp.exp()).collect();
    match WeightedIndex::new(&probs) {
        Ok(dist) => Ok(dist.sample(rng)),
        Err(e) => bail!("invalid action distribution {:?}: {}", probs, e),
    }
}
