//! Micro-batched value-curve queries
//!
//! Wraps a [`TvfModel`] and turns `(observations, time, horizons)` requests
//! into value estimates, splitting large requests so that no single forward
//! pass sees more than `max_micro_batch_size` rows.

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

use super::features::package_aux_features;
use crate::policy::TvfModel;

/// Value-curve queries against a model
pub struct ValueCurveEstimator<'a, M: TvfModel + ?Sized> {
    model: &'a M,
    max_micro_batch_size: usize,
    current_horizon: usize,
}

impl<'a, M: TvfModel + ?Sized> ValueCurveEstimator<'a, M> {
    /// Create an estimator
    ///
    /// `current_horizon` is used whenever a scalar query doesn't name one.
    pub fn new(model: &'a M, max_micro_batch_size: usize, current_horizon: usize) -> Self {
        assert!(max_micro_batch_size > 0, "max_micro_batch_size must be positive");
        Self { model, max_micro_batch_size, current_horizon }
    }

    /// Horizon used for scalar queries without an explicit horizon
    pub fn current_horizon(&self) -> usize {
        self.current_horizon
    }

    /// Value of each state at a single horizon `[B]`
    ///
    /// `None` means the current maximum horizon.
    pub fn value_at(
        &self,
        observations: &[Vec<f32>],
        time: ArrayView1<f32>,
        horizon: Option<usize>,
    ) -> Result<Array1<f32>> {
        let h = horizon.unwrap_or(self.current_horizon);
        let curve = self.value_curve(observations, time, &[h])?;
        Ok(curve.index_axis(Axis(1), 0).to_owned())
    }

    /// Value of each state at each horizon `[B, K]`
    pub fn value_curve(
        &self,
        observations: &[Vec<f32>],
        time: ArrayView1<f32>,
        horizons: &[usize],
    ) -> Result<Array2<f32>> {
        let (value, _) = self.forward(observations, time, horizons, false)?;
        Ok(value)
    }

    /// Value and second moment of each state at each horizon, both `[B, K]`
    ///
    /// The model's square-root head is clamped at zero before squaring.
    pub fn value_curve_m2(
        &self,
        observations: &[Vec<f32>],
        time: ArrayView1<f32>,
        horizons: &[usize],
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let (value, m2) = self.forward(observations, time, horizons, true)?;
        match m2 {
            Some(m2) => Ok((value, m2)),
            None => bail!("model has no second moment head"),
        }
    }

    /// Value curve for rollout-shaped input: `[T][A]` observations and
    /// `[T, A]` time give `[T, A, K]`
    pub fn rollout_curve(
        &self,
        observations: &[Vec<Vec<f32>>],
        time: ArrayView2<f32>,
        horizons: &[usize],
    ) -> Result<Array3<f32>> {
        let (flat_obs, flat_time) = flatten_rollout(observations, time)?;
        let (steps, agents) = time.dim();
        let value = self.value_curve(&flat_obs, flat_time.view(), horizons)?;
        Ok(value.into_shape((steps, agents, horizons.len()))?)
    }

    /// Rollout-shaped value and second moment, both `[T, A, K]`
    pub fn rollout_curve_m2(
        &self,
        observations: &[Vec<Vec<f32>>],
        time: ArrayView2<f32>,
        horizons: &[usize],
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        let (flat_obs, flat_time) = flatten_rollout(observations, time)?;
        let (steps, agents) = time.dim();
        let (value, m2) = self.value_curve_m2(&flat_obs, flat_time.view(), horizons)?;
        let shape = (steps, agents, horizons.len());
        Ok((value.into_shape(shape)?, m2.into_shape(shape)?))
    }

    fn forward(
        &self,
        observations: &[Vec<f32>],
        time: ArrayView1<f32>,
        horizons: &[usize],
        with_m2: bool,
    ) -> Result<(Array2<f32>, Option<Array2<f32>>)> {
        let batch = observations.len();
        if time.len() != batch {
            bail!("got {} observations but {} time values", batch, time.len());
        }
        let k = horizons.len();

        let mut value = Array2::<f32>::zeros((batch, k));
        let mut m2 = if with_m2 { Some(Array2::<f32>::zeros((batch, k))) } else { None };

        let mut start = 0;
        while start < batch {
            let end = (start + self.max_micro_batch_size).min(batch);
            let aux = package_aux_features(horizons, time.slice(s![start..end]));
            let prediction = self.model.predict_values(&observations[start..end], aux.view())?;

            if prediction.value.dim() != (end - start, k) {
                bail!(
                    "model returned values with shape {:?}, expected [{}, {}]",
                    prediction.value.dim(),
                    end - start,
                    k
                );
            }
            value.slice_mut(s![start..end, ..]).assign(&prediction.value);

            if let Some(m2) = m2.as_mut() {
                let Some(sqrt_m2) = prediction.sqrt_m2 else {
                    bail!("model has no second moment head");
                };
                if sqrt_m2.dim() != (end - start, k) {
                    bail!(
                        "model returned second moments with shape {:?}, expected [{}, {}]",
                        sqrt_m2.dim(),
                        end - start,
                        k
                    );
                }
                m2.slice_mut(s![start..end, ..])
                    .assign(&sqrt_m2.mapv(|x| x.max(0.0).powi(2)));
            }

            start = end;
        }

        Ok((value, m2))
    }
}

fn flatten_rollout(
    observations: &[Vec<Vec<f32>>],
    time: ArrayView2<f32>,
) -> Result<(Vec<Vec<f32>>, Array1<f32>)> {
    let (steps, agents) = time.dim();
    if observations.len() != steps || observations.iter().any(|row| row.len() != agents) {
        bail!("observations don't match time shape [{}, {}]", steps, agents);
    }
    let flat_obs: Vec<Vec<f32>> = observations.iter().flatten().cloned().collect();
    let flat_time: Array1<f32> = time.iter().copied().collect();
    Ok((flat_obs, flat_time))
}
