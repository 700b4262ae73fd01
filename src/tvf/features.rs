//! Auxiliary input features for the value curve
//!
//! The value head is conditioned on `(horizon, time)` pairs. These helpers
//! build the `[B, H, 2]` feature tensor and the scalings applied to each
//! channel before it reaches the network.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Package horizons and time fractions into `[B, H, 2]` features
///
/// `[.., 0]` holds the horizon broadcast across the batch and `[.., 1]` the
/// per-row time fraction broadcast across horizons.
///
/// # Arguments
///
/// * `horizons` - Horizons shared by every row `[H]`
/// * `time` - Normalized episode time `[B]`
pub fn package_aux_features(horizons: &[usize], time: ArrayView1<f32>) -> Array3<f32> {
    let batch = time.len();
    let per_row = Array2::from_shape_fn((batch, horizons.len()), |(_, h)| horizons[h] as f32);
    package_aux_features_batched(per_row.view(), time)
}

/// Package per-row horizons `[B, H]` and time `[B]` into `[B, H, 2]`
pub fn package_aux_features_batched(horizons: ArrayView2<f32>, time: ArrayView1<f32>) -> Array3<f32> {
    let (batch, num_horizons) = horizons.dim();
    assert_eq!(
        time.len(),
        batch,
        "time has shape [{}] but horizons have batch dimension {}",
        time.len(),
        batch
    );

    Array3::from_shape_fn((batch, num_horizons, 2), |(b, h, c)| {
        if c == 0 {
            horizons[[b, h]]
        } else {
            time[b]
        }
    })
}

/// Repeat a `[K]` vector into `[N, A, K]`
pub fn expand_to_na(n: usize, a: usize, x: ArrayView1<f32>) -> Array3<f32> {
    x.broadcast((n, a, x.len()))
        .expect("a 1-d array always broadcasts to [n, a, k]")
        .to_owned()
}

/// Repeat an `[N, A]` array into `[N, A, H]`
pub fn expand_to_h(h: usize, x: ArrayView2<f32>) -> Array3<f32> {
    let (n, a) = x.dim();
    x.insert_axis(Axis(2))
        .broadcast((n, a, h))
        .expect("[n, a, 1] always broadcasts to [n, a, h]")
        .to_owned()
}

/// Scaling applied to a horizon or time channel before it enters the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleFunction {
    /// `x / max_horizon`
    #[default]
    Default,
    /// Feature disabled
    Zero,
    /// `log10(10 + x) - 1`
    Log,
    /// `sqrt(x)`
    Sqrt,
    /// Roughly unit normal over `[0, max_horizon]`
    Centered,
    /// Roughly 10x `Centered`
    Wide,
    /// Roughly 30x `Centered`
    Wider,
}

impl ScaleFunction {
    /// Apply the scaling to a single value
    pub fn apply(self, x: f32, max_horizon: f32) -> f32 {
        match self {
            ScaleFunction::Default => x / max_horizon,
            ScaleFunction::Zero => 0.0,
            ScaleFunction::Log => (10.0 + x).log10() - 1.0,
            ScaleFunction::Sqrt => x.sqrt(),
            ScaleFunction::Centered => (x / max_horizon - 0.5) * 3.0,
            ScaleFunction::Wide => (x / max_horizon - 0.5) * 30.0,
            ScaleFunction::Wider => (x / max_horizon - 0.5) * 100.0,
        }
    }

    /// Apply the scaling to one channel of `[B, H, 2]` aux features in place
    pub fn apply_channel(self, features: &mut Array3<f32>, channel: usize, max_horizon: f32) {
        features
            .index_axis_mut(Axis(2), channel)
            .mapv_inplace(|x| self.apply(x, max_horizon));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    #[test]
    fn test_package_aux_features() {
        let time = array![0.1_f32, 0.2];
        let features = package_aux_features(&[0, 5, 10], time.view());

        assert_eq!(features.dim(), (2, 3, 2));
        let expected_h = array![[0.0_f32, 5.0, 10.0], [0.0, 5.0, 10.0]];
        let expected_t = array![[0.1_f32, 0.1, 0.1], [0.2, 0.2, 0.2]];
        assert_eq!(features.slice(s![.., .., 0]), expected_h);
        assert_eq!(features.slice(s![.., .., 1]), expected_t);
    }

    #[test]
    fn test_package_aux_features_batched() {
        let horizons = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let time = array![0.5_f32, 0.75];
        let features = package_aux_features_batched(horizons.view(), time.view());

        assert_eq!(features[[1, 0, 0]], 3.0);
        assert_eq!(features[[1, 1, 1]], 0.75);
    }

    #[test]
    #[should_panic(expected = "time has shape [3]")]
    fn test_package_aux_features_shape_mismatch() {
        let horizons = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let time = array![0.5_f32, 0.75, 1.0];
        package_aux_features_batched(horizons.view(), time.view());
    }

    #[test]
    fn test_expand() {
        let x = array![1.0_f32, 2.0, 3.0];
        let na = expand_to_na(2, 4, x.view());
        assert_eq!(na.dim(), (2, 4, 3));
        assert_eq!(na[[1, 3, 2]], 3.0);

        let y = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let h = expand_to_h(5, y.view());
        assert_eq!(h.dim(), (2, 2, 5));
        assert_eq!(h[[1, 0, 4]], 3.0);
    }

    #[test]
    fn test_scale_functions() {
        assert_eq!(ScaleFunction::Default.apply(50.0, 100.0), 0.5);
        assert_eq!(ScaleFunction::Zero.apply(50.0, 100.0), 0.0);
        assert!((ScaleFunction::Log.apply(90.0, 100.0) - 1.0).abs() < 1e-6);
        assert_eq!(ScaleFunction::Sqrt.apply(16.0, 100.0), 4.0);
        assert_eq!(ScaleFunction::Centered.apply(50.0, 100.0), 0.0);
        assert!((ScaleFunction::Wider.apply(100.0, 100.0) - 50.0).abs() < 1e-4);
    }
}
