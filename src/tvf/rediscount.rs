//! Rediscounting of value curves
//!
//! A curve learned under one discount can be read back under another. The
//! difference between consecutive horizons is the discounted reward received
//! between them, so undoing the old discount and applying the new one yields
//! the value under the new discount.

use ndarray::{Array1, ArrayView2, Axis};

/// Rediscount value curves `[B, K]` sampled at `horizons` from `old_gamma`
/// to `new_gamma`
///
/// Returns one scalar value per row. When the two discounts are equal the
/// final column is returned unchanged.
///
/// # Formula
/// ```text
/// V'(s) = Σ_i (v_i - v_{i-1}) / γ_old^{h_i} * γ_new^{h_i},   v_{-1} = 0
/// ```
pub fn rediscount(
    values: ArrayView2<f32>,
    old_gamma: f32,
    new_gamma: f32,
    horizons: &[usize],
) -> Array1<f32> {
    let (batch, num_horizons) = values.dim();
    assert_eq!(
        num_horizons,
        horizons.len(),
        "values have {} horizons but {} horizons were given",
        num_horizons,
        horizons.len()
    );

    if num_horizons == 0 {
        return Array1::zeros(batch);
    }

    if old_gamma == new_gamma {
        return values.index_axis(Axis(1), num_horizons - 1).to_owned();
    }

    // (γ_new / γ_old)^h, kept in f64 so long horizons don't lose precision
    let ratio = new_gamma as f64 / old_gamma as f64;
    let weights: Vec<f64> = horizons.iter().map(|&h| ratio.powf(h as f64)).collect();

    let mut result = Array1::<f32>::zeros(batch);
    for (b, row) in values.outer_iter().enumerate() {
        let mut prev = 0.0_f64;
        let mut total = 0.0_f64;
        for (&v, &w) in row.iter().zip(weights.iter()) {
            let v = v as f64;
            total += (v - prev) * w;
            prev = v;
        }
        result[b] = total as f32;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_same_gamma_is_identity() {
        let values = array![[0.0_f32, 1.0, 1.5], [0.0, -2.0, 4.0]];
        let result = rediscount(values.view(), 0.99, 0.99, &[0, 5, 10]);
        assert_eq!(result, array![1.5_f32, 4.0]);
    }

    #[test]
    fn test_telescoping_when_ratio_is_one() {
        // Gammas differ only in the last bits: the sum telescopes to v_K
        let values = Array2::from_shape_fn((3, 6), |(b, k)| (b * 10 + k * k) as f32);
        let horizons = [0, 1, 2, 3, 4, 5];
        let result = rediscount(values.view(), 1.0, 1.0 - f32::EPSILON, &horizons);
        for b in 0..3 {
            assert!((result[b] - values[[b, 5]]).abs() < 1e-3, "row {}: {}", b, result[b]);
        }
    }

    #[test]
    fn test_undiscounted_to_discounted() {
        // One unit of reward per step under γ=1 gives V(h) = h
        let values = array![[0.0_f32, 1.0, 2.0, 3.0]];
        let result = rediscount(values.view(), 1.0, 0.5, &[0, 1, 2, 3]);
        assert!((result[0] - 0.875).abs() < 1e-6, "got {}", result[0]);
    }

    #[test]
    fn test_empty_curve() {
        let values = Array2::<f32>::zeros((2, 0));
        let result = rediscount(values.view(), 1.0, 0.9, &[]);
        assert_eq!(result, array![0.0_f32, 0.0]);
    }
}
