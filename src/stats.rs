//! Shared percentile, robust-scaling and summary-statistic helpers.
//!
//! Every engine that needs a quantile, a median, or an interquartile-style
//! range goes through here instead of reimplementing percentile math per
//! module, the way the teacher crate reaches for `statrs` once in
//! `ml_engine::correlations` rather than hand-rolling a t-distribution CDF.

use statrs::statistics::{Data, Median, OrderStatistics};

/// Percentile of `values` at `p` (0..=100), using `statrs`'s order-statistics
/// implementation. Returns `f64::NAN` if `values` is empty.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut data = Data::new(values.to_vec());
    data.percentile(p.round().clamp(0.0, 100.0) as usize)
}

/// Median of `values`.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    Data::new(values.to_vec()).median()
}

/// A fitted robust scaler: subtract the median, divide by the configured
/// interpercentile range (e.g. `(10, 90)` for the 10th-to-90th-percentile
/// range), matching `sklearn.preprocessing.RobustScaler(quantile_range=...)`
/// as used by the reference implementation.
#[derive(Debug, Clone, Copy)]
pub struct RobustScaler {
    center: f64,
    scale: f64,
}

impl RobustScaler {
    /// Fit on `values` using the percentile pair `(q_lo, q_hi)`, e.g. `(10.0,
    /// 90.0)`. Falls back to a unit scale when the interpercentile range is
    /// zero (constant input), to avoid dividing by zero.
    pub fn fit(values: &[f64], q_lo: f64, q_hi: f64) -> Self {
        let center = median(values);
        let lo = percentile(values, q_lo);
        let hi = percentile(values, q_hi);
        let mut scale = hi - lo;
        if !scale.is_finite() || scale.abs() < 1e-12 {
            scale = 1.0;
        }
        Self { center, scale }
    }

    pub fn transform_one(&self, x: f64) -> f64 {
        (x - self.center) / self.scale
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&x| self.transform_one(x)).collect()
    }

    /// Undo `transform_one`: map a scaled value back to the original scale.
    pub fn inverse_transform_one(&self, x: f64) -> f64 {
        x * self.scale + self.center
    }
}

/// Arithmetic mean, `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, `0.0` for a slice of length `<= 1`.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|&x| (x - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// A centered moving average with window `window`, same-length output. A
/// window of `1` is the identity transform. Edges are handled by shrinking
/// the window rather than padding, so no artificial boundary values are
/// introduced.
pub fn centered_moving_average(values: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 {
        return values.to_vec();
    }
    let n = values.len();
    let half = window / 2;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            mean(&values[lo..hi])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robust_scaler_centers_on_median() {
        let values: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let scaler = RobustScaler::fit(&values, 10.0, 90.0);
        // median of 0..=100 is 50
        assert!((scaler.transform_one(50.0)).abs() < 1e-6);
    }

    #[test]
    fn robust_scaler_handles_constant_input() {
        let values = vec![5.0; 20];
        let scaler = RobustScaler::fit(&values, 10.0, 90.0);
        assert_eq!(scaler.transform_one(5.0), 0.0);
        // Should not divide by zero / produce NaN or inf for a nearby value.
        assert!(scaler.transform_one(6.0).is_finite());
    }

    #[test]
    fn moving_average_identity_at_window_one() {
        let values = vec![1.0, 5.0, 2.0, 9.0];
        assert_eq!(centered_moving_average(&values, 1), values);
    }

    #[test]
    fn moving_average_smooths_constant_signal() {
        let values = vec![3.0; 50];
        let smoothed = centered_moving_average(&values, 5);
        for v in smoothed {
            assert!((v - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn std_dev_of_constant_series_is_zero() {
        assert_eq!(std_dev(&[4.0, 4.0, 4.0]), 0.0);
    }
}
