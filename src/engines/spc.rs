//! Statistical Process Control engine (spec.md section 4.3.1).
//!
//! Grounded in `original_source/src/methods.py`'s `StatisticalProfiling`:
//! a `RobustScaler`-style centering/scaling of (optionally smoothed) `diff`
//! values, emitted as signed scores.

use serde::{Deserialize, Serialize};

use super::{EngineError, ScoreProducer};
use crate::stats;
use crate::types::PreprocessedStation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpcConfig {
    /// Centered moving-average window applied to `diff` before scaling.
    /// `1` is the identity transform.
    pub move_avg: usize,
    /// `(q_lo, q_hi)` interpercentile range used by the robust scaler.
    pub quantiles: (f64, f64),
}

impl Default for SpcConfig {
    fn default() -> Self {
        Self { move_avg: 1, quantiles: (10.0, 90.0) }
    }
}

pub struct SpcProducer {
    pub config: SpcConfig,
}

impl SpcProducer {
    pub fn new(config: SpcConfig) -> Self {
        Self { config }
    }

    fn score_station(&self, station: &PreprocessedStation) -> Vec<f64> {
        let smoothed = stats::centered_moving_average(&station.diff, self.config.move_avg);
        let scaler = stats::RobustScaler::fit(&smoothed, self.config.quantiles.0, self.config.quantiles.1);
        scaler.transform(&smoothed)
    }
}

impl ScoreProducer for SpcProducer {
    fn method_name(&self) -> &'static str {
        "spc"
    }

    fn model_string(&self) -> String {
        format!(
            "method=spc;move_avg={};quantiles=({},{})",
            self.config.move_avg, self.config.quantiles.0, self.config.quantiles.1
        )
    }

    fn fit_transform(&mut self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        Ok(batch.iter().map(|s| self.score_station(s)).collect())
    }

    fn transform(&self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        // SPC is stateless per station (its scaler is refit on whatever
        // batch it's given), so transform and fit_transform coincide.
        Ok(batch.iter().map(|s| self.score_station(s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(diff: Vec<f64>) -> PreprocessedStation {
        let n = diff.len();
        PreprocessedStation {
            station_id: "s1".into(),
            timestamp: (0..n as i64).collect(),
            s_original: vec![0.0; n],
            bu_original: vec![0.0; n],
            diff_original: diff.clone(),
            s: vec![0.0; n],
            bu: vec![0.0; n],
            diff,
            missing: vec![false; n],
            label: vec![0; n],
            fit_a: 1.0,
            fit_b: 0.0,
        }
    }

    #[test]
    fn scores_are_never_nan_and_same_length_as_input() {
        let diff: Vec<f64> = (0..50).map(|i| (i as f64).sin()).collect();
        let mut producer = SpcProducer::new(SpcConfig::default());
        let scores = producer.fit_transform(&[station(diff)]).unwrap();
        assert_eq!(scores[0].len(), 50);
        assert!(scores[0].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn identity_window_does_not_smooth() {
        let diff = vec![1.0, 5.0, 2.0, 9.0, 3.0];
        let producer = SpcProducer::new(SpcConfig { move_avg: 1, quantiles: (10.0, 90.0) });
        // With move_avg=1, the only transform applied before scaling is
        // the robust scaler, so a constant shift-and-scale of the input
        // preserves its relative ordering.
        let scores = producer.score_station(&station(diff.clone()));
        let mut order: Vec<usize> = (0..diff.len()).collect();
        order.sort_by(|&a, &b| diff[a].partial_cmp(&diff[b]).unwrap());
        let mut score_order: Vec<usize> = (0..scores.len()).collect();
        score_order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap());
        assert_eq!(order, score_order);
    }

    #[test]
    fn model_string_reflects_config() {
        let producer = SpcProducer::new(SpcConfig { move_avg: 5, quantiles: (5.0, 95.0) });
        assert!(producer.model_string().contains("move_avg=5"));
        assert!(producer.model_string().contains("5,95"));
    }
}
