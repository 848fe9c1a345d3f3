//! ARIMA / SARIMAX residual engines.
//!
//! Fits a two-stage Hannan-Rissanen estimator: a long auxiliary
//! autoregression supplies proxy innovations, which then enter a second
//! ordinary-least-squares regression alongside the AR/seasonal-AR lags (and,
//! for the exogenous variant, a lag-1 companion series) to produce fitted
//! values. The per-sample score is the squared residual between fitted and
//! (robust-scaled) actual values.

use serde::{Deserialize, Serialize};

use super::{EngineError, ScoreProducer};
use crate::linalg;
use crate::stats;
use crate::types::PreprocessedStation;

/// Non-seasonal `(p, d, q)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

/// Seasonal `(P, D, Q, s)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
    pub period: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArimaConfig {
    pub order: ArimaOrder,
    pub seasonal: Option<SeasonalOrder>,
    /// Use the previous sample's scaled `S` value as an exogenous regressor.
    pub exogenous: bool,
    pub quantiles: (f64, f64),
    /// Order of the auxiliary AR fit used to produce proxy innovations.
    pub aux_ar_order: usize,
}

impl Default for ArimaConfig {
    fn default() -> Self {
        Self {
            order: ArimaOrder { p: 1, d: 0, q: 1 },
            seasonal: None,
            exogenous: false,
            quantiles: (10.0, 90.0),
            aux_ar_order: 10,
        }
    }
}

impl ArimaConfig {
    pub(crate) fn model_string(&self) -> String {
        let seasonal = match self.seasonal {
            Some(s) => format!("({},{},{},{})", s.p, s.d, s.q, s.period),
            None => "none".to_string(),
        };
        format!(
            "order=({},{},{});seasonal={};exogenous={};quantiles=({},{});aux_ar_order={}",
            self.order.p,
            self.order.d,
            self.order.q,
            seasonal,
            self.exogenous,
            self.quantiles.0,
            self.quantiles.1,
            self.aux_ar_order
        )
    }
}

/// Apply seasonal differencing `seasonal_d` times at `period`, then regular
/// differencing `d` times at lag 1. Returns the differenced series and how
/// many leading samples were consumed.
fn difference(series: &[f64], d: usize, seasonal: Option<SeasonalOrder>) -> (Vec<f64>, usize) {
    let mut working = series.to_vec();
    let mut consumed = 0;
    if let Some(s) = seasonal {
        for _ in 0..s.d {
            if working.len() <= s.period {
                return (Vec::new(), series.len());
            }
            working = (s.period..working.len()).map(|i| working[i] - working[i - s.period]).collect();
            consumed += s.period;
        }
    }
    for _ in 0..d {
        if working.len() <= 1 {
            return (Vec::new(), series.len());
        }
        working = (1..working.len()).map(|i| working[i] - working[i - 1]).collect();
        consumed += 1;
    }
    (working, consumed)
}

/// Fit a long AR(`order`) model by OLS and return its in-sample residuals,
/// left-padded with zeros for the unobservable startup lags. These act as
/// proxy innovations for the MA terms of the second-stage regression.
fn auxiliary_ar_residuals(series: &[f64], order: usize) -> Vec<f64> {
    let n = series.len();
    if order == 0 || n <= order {
        return vec![0.0; n];
    }
    let rows: Vec<Vec<f64>> =
        (order..n).map(|t| (1..=order).map(|lag| series[t - lag]).collect()).collect();
    let targets: Vec<f64> = series[order..].to_vec();
    let coeffs = match linalg::ols_fit(&rows, &targets) {
        Some(c) => c,
        None => return vec![0.0; n],
    };
    let mut residuals = vec![0.0; n];
    for (i, row) in rows.iter().enumerate() {
        let fitted: f64 = row.iter().zip(coeffs.iter()).map(|(x, b)| x * b).sum();
        residuals[order + i] = targets[i] - fitted;
    }
    residuals
}

/// Hannan-Rissanen second-stage fit: regress the differenced series on its
/// own AR/seasonal-AR lags, the proxy-innovation MA/seasonal-MA lags, and an
/// optional lag-1 exogenous column.
///
/// Returns `(fitted, residual)` aligned to `working`'s index (shorter than
/// `working` by the number of lags consumed at the front).
fn fit_arma(
    working: &[f64],
    order: ArimaOrder,
    seasonal: Option<SeasonalOrder>,
    aux_ar_order: usize,
    exogenous_lagged: Option<&[f64]>,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let n = working.len();
    let innovations = auxiliary_ar_residuals(working, aux_ar_order);

    let seasonal_ar = seasonal.map(|s| s.p).unwrap_or(0);
    let seasonal_ma = seasonal.map(|s| s.q).unwrap_or(0);
    let period = seasonal.map(|s| s.period).unwrap_or(0);

    let max_lag = [
        order.p,
        order.q,
        seasonal_ar * period,
        seasonal_ma * period,
        usize::from(exogenous_lagged.is_some()),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    if n <= max_lag || n <= 1 {
        return None;
    }

    let mut rows = Vec::with_capacity(n - max_lag);
    let mut targets = Vec::with_capacity(n - max_lag);
    for t in max_lag..n {
        let mut row = Vec::with_capacity(order.p + order.q + seasonal_ar + seasonal_ma + 2);
        row.push(1.0); // intercept
        for lag in 1..=order.p {
            row.push(working[t - lag]);
        }
        for lag in 1..=order.q {
            row.push(innovations[t - lag]);
        }
        for k in 1..=seasonal_ar {
            row.push(working[t - k * period]);
        }
        for k in 1..=seasonal_ma {
            row.push(innovations[t - k * period]);
        }
        if let Some(exo) = exogenous_lagged {
            row.push(exo[t - 1]);
        }
        rows.push(row);
        targets.push(working[t]);
    }

    let coeffs = linalg::ols_fit(&rows, &targets)?;
    let mut fitted = Vec::with_capacity(rows.len());
    let mut residual = Vec::with_capacity(rows.len());
    for (row, &actual) in rows.iter().zip(targets.iter()) {
        let f: f64 = row.iter().zip(coeffs.iter()).map(|(x, b)| x * b).sum();
        fitted.push(f);
        residual.push(actual - f);
    }
    Some((fitted, residual))
}

/// Fit an ARMA model on `scaled` (already robust-scaled) and return a
/// per-sample squared-residual score alongside the model's fitted value at
/// each sample, both the same length as `scaled`. Unobservable startup
/// samples are scored zero and carry their own (unfitted) value as
/// "fitted". Returns `None` on numerical non-convergence (degrades the
/// station's score to all-zeros upstream).
pub(crate) fn score_series(
    scaled: &[f64],
    config: &ArimaConfig,
    exogenous_scaled: Option<&[f64]>,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let n = scaled.len();
    let (working, offset) = difference(scaled, config.order.d, config.seasonal);
    if working.is_empty() {
        return None;
    }
    let exo_lagged = exogenous_scaled.map(|exo| {
        if offset < exo.len() {
            exo[offset..].to_vec()
        } else {
            Vec::new()
        }
    });
    let exo_ref = match &exo_lagged {
        Some(v) if v.len() == working.len() => Some(v.as_slice()),
        Some(_) => return None,
        None => None,
    };
    let (fitted, residual) = fit_arma(&working, config.order, config.seasonal, config.aux_ar_order, exo_ref)?;

    let lag_consumed = working.len() - residual.len();
    let mut scores = vec![0.0; n];
    let mut fitted_full = scaled.to_vec();
    for (i, (&r, &f)) in residual.iter().zip(fitted.iter()).enumerate() {
        let idx = offset + lag_consumed + i;
        if idx < n {
            scores[idx] = r * r;
            fitted_full[idx] = f;
        }
    }
    Some((scores, fitted_full))
}

pub(crate) fn station_exogenous(config: &ArimaConfig, station: &PreprocessedStation, scaler: &stats::RobustScaler) -> Option<Vec<f64>> {
    if config.exogenous {
        Some(scaler.transform(&station.s))
    } else {
        None
    }
}

pub struct BasicArimaProducer {
    pub config: ArimaConfig,
}

impl BasicArimaProducer {
    pub fn new(config: ArimaConfig) -> Self {
        Self { config }
    }

    fn score_station(&self, station: &PreprocessedStation) -> Vec<f64> {
        let scaler = stats::RobustScaler::fit(&station.diff, self.config.quantiles.0, self.config.quantiles.1);
        let scaled = scaler.transform(&station.diff);
        let exo = station_exogenous(&self.config, station, &scaler);
        score_series(&scaled, &self.config, exo.as_deref())
            .map(|(scores, _)| scores)
            .unwrap_or_else(|| vec![0.0; station.len()])
    }
}

impl ScoreProducer for BasicArimaProducer {
    fn method_name(&self) -> &'static str {
        "basic_arima"
    }

    fn model_string(&self) -> String {
        format!("method=basic_arima;{}", self.config.model_string())
    }

    fn fit_transform(&mut self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        Ok(batch.iter().map(|s| self.score_station(s)).collect())
    }

    fn transform(&self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        Ok(batch.iter().map(|s| self.score_station(s)).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeArimaConfig {
    pub arima: ArimaConfig,
    /// Total number of fitting passes; the last pass scores the cleaned
    /// input against the original unscaled column.
    pub max_iter: usize,
    /// Outlier threshold in units of the whole-batch score standard
    /// deviation.
    pub outlier_sigma: f64,
}

impl Default for IterativeArimaConfig {
    fn default() -> Self {
        Self { arima: ArimaConfig::default(), max_iter: 3, outlier_sigma: 2.5 }
    }
}

pub struct IterativeArimaProducer {
    pub config: IterativeArimaConfig,
}

impl IterativeArimaProducer {
    pub fn new(config: IterativeArimaConfig) -> Self {
        Self { config }
    }

    /// Runs the outlier-replacement loop for one station, returning the
    /// final-pass scores measured against the *original scaled* `diff`
    /// column even though the last fit ran on the scaled-then-cleaned
    /// series — the two scales are intentionally mixed here (spec.md §9's
    /// open question on `IterativeARIMA`'s score-sign convention).
    fn score_station(&self, station: &PreprocessedStation, whole_batch_std: f64) -> Vec<f64> {
        let scaler = stats::RobustScaler::fit(&station.diff, self.config.arima.quantiles.0, self.config.arima.quantiles.1);
        let original_scaled = scaler.transform(&station.diff);
        let exo = station_exogenous(&self.config.arima, station, &scaler);

        let mut cleaned = original_scaled.clone();
        let passes = self.config.max_iter.max(1);
        let threshold = self.config.outlier_sigma * whole_batch_std;

        let mut fitted = cleaned.clone();
        for _ in 0..(passes - 1) {
            let (pass_scores, pass_fitted) =
                score_series(&cleaned, &self.config.arima, exo.as_deref()).unwrap_or_else(|| (vec![0.0; cleaned.len()], cleaned.clone()));
            for (i, &sc) in pass_scores.iter().enumerate() {
                if sc > threshold {
                    cleaned[i] = pass_fitted[i];
                }
            }
            fitted = pass_fitted;
        }

        // Final pass: fit against the cleaned input, but score against the
        // original (uncleaned) scaled input per spec.md §4.3.4.
        let (_, final_fitted) =
            score_series(&cleaned, &self.config.arima, exo.as_deref()).unwrap_or((vec![0.0; cleaned.len()], fitted));

        original_scaled
            .iter()
            .zip(final_fitted.iter())
            .map(|(&actual, &fit)| (actual - fit).powi(2))
            .collect()
    }
}

impl ScoreProducer for IterativeArimaProducer {
    fn method_name(&self) -> &'static str {
        "iterative_arima"
    }

    fn model_string(&self) -> String {
        format!(
            "method=iterative_arima;{};max_iter={};outlier_sigma={}",
            self.config.arima.model_string(),
            self.config.max_iter,
            self.config.outlier_sigma
        )
    }

    fn fit_transform(&mut self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        self.transform(batch)
    }

    fn transform(&self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        let first_pass: Vec<Vec<f64>> = batch
            .iter()
            .map(|s| {
                let scaler = stats::RobustScaler::fit(&s.diff, self.config.arima.quantiles.0, self.config.arima.quantiles.1);
                let scaled = scaler.transform(&s.diff);
                let exo = station_exogenous(&self.config.arima, s, &scaler);
                score_series(&scaled, &self.config.arima, exo.as_deref()).unwrap_or_else(|| vec![0.0; s.len()])
            })
            .collect();
        let all_scores: Vec<f64> = first_pass.iter().flatten().copied().collect();
        let whole_batch_std = stats::std_dev(&all_scores);
        Ok(batch.iter().map(|s| self.score_station(s, whole_batch_std)).collect())
    }
}
