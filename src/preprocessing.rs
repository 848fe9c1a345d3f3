//! Reconciles `S` and `BU`, masks missing/stale samples, and derives the
//! event-length filter bank every downstream evaluator consumes.
//!
//! Grounded in `original_source/src/preprocess.py` (`preprocess_data`,
//! `find_subsequent_duplicates`, `match_bottomup_load`), generalized into a
//! typed config struct per SPEC_FULL.md's "Dynamic hyperparameter
//! dictionaries" design note.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_length;
use crate::linalg;
use crate::stats;
use crate::types::{Bucket, LengthFilterBank, PreprocessedStation, RawLabel, RawStation};

/// Preprocessing hyperparameters (spec.md section 4.1's `cfg`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Run length of consecutive equal `S` values that marks staleness.
    pub subsequent_nr: usize,
    /// `(q_lo, q_hi)` percentiles of `diff_original` used to select the
    /// linear-fit candidate set.
    pub lin_fit_quantiles: (f64, f64),
    /// Remaps raw integer label codes onto `{0, 1, 5}` before anything
    /// downstream sees them. Codes absent from the map pass through
    /// unchanged.
    pub label_transform: HashMap<RawLabel, RawLabel>,
    /// Drop samples whose (transformed) label is `5` (uncertain).
    pub remove_uncertain: bool,
    /// Multiply `S_original` by 1000 before any other processing.
    pub rescale_s_to_kw: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            subsequent_nr: 4,
            lin_fit_quantiles: (10.0, 90.0),
            label_transform: HashMap::new(),
            remove_uncertain: true,
            rescale_s_to_kw: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("station {station_id}: no candidate rows remain after missing/quantile filtering")]
    InsufficientData { station_id: String },
    #[error("station {station_id}: all samples are missing or diff is undefined everywhere")]
    AllMissing { station_id: String },
}

/// Count, for every index, whether it belongs to a run of `>= subsequent_nr`
/// consecutive equal values of `y` (`find_subsequent_duplicates`).
fn find_subsequent_duplicates(y: &[f64], subsequent_nr: usize) -> Vec<bool> {
    let n = y.len();
    let mut flagged = vec![false; n];
    if n < 2 || subsequent_nr < 1 {
        return flagged;
    }
    let mut count = 1usize;
    for i in 1..n {
        if y[i] == y[i - 1] {
            count += 1;
        } else {
            count = 1;
        }
        if count >= subsequent_nr {
            for j in (i + 1 - count)..=i {
                flagged[j] = true;
            }
        }
    }
    flagged
}

/// Least-squares fit of `a, b` minimizing `sum((a*bu + b) - s)^2` when
/// `min(s) < 0`, or `sum((|a*bu + b| - s))^2` otherwise
/// (`match_bottomup_load`). Falls back to `(1.0, 0.0)` on non-convergence.
fn match_bottomup_load(bu: &[f64], s: &[f64]) -> (f64, f64) {
    if bu.is_empty() || bu.len() != s.len() {
        return (1.0, 0.0);
    }

    let min_s = s.iter().cloned().fold(f64::INFINITY, f64::min);

    if min_s < 0.0 {
        // Quadratic in (a, b): solved exactly via the normal equations.
        let rows: Vec<Vec<f64>> = bu.iter().map(|&x| vec![x, 1.0]).collect();
        return match linalg::ols_fit(&rows, s) {
            Some(beta) if beta.iter().all(|v| v.is_finite()) => (beta[0], beta[1]),
            _ => (1.0, 0.0),
        };
    }

    // abs(a*bu + b) - s: not quadratic, solved by iterative reweighted
    // least squares around the signed solution, with a fixed iteration
    // cap and fallback to the signed solution if it never improves.
    let rows: Vec<Vec<f64>> = bu.iter().map(|&x| vec![x, 1.0]).collect();
    let (mut a, mut b) = match linalg::ols_fit(&rows, s) {
        Some(beta) if beta.iter().all(|v| v.is_finite()) => (beta[0], beta[1]),
        _ => (1.0, 0.0),
    };

    let residual = |a: f64, b: f64| -> f64 {
        bu.iter()
            .zip(s.iter())
            .map(|(&x, &y)| ((a * x + b).abs() - y).powi(2))
            .sum()
    };
    let mut best_residual = residual(a, b);

    for _ in 0..25 {
        // Reweight: linearize abs(.) around the current sign pattern and
        // re-solve the resulting signed least squares.
        let signs: Vec<f64> = bu.iter().map(|&x| (a * x + b).signum()).collect();
        let signed_s: Vec<f64> = s.iter().zip(signs.iter()).map(|(&y, &sg)| y * sg).collect();
        let rows: Vec<Vec<f64>> = bu
            .iter()
            .zip(signs.iter())
            .map(|(&x, &sg)| vec![x * sg, sg])
            .collect();
        let Some(beta) = linalg::ols_fit(&rows, &signed_s) else {
            break;
        };
        if !beta.iter().all(|v| v.is_finite()) {
            break;
        }
        let candidate_residual = residual(beta[0], beta[1]);
        if candidate_residual >= best_residual - 1e-12 {
            break;
        }
        a = beta[0];
        b = beta[1];
        best_residual = candidate_residual;
    }

    if a.is_finite() && b.is_finite() {
        (a, b)
    } else {
        (1.0, 0.0)
    }
}

/// Preprocess one station's raw signals and labels per spec.md section 4.1.
///
/// Samples where `diff` is undefined (missing input, non-finite fit) are
/// dropped and indices compacted.
pub fn preprocess(raw: &RawStation, cfg: &PreprocessConfig) -> Result<PreprocessedStation, PreprocessError> {
    let n = raw.len();

    let mut s_original: Vec<f64> = raw
        .s_original
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    if cfg.rescale_s_to_kw {
        for v in s_original.iter_mut() {
            *v *= 1000.0;
        }
    }
    let bu_original: Vec<f64> = raw
        .bu_original
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    let diff_original: Vec<f64> = s_original
        .iter()
        .zip(bu_original.iter())
        .map(|(&s, &bu)| s - bu)
        .collect();

    let mut missing = raw.missing.clone().unwrap_or_else(|| vec![false; n]);
    for i in 0..n {
        if raw.s_original[i].is_none() || raw.bu_original[i].is_none() {
            missing[i] = true;
        }
    }
    let stale = find_subsequent_duplicates(&s_original, cfg.subsequent_nr);
    for i in 0..n {
        missing[i] = missing[i] || stale[i];
    }

    let transformed_label: Vec<RawLabel> = raw
        .label
        .iter()
        .map(|l| l.map(|v| *cfg.label_transform.get(&v).unwrap_or(&v)).unwrap_or(0))
        .collect();

    // Keep indices after the (optional) uncertain-label drop.
    let kept: Vec<usize> = (0..n)
        .filter(|&i| !(cfg.remove_uncertain && transformed_label[i] == 5))
        .collect();

    // Candidate rows for the linear fit: not missing, and diff_original
    // strictly within the (q_lo, q_hi) percentile band over that subset.
    let non_missing_diff: Vec<f64> = kept
        .iter()
        .filter(|&&i| !missing[i])
        .map(|&i| diff_original[i])
        .collect();
    if non_missing_diff.is_empty() {
        return Err(PreprocessError::InsufficientData {
            station_id: raw.station_id.clone(),
        });
    }
    let (q_lo, q_hi) = cfg.lin_fit_quantiles;
    let lo_value = stats::percentile(&non_missing_diff, q_lo);
    let hi_value = stats::percentile(&non_missing_diff, q_hi);

    let candidate_idx: Vec<usize> = kept
        .iter()
        .filter(|&&i| !missing[i] && diff_original[i] > lo_value && diff_original[i] < hi_value)
        .copied()
        .collect();
    if candidate_idx.is_empty() {
        return Err(PreprocessError::InsufficientData {
            station_id: raw.station_id.clone(),
        });
    }

    let candidate_bu: Vec<f64> = candidate_idx.iter().map(|&i| bu_original[i]).collect();
    let candidate_s: Vec<f64> = candidate_idx.iter().map(|&i| s_original[i]).collect();
    let (a, b) = match_bottomup_load(&candidate_bu, &candidate_s);

    let bu: Vec<f64> = bu_original.iter().map(|&x| a * x + b).collect();

    // Sign-flip decision: looked up at argmin(S_original) over the *kept*
    // rows, matching `X_df['S_original'].argmin()` in the source (which
    // operates on the label-filtered frame).
    let mut s = s_original.clone();
    let min_s_original = kept
        .iter()
        .map(|&i| s_original[i])
        .fold(f64::INFINITY, f64::min);
    if min_s_original >= 0.0 {
        if let Some(&argmin_idx) = kept
            .iter()
            .min_by(|&&i, &&j| s_original[i].partial_cmp(&s_original[j]).unwrap())
        {
            if bu[argmin_idx] < 0.0 {
                for i in 0..n {
                    s[i] = bu[i].signum() * s[i];
                }
            }
        }
    }

    let diff: Vec<f64> = s.iter().zip(bu.iter()).map(|(&x, &y)| x - y).collect();

    let final_idx: Vec<usize> = kept.into_iter().filter(|&i| diff[i].is_finite()).collect();
    if final_idx.is_empty() {
        return Err(PreprocessError::AllMissing {
            station_id: raw.station_id.clone(),
        });
    }

    let gather = |v: &[f64]| -> Vec<f64> { final_idx.iter().map(|&i| v[i]).collect() };

    Ok(PreprocessedStation {
        station_id: raw.station_id.clone(),
        timestamp: final_idx.iter().map(|&i| raw.timestamp[i]).collect(),
        s_original: gather(&s_original),
        bu_original: gather(&bu_original),
        diff_original: gather(&diff_original),
        s: gather(&s),
        bu: gather(&bu),
        diff: gather(&diff),
        missing: final_idx.iter().map(|&i| missing[i]).collect(),
        label: final_idx.iter().map(|&i| transformed_label[i]).collect(),
        fit_a: a,
        fit_b: b,
    })
}

/// Derive the per-bucket exclusion masks for one preprocessed station
/// (spec.md section 4.2, `event_length::filters`).
pub fn length_filters(
    station: &PreprocessedStation,
    cutoffs: &[Bucket],
    uncertain_codes: &[RawLabel],
    remove_missing: bool,
) -> LengthFilterBank {
    let lengths = event_length::event_lengths(&station.label);
    event_length::filters(
        &lengths,
        &station.label,
        cutoffs,
        uncertain_codes,
        remove_missing,
        &station.missing,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawStation;

    fn station(s_original: Vec<f64>, bu_original: Vec<f64>, label: Vec<i64>) -> RawStation {
        let n = s_original.len();
        RawStation {
            station_id: "s1".into(),
            timestamp: (0..n as i64).collect(),
            s_original: s_original.into_iter().map(Some).collect(),
            bu_original: bu_original.into_iter().map(Some).collect(),
            label: label.into_iter().map(Some).collect(),
            missing: None,
        }
    }

    #[test]
    fn preserves_length_invariant() {
        let s: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut bu = s.clone();
        bu[50] = 0.0; // BU roughly matches S except one point
        let raw = station(s, bu, vec![0; 100]);
        let cfg = PreprocessConfig {
            remove_uncertain: false,
            ..Default::default()
        };
        let pp = preprocess(&raw, &cfg).unwrap();
        assert_eq!(pp.len(), pp.s.len());
        assert_eq!(pp.len(), pp.bu.len());
        assert_eq!(pp.len(), pp.diff.len());
        assert_eq!(pp.len(), pp.label.len());
        assert_eq!(pp.len(), pp.missing.len());
    }

    #[test]
    fn spc_outlier_scenario_isolates_single_spike() {
        // spec.md section 8 scenario 1: ramp with a single outlier at 50.
        let mut s_original: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let bu_original = s_original.clone();
        s_original[50] = 200.0;
        let mut label = vec![0i64; 100];
        label[50] = 1;
        let raw = station(s_original, bu_original, label);
        let cfg = PreprocessConfig {
            remove_uncertain: false,
            ..Default::default()
        };
        let pp = preprocess(&raw, &cfg).unwrap();
        // diff at index 50 must stand out as the extreme value.
        let max_idx = pp
            .diff
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .unwrap()
            .0;
        assert_eq!(max_idx, 50);
    }

    #[test]
    fn zero_variance_station_marks_stale_run_missing() {
        let s_original = vec![5.0; 20];
        let bu_original = vec![5.0; 20];
        let label = vec![0i64; 20];
        let raw = station(s_original, bu_original, label);
        let cfg = PreprocessConfig {
            subsequent_nr: 4,
            remove_uncertain: false,
            ..Default::default()
        };
        let pp = preprocess(&raw, &cfg).unwrap();
        assert!(pp.missing.iter().all(|&m| m));
    }

    #[test]
    fn insufficient_candidates_after_filtering_is_an_error() {
        let raw = RawStation {
            station_id: "empty".into(),
            timestamp: vec![0, 1, 2],
            s_original: vec![None, None, None],
            bu_original: vec![None, None, None],
            label: vec![Some(0), Some(0), Some(0)],
            missing: None,
        };
        let cfg = PreprocessConfig::default();
        assert!(matches!(
            preprocess(&raw, &cfg),
            Err(PreprocessError::InsufficientData { .. })
        ));
    }

    #[test]
    fn label_transform_remaps_codes_before_uncertain_drop() {
        let s_original: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let bu_original = s_original.clone();
        let mut label = vec![0i64; 30];
        label[10] = 9; // arbitrary raw code mapped to uncertain (5)
        let raw = station(s_original, bu_original, label);
        let mut transform = HashMap::new();
        transform.insert(9, 5);
        let cfg = PreprocessConfig {
            label_transform: transform,
            remove_uncertain: true,
            ..Default::default()
        };
        let pp = preprocess(&raw, &cfg).unwrap();
        assert_eq!(pp.len(), 29);
        assert!(!pp.label.contains(&5));
    }
}
