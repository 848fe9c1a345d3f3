//! Single- and double-threshold optimization against bucketed F-beta, and
//! the predictor that applies a fitted threshold to a score sequence.
//!
//! Grounded in `original_source/src/methods.py`'s `SingleThresholdMethod`
//! and `DoubleThresholdMethod`, generalized from the original's
//! string-keyed hyperparameter bag into explicit functions per
//! SPEC_FULL.md's "Multiple mixin composition" design note. The
//! interpolation-order and axis-mapping open questions from spec.md
//! section 9 are resolved as recorded in `DESIGN.md`.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{Bucket, LengthFilterBank, RawLabel, ScoreSequence, ThresholdState};

pub const DEFAULT_INTERP_LEN: usize = 10_000;

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("bucket {0} is not present in the preprocessed cutoff set")]
    UnknownBucket(String),
    #[error("no usable (label, score) pairs were found for any used bucket")]
    NoData,
    #[error("station batch length mismatch: {0} labels vs {1} scores")]
    LengthMismatch(usize, usize),
}

/// F-beta score, `(1+b^2)*P*R / (b^2*P + R)`, `0.0` when the denominator is
/// `0` (degenerate precision/recall).
pub fn f_beta(precision: f64, recall: f64, beta: f64) -> f64 {
    let b2 = beta * beta;
    let denom = b2 * precision + recall;
    if denom <= 0.0 {
        0.0
    } else {
        (1.0 + b2) * precision * recall / denom
    }
}

/// Precision/recall curve over candidate thresholds `score >= t`, sorted
/// ascending by `t`. Mirrors `sklearn.metrics.precision_recall_curve`'s
/// shape: `precision`/`recall` carry one more element than `thresholds`,
/// the trailing element being the degenerate "threshold beyond the
/// maximum score" point `(precision=1, recall=0)`.
pub fn precision_recall_curve(y_true: &[bool], y_score: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n_pos = y_true.iter().filter(|&&b| b).count() as f64;

    let mut distinct: Vec<f64> = y_score.to_vec();
    distinct.sort_by(|a, b| a.partial_cmp(b).unwrap());
    distinct.dedup();

    let mut thresholds = Vec::with_capacity(distinct.len());
    let mut precision = Vec::with_capacity(distinct.len() + 1);
    let mut recall = Vec::with_capacity(distinct.len() + 1);

    for &t in &distinct {
        let (mut tp, mut fp) = (0.0_f64, 0.0_f64);
        for (&score, &label) in y_score.iter().zip(y_true.iter()) {
            if score >= t {
                if label {
                    tp += 1.0;
                } else {
                    fp += 1.0;
                }
            }
        }
        precision.push(if tp + fp > 0.0 { tp / (tp + fp) } else { 1.0 });
        recall.push(if n_pos > 0.0 { tp / n_pos } else { 0.0 });
        thresholds.push(t);
    }
    precision.push(1.0);
    recall.push(0.0);
    (precision, recall, thresholds)
}

/// Unnormalized binary-classification curve: raw `(fp, tp)` counts at each
/// distinct candidate threshold `score >= t`, ascending by `t`.
pub fn binary_clf_curve(y_true: &[bool], y_score: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut distinct: Vec<f64> = y_score.to_vec();
    distinct.sort_by(|a, b| a.partial_cmp(b).unwrap());
    distinct.dedup();

    let mut fps = Vec::with_capacity(distinct.len());
    let mut tps = Vec::with_capacity(distinct.len());
    let mut thresholds = Vec::with_capacity(distinct.len());

    for &t in &distinct {
        let (mut tp, mut fp) = (0.0_f64, 0.0_f64);
        for (&score, &label) in y_score.iter().zip(y_true.iter()) {
            if score >= t {
                if label {
                    tp += 1.0;
                } else {
                    fp += 1.0;
                }
            }
        }
        fps.push(fp);
        tps.push(tp);
        thresholds.push(t);
    }
    (fps, tps, thresholds)
}

/// Linearly spaced points from `start` to `end` inclusive (may be
/// descending), length `len`.
pub fn linspace(start: f64, end: f64, len: usize) -> Vec<f64> {
    if len == 0 {
        return Vec::new();
    }
    if len == 1 {
        return vec![start];
    }
    let step = (end - start) / (len as f64 - 1.0);
    (0..len).map(|i| start + step * i as f64).collect()
}

/// `numpy.interp`-style linear interpolation: `xs` must be ascending;
/// clamps to the boundary value outside `[xs[0], xs[-1]]`.
pub fn interp_linear(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    if xs.len() == 1 || x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    match xs.binary_search_by(|v| v.partial_cmp(&x).unwrap()) {
        Ok(i) => ys[i],
        Err(i) => {
            let (x0, x1) = (xs[i - 1], xs[i]);
            let (y0, y1) = (ys[i - 1], ys[i]);
            if (x1 - x0).abs() < 1e-15 {
                y0
            } else {
                y0 + (y1 - y0) * (x - x0) / (x1 - x0)
            }
        }
    }
}

/// Gather `(label == 1, |score|)` pairs across stations for one bucket,
/// skipping samples the bucket's filter excludes.
fn gather_bucket(
    labels: &[&[RawLabel]],
    scores: &[&[f64]],
    filters: &[&LengthFilterBank],
    bucket_key: &str,
    abs_value: bool,
) -> Result<(Vec<bool>, Vec<f64>), ThresholdError> {
    let mut y_true = Vec::new();
    let mut y_score = Vec::new();
    for ((station_labels, station_scores), filter) in labels.iter().zip(scores.iter()).zip(filters.iter()) {
        if station_labels.len() != station_scores.len() {
            return Err(ThresholdError::LengthMismatch(station_labels.len(), station_scores.len()));
        }
        let mask = filter
            .get(bucket_key)
            .ok_or_else(|| ThresholdError::UnknownBucket(bucket_key.to_string()))?;
        for i in 0..station_labels.len() {
            if mask[i] {
                continue;
            }
            y_true.push(station_labels[i] == 1);
            y_score.push(if abs_value { station_scores[i].abs() } else { station_scores[i] });
        }
    }
    Ok((y_true, y_score))
}

/// Single-threshold optimizer (spec.md section 4.4.1).
pub fn optimize_single(
    labels: &[&[RawLabel]],
    scores: &[&[f64]],
    filters: &[&LengthFilterBank],
    used_buckets: &[Bucket],
    beta: f64,
    interp_len: usize,
) -> Result<ThresholdState, ThresholdError> {
    if used_buckets.is_empty() {
        return Err(ThresholdError::NoData);
    }

    let mut thr_per_bucket: HashMap<String, Vec<f64>> = HashMap::new();
    let mut fbeta_per_bucket: HashMap<String, Vec<f64>> = HashMap::new();
    let (mut global_min, mut global_max) = (f64::INFINITY, f64::NEG_INFINITY);

    for bucket in used_buckets {
        let key = bucket.key();
        let (y_true, y_score) = gather_bucket(labels, scores, filters, &key, true)?;
        if y_true.is_empty() {
            continue;
        }
        let (precision, recall, thresholds) = precision_recall_curve(&y_true, &y_score);
        let fbeta: Vec<f64> = precision
            .iter()
            .zip(recall.iter())
            .take(thresholds.len())
            .map(|(&p, &r)| f_beta(p, r, beta))
            .collect();

        // Open question 2 (spec.md section 9): sort both the threshold (x)
        // and f-beta (y) arrays ascending by threshold before interpolating.
        let mut paired: Vec<(f64, f64)> = thresholds.into_iter().zip(fbeta).collect();
        paired.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        let (sorted_thresholds, sorted_fbeta): (Vec<f64>, Vec<f64>) = paired.into_iter().unzip();

        if let (Some(&mn), Some(&mx)) = (sorted_thresholds.first(), sorted_thresholds.last()) {
            global_min = global_min.min(mn);
            global_max = global_max.max(mx);
        }
        thr_per_bucket.insert(key.clone(), sorted_thresholds);
        fbeta_per_bucket.insert(key, sorted_fbeta);
    }

    if !global_min.is_finite() || !global_max.is_finite() || thr_per_bucket.is_empty() {
        return Err(ThresholdError::NoData);
    }

    let grid = linspace(global_max, global_min, interp_len);
    let mut mean_fbeta = vec![0.0_f64; grid.len()];
    for bucket in used_buckets {
        let key = bucket.key();
        let (Some(thr), Some(fb)) = (thr_per_bucket.get(&key), fbeta_per_bucket.get(&key)) else {
            continue;
        };
        for (gi, &g) in grid.iter().enumerate() {
            mean_fbeta[gi] += interp_linear(g, thr, fb);
        }
    }
    let n_used = thr_per_bucket.len() as f64;
    for v in mean_fbeta.iter_mut() {
        *v /= n_used;
    }

    let best = mean_fbeta
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i)
        .ok_or(ThresholdError::NoData)?;

    Ok(ThresholdState::Single { tau: grid[best] })
}

/// Double-threshold optimizer (spec.md section 4.4.2).
///
/// The confusion grid's first (row) axis is the positive half, the second
/// (column) axis the negative half (open question 3, spec.md section 9).
pub fn optimize_double(
    labels: &[&[RawLabel]],
    scores: &[&[f64]],
    filters: &[&LengthFilterBank],
    used_buckets: &[Bucket],
    beta: f64,
    interp_len: usize,
) -> Result<ThresholdState, ThresholdError> {
    if used_buckets.is_empty() {
        return Err(ThresholdError::NoData);
    }

    struct Curve {
        fp: Vec<f64>,
        tp: Vec<f64>,
        fnn: Vec<f64>,
        thr: Vec<f64>,
    }

    let mut pos_curves: HashMap<String, Curve> = HashMap::new();
    let mut neg_curves: HashMap<String, Curve> = HashMap::new();
    let (mut pos_min, mut pos_max) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut neg_min, mut neg_max) = (f64::INFINITY, f64::NEG_INFINITY);

    for bucket in used_buckets {
        let key = bucket.key();
        let (y_true, y_score) = gather_bucket(labels, scores, filters, &key, false)?;

        let (mut pos_true, mut pos_score) = (Vec::new(), Vec::new());
        let (mut neg_true, mut neg_score) = (Vec::new(), Vec::new());
        for (&lbl, &sc) in y_true.iter().zip(y_score.iter()) {
            if sc < 0.0 {
                neg_true.push(lbl);
                neg_score.push(-sc);
            } else {
                pos_true.push(lbl);
                pos_score.push(sc);
            }
        }

        let build_curve = |true_v: &[bool], score_v: &[f64]| -> Curve {
            if score_v.is_empty() {
                return Curve {
                    fp: vec![0.0],
                    tp: vec![0.0],
                    fnn: vec![0.0],
                    thr: vec![0.0],
                };
            }
            let (fp, tp, thr) = binary_clf_curve(true_v, score_v);
            // `binary_clf_curve` sorts distinct scores ascending, so `tp` is
            // non-decreasing and the total positive count is the *first*
            // entry (lowest threshold, `score >= thr[0]` covers everything),
            // not the last.
            let total_tp = *tp.first().unwrap_or(&0.0);
            let fnn = tp.iter().map(|&t| total_tp - t).collect();
            Curve { fp, tp, fnn, thr }
        };

        let pos_curve = build_curve(&pos_true, &pos_score);
        let neg_curve = build_curve(&neg_true, &neg_score);

        if let (Some(&mn), Some(&mx)) = (pos_curve.thr.first(), pos_curve.thr.last()) {
            pos_min = pos_min.min(mn);
            pos_max = pos_max.max(mx);
        }
        if let (Some(&mn), Some(&mx)) = (neg_curve.thr.first(), neg_curve.thr.last()) {
            neg_min = neg_min.min(mn);
            neg_max = neg_max.max(mx);
        }

        pos_curves.insert(key.clone(), pos_curve);
        neg_curves.insert(key, neg_curve);
    }

    if !pos_min.is_finite() || !neg_min.is_finite() {
        return Err(ThresholdError::NoData);
    }

    let pos_grid = linspace(pos_min, pos_max, interp_len);
    let neg_grid = linspace(neg_min, neg_max, interp_len);
    let mut total_fbeta = vec![vec![0.0_f64; neg_grid.len()]; pos_grid.len()];

    for bucket in used_buckets {
        let key = bucket.key();
        let pos = &pos_curves[&key];
        let neg = &neg_curves[&key];

        let fp_p: Vec<f64> = pos_grid.iter().map(|&g| interp_linear(g, &pos.thr, &pos.fp)).collect();
        let tp_p: Vec<f64> = pos_grid.iter().map(|&g| interp_linear(g, &pos.thr, &pos.tp)).collect();
        let fn_p: Vec<f64> = pos_grid.iter().map(|&g| interp_linear(g, &pos.thr, &pos.fnn)).collect();
        let fp_n: Vec<f64> = neg_grid.iter().map(|&g| interp_linear(g, &neg.thr, &neg.fp)).collect();
        let tp_n: Vec<f64> = neg_grid.iter().map(|&g| interp_linear(g, &neg.thr, &neg.tp)).collect();
        let fn_n: Vec<f64> = neg_grid.iter().map(|&g| interp_linear(g, &neg.thr, &neg.fnn)).collect();

        for (ri, row) in total_fbeta.iter_mut().enumerate() {
            for (ci, cell) in row.iter_mut().enumerate() {
                let fp = fp_p[ri] + fp_n[ci];
                let tp = tp_p[ri] + tp_n[ci];
                let fnn = fn_p[ri] + fn_n[ci];
                let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 1.0 };
                let recall = if tp + fnn > 0.0 { tp / (tp + fnn) } else { 0.0 };
                *cell += f_beta(precision, recall, beta);
            }
        }
    }

    let mut best = (0_usize, 0_usize, f64::NEG_INFINITY);
    for (ri, row) in total_fbeta.iter().enumerate() {
        for (ci, &v) in row.iter().enumerate() {
            if v > best.2 {
                best = (ri, ci, v);
            }
        }
    }

    Ok(ThresholdState::Double {
        tau_minus: -neg_grid[best.1],
        tau_plus: pos_grid[best.0],
    })
}

/// Applies a fitted [`ThresholdState`] to per-station score sequences.
/// No smoothing, no minimum event length (spec.md section 4.4.3).
pub struct Predictor;

impl Predictor {
    pub fn predict(threshold: &ThresholdState, scores: &[ScoreSequence]) -> Vec<Vec<bool>> {
        scores.iter().map(|s| threshold.predict(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::default_cutoffs;

    fn bank(key: &str, mask: Vec<bool>) -> LengthFilterBank {
        let mut m = LengthFilterBank::new();
        m.insert(key.to_string(), mask);
        m
    }

    #[test]
    fn single_threshold_isolates_the_one_outlier() {
        // spec.md scenario 1: only index 50 is anomalous and the scores
        // there dwarf the rest.
        let mut scores = vec![0.1_f64; 100];
        scores[50] = 50.0;
        let mut labels = vec![0_i64; 100];
        labels[50] = 1;

        let bucket = Bucket::new(0, None);
        let key = bucket.key();
        let filter = bank(&key, vec![false; 100]);

        let labels_ref: &[i64] = &labels;
        let scores_ref: &[f64] = &scores;
        let threshold = optimize_single(
            &[labels_ref],
            &[scores_ref],
            &[&filter],
            &[bucket],
            1.5,
            2000,
        )
        .unwrap();

        let predictions = threshold.predict(&scores);
        assert!(predictions[50]);
        assert_eq!(predictions.iter().filter(|&&p| p).count(), 1);
    }

    #[test]
    fn double_threshold_separable_scores_reach_perfect_fbeta() {
        // spec.md scenario 3.
        let scores = vec![-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0];
        let labels: Vec<i64> = vec![1, 1, 0, 0, 0, 1, 1];
        let bucket = Bucket::new(0, None);
        let key = bucket.key();
        let filter = bank(&key, vec![false; 7]);

        let labels_ref: &[i64] = &labels;
        let scores_ref: &[f64] = &scores;
        let threshold = optimize_double(
            &[labels_ref],
            &[scores_ref],
            &[&filter],
            &[bucket],
            1.5,
            2000,
        )
        .unwrap();

        if let ThresholdState::Double { tau_minus, tau_plus } = threshold {
            assert!(tau_minus <= 0.0);
            assert!(tau_plus >= 0.0);
        } else {
            panic!("expected a double threshold");
        }

        let predictions = threshold.predict(&scores);
        let expected = vec![true, true, false, false, false, true, true];
        assert_eq!(predictions, expected);
    }

    #[test]
    fn all_zero_scores_give_zero_fbeta_at_optimum() {
        let scores = vec![0.0_f64; 20];
        let mut labels = vec![0_i64; 20];
        labels[5] = 1;
        labels[15] = 1;
        let bucket = Bucket::new(0, None);
        let key = bucket.key();
        let filter = bank(&key, vec![false; 20]);

        let labels_ref: &[i64] = &labels;
        let scores_ref: &[f64] = &scores;
        let threshold = optimize_single(
            &[labels_ref],
            &[scores_ref],
            &[&filter],
            &[bucket],
            1.5,
            500,
        )
        .unwrap();
        let predictions = threshold.predict(&scores);
        let precision_hits = predictions.iter().zip(labels.iter()).filter(|(&p, &l)| p && l == 1).count();
        // With a single distinct score value, no threshold can separate
        // anomalies from normals: the optimum achieves zero true positives
        // or trivial everything-positive, either way f-beta collapses to 0.
        assert!(precision_hits == 0 || predictions.iter().all(|&p| p));
    }

    #[test]
    fn unknown_bucket_key_is_an_error() {
        let labels: Vec<i64> = vec![0, 1];
        let scores = vec![0.0, 1.0];
        let filter = bank("(0, 24]", vec![false, false]);
        let bad_bucket = Bucket::new(99, Some(100));
        let labels_ref: &[i64] = &labels;
        let scores_ref: &[f64] = &scores;
        let result = optimize_single(
            &[labels_ref],
            &[scores_ref],
            &[&filter],
            &[bad_bucket],
            1.5,
            10,
        );
        assert!(matches!(result, Err(ThresholdError::UnknownBucket(_))));
    }

    #[test]
    fn default_cutoffs_are_usable_bucket_keys() {
        let cutoffs = default_cutoffs();
        assert_eq!(cutoffs.len(), 4);
    }
}
