//! Ensembles over engines (spec.md section 4.5).
//!
//! Per the "Ensembles over engines" redesign note, engines and ensembles
//! share a uniform interface: [`crate::engines::FittedEngine`] is the
//! object-safe facade that lets [`StackEnsemble`]/[`SequentialEnsemble`]
//! hold a `Vec<Box<dyn FittedEngine>>` instead of a generic parameter per
//! engine. `SequentialEnsemble` additionally needs a segmentation engine's
//! breakpoints and segment means, which [`crate::engines::FittedSegmentationEngine`]
//! exposes as a sub-trait.

use std::collections::HashMap;

use thiserror::Error;

use crate::engines::{EngineError, FittedEngine, FittedSegmentationEngine};
use crate::store;
use crate::types::{Bucket, LengthFilterBank, PredictionSequence, PreprocessedStation, ScoreSequence};

#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

/// Column-wise concatenation of every sub-engine's scores, alongside the
/// element-wise logical OR of their predictions (spec.md section 4.5.1).
#[derive(Debug, Clone)]
pub struct StackOutput {
    /// `scores[station][sample]` is one row per sample, one column per
    /// engine, in `engines` order.
    pub scores: Vec<Vec<Vec<f64>>>,
    pub predictions: Vec<PredictionSequence>,
}

fn combine_stack(
    n_stations: usize,
    per_engine_scores: &[Vec<ScoreSequence>],
    per_engine_predictions: &[Vec<PredictionSequence>],
) -> StackOutput {
    let mut scores = Vec::with_capacity(n_stations);
    let mut predictions = Vec::with_capacity(n_stations);

    for station_idx in 0..n_stations {
        let station_len = per_engine_scores[0][station_idx].len();

        let mut station_scores = Vec::with_capacity(station_len);
        for sample_idx in 0..station_len {
            station_scores.push(
                per_engine_scores
                    .iter()
                    .map(|engine_scores| engine_scores[station_idx][sample_idx])
                    .collect(),
            );
        }
        scores.push(station_scores);

        let mut station_predictions = vec![false; station_len];
        for engine_predictions in per_engine_predictions {
            for (i, &p) in engine_predictions[station_idx].iter().enumerate() {
                station_predictions[i] |= p;
            }
        }
        predictions.push(station_predictions);
    }

    StackOutput { scores, predictions }
}

/// Holds an ordered list of independently fit-transform-predicted engines,
/// each with its own `used_buckets`, combined by column concatenation of
/// scores and logical OR of predictions (spec.md section 4.5.1).
pub struct StackEnsemble {
    pub engines: Vec<Box<dyn FittedEngine>>,
}

impl StackEnsemble {
    pub fn new(engines: Vec<Box<dyn FittedEngine>>) -> Self {
        Self { engines }
    }

    pub fn fit_transform_predict(
        &mut self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
    ) -> Result<StackOutput, EnsembleError> {
        let mut per_engine_scores = Vec::with_capacity(self.engines.len());
        let mut per_engine_predictions = Vec::with_capacity(self.engines.len());
        for engine in &mut self.engines {
            let output = engine.fit_transform_predict(batch, filters)?;
            per_engine_scores.push(output.scores);
            per_engine_predictions.push(output.predictions);
        }
        Ok(combine_stack(batch.len(), &per_engine_scores, &per_engine_predictions))
    }

    pub fn transform_predict(&self, batch: &[PreprocessedStation]) -> Result<StackOutput, EnsembleError> {
        let mut per_engine_scores = Vec::with_capacity(self.engines.len());
        let mut per_engine_predictions = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            let output = engine.transform_predict(batch)?;
            per_engine_scores.push(output.scores);
            per_engine_predictions.push(output.predictions);
        }
        Ok(combine_stack(batch.len(), &per_engine_scores, &per_engine_predictions))
    }
}

/// The same combination rule as [`StackEnsemble`], with every sub-engine's
/// `used_buckets` pinned to the full cutoff set (spec.md section 4.5.1). The
/// pinning itself happens at engine-construction time; this wrapper only
/// verifies it and warns (rather than failing the run) if a caller wired an
/// engine up with a narrower bucket subset.
pub struct NaiveStackEnsemble {
    inner: StackEnsemble,
}

impl NaiveStackEnsemble {
    pub fn new(engines: Vec<Box<dyn FittedEngine>>, full_cutoffs: &[Bucket]) -> Self {
        for engine in &engines {
            if engine.used_buckets() != full_cutoffs {
                tracing::warn!(
                    method = engine.method_name(),
                    "NaiveStackEnsemble engine was constructed with a used_buckets subset narrower than the full cutoff set"
                );
            }
        }
        Self { inner: StackEnsemble::new(engines) }
    }

    pub fn fit_transform_predict(
        &mut self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
    ) -> Result<StackOutput, EnsembleError> {
        self.inner.fit_transform_predict(batch, filters)
    }

    pub fn transform_predict(&self, batch: &[PreprocessedStation]) -> Result<StackOutput, EnsembleError> {
        self.inner.transform_predict(batch)
    }
}

/// The result of a [`SequentialEnsemble`] pass: a single combined score and
/// prediction column per station (segments the segmentation engine flagged
/// anomalous keep its own score/prediction; the rest carry the downstream
/// detector's), plus the `(station_idx, begin, end)` origin of every
/// segment handed to the detector.
#[derive(Debug, Clone)]
pub struct SequentialOutput {
    pub scores: Vec<ScoreSequence>,
    pub predictions: Vec<PredictionSequence>,
    pub segment_origins: Vec<(usize, usize, usize)>,
}

fn slice_station(station: &PreprocessedStation, begin: usize, end: usize, seg_idx: usize) -> PreprocessedStation {
    PreprocessedStation {
        station_id: format!("{}::seg{seg_idx}", station.station_id),
        timestamp: station.timestamp[begin..end].to_vec(),
        s_original: station.s_original[begin..end].to_vec(),
        bu_original: station.bu_original[begin..end].to_vec(),
        diff_original: station.diff_original[begin..end].to_vec(),
        s: station.s[begin..end].to_vec(),
        bu: station.bu[begin..end].to_vec(),
        diff: station.diff[begin..end].to_vec(),
        missing: station.missing[begin..end].to_vec(),
        label: station.label[begin..end].to_vec(),
        fit_a: station.fit_a,
        fit_b: station.fit_b,
    }
}

fn slice_filters(filters: &LengthFilterBank, begin: usize, end: usize) -> LengthFilterBank {
    filters
        .iter()
        .map(|(key, mask)| (key.clone(), mask[begin..end].to_vec()))
        .collect::<HashMap<_, _>>()
}

/// Two engines — a segmentation engine `Seg` and an anomaly detector `AD`
/// (spec.md section 4.5.2). `Seg` first splits every station into
/// breakpoint-delimited segments; segments whose mean `Seg`'s own threshold
/// flags as anomalous keep `Seg`'s score and prediction, while the rest are
/// flattened across stations and re-scored by `AD`.
pub struct SequentialEnsemble {
    pub seg: Box<dyn FittedSegmentationEngine>,
    pub ad: Box<dyn FittedEngine>,
}

impl SequentialEnsemble {
    pub fn new(seg: Box<dyn FittedSegmentationEngine>, ad: Box<dyn FittedEngine>) -> Self {
        Self { seg, ad }
    }

    /// Partition every station's segments into "keep Seg's own prediction"
    /// (anomalous, per Seg's threshold) vs. "hand to AD" (not anomalous),
    /// recording origins for the latter.
    fn plan_segments(
        batch: &[PreprocessedStation],
        breakpoints: &[Vec<usize>],
        means: &[Vec<f64>],
        threshold: crate::types::ThresholdState,
    ) -> Result<(Vec<PreprocessedStation>, Vec<(usize, usize, usize)>), EnsembleError> {
        let mut ad_stations = Vec::new();
        let mut origins = Vec::new();

        for (station_idx, station) in batch.iter().enumerate() {
            let bkps = &breakpoints[station_idx];
            store::check_breakpoint_consistency(&station.station_id, bkps, station.len())?;

            let segment_means = &means[station_idx];
            let mut prev = 0usize;
            for (seg_idx, &bkp) in bkps.iter().enumerate() {
                let mean = segment_means.get(seg_idx).copied().unwrap_or(0.0);
                if !threshold.predict_one(mean) {
                    ad_stations.push(slice_station(station, prev, bkp, seg_idx));
                    origins.push((station_idx, prev, bkp));
                }
                prev = bkp;
            }
        }

        Ok((ad_stations, origins))
    }

    fn splice_ad_output(
        mut final_scores: Vec<ScoreSequence>,
        mut final_predictions: Vec<PredictionSequence>,
        origins: &[(usize, usize, usize)],
        ad_scores: &[ScoreSequence],
        ad_predictions: &[PredictionSequence],
    ) -> (Vec<ScoreSequence>, Vec<PredictionSequence>) {
        for (seg_idx, &(station_idx, begin, end)) in origins.iter().enumerate() {
            final_scores[station_idx][begin..end].copy_from_slice(&ad_scores[seg_idx]);
            final_predictions[station_idx][begin..end].copy_from_slice(&ad_predictions[seg_idx]);
        }
        (final_scores, final_predictions)
    }

    pub fn fit_transform_predict(
        &mut self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
    ) -> Result<SequentialOutput, EnsembleError> {
        let seg_output = self.seg.fit_transform_predict(batch, filters)?;
        let threshold = seg_output.threshold;
        let breakpoints = self.seg.breakpoints_per_station();
        let means = self.seg.segment_means_per_station();

        let (ad_stations, origins) = Self::plan_segments(batch, &breakpoints, &means, threshold)?;

        let (final_scores, final_predictions) = if ad_stations.is_empty() {
            (seg_output.scores, seg_output.predictions)
        } else {
            let ad_filters: Vec<LengthFilterBank> = origins
                .iter()
                .map(|&(station_idx, begin, end)| slice_filters(&filters[station_idx], begin, end))
                .collect();
            let ad_output = self.ad.fit_transform_predict(&ad_stations, &ad_filters)?;
            Self::splice_ad_output(seg_output.scores, seg_output.predictions, &origins, &ad_output.scores, &ad_output.predictions)
        };

        Ok(SequentialOutput { scores: final_scores, predictions: final_predictions, segment_origins: origins })
    }

    /// Re-score `batch` using previously fitted `Seg`/`AD` state. Assumes
    /// `batch` has the same per-station shape as the batch `Seg` was last
    /// fit on, since `Seg`'s breakpoints and segment means are not
    /// recomputed here.
    pub fn transform_predict(&self, batch: &[PreprocessedStation]) -> Result<SequentialOutput, EnsembleError> {
        let seg_output = self.seg.transform_predict(batch)?;
        let threshold = self.seg.fitted_threshold().ok_or(EngineError::NotFitted)?;
        let breakpoints = self.seg.breakpoints_per_station();
        let means = self.seg.segment_means_per_station();

        let (ad_stations, origins) = Self::plan_segments(batch, &breakpoints, &means, threshold)?;

        let (final_scores, final_predictions) = if ad_stations.is_empty() {
            (seg_output.scores, seg_output.predictions)
        } else {
            let ad_output = self.ad.transform_predict(&ad_stations)?;
            Self::splice_ad_output(seg_output.scores, seg_output.predictions, &origins, &ad_output.scores, &ad_output.predictions)
        };

        Ok(SequentialOutput { scores: final_scores, predictions: final_predictions, segment_origins: origins })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::spc::{SpcConfig, SpcProducer};
    use crate::engines::{Engine, ThresholdKind};
    use crate::types::{default_cutoffs, RawLabel};

    fn station(id: &str, diff: Vec<f64>, label: Vec<RawLabel>) -> PreprocessedStation {
        let n = diff.len();
        PreprocessedStation {
            station_id: id.into(),
            timestamp: (0..n as i64).collect(),
            s_original: vec![0.0; n],
            bu_original: vec![0.0; n],
            diff_original: diff.clone(),
            s: vec![0.0; n],
            bu: vec![0.0; n],
            diff,
            missing: vec![false; n],
            label,
            fit_a: 1.0,
            fit_b: 0.0,
        }
    }

    fn no_filter(n: usize) -> LengthFilterBank {
        default_cutoffs().into_iter().map(|b| (b.key(), vec![false; n])).collect()
    }

    #[test]
    fn stack_ensemble_combines_scores_by_column_and_predictions_by_or() {
        let labels = vec![0, 1, 0, 0];
        let n = labels.len();
        let s1 = station("s1", vec![0.0, 10.0, 0.0, 0.0], labels.clone());
        let s2 = station("s1", vec![0.0, 10.0, 0.0, 0.0], labels);
        let batch = vec![s1, s2];
        let filters = vec![no_filter(n), no_filter(n)];

        let engine_a: Box<dyn FittedEngine> = Box::new(Engine::new(
            SpcProducer::new(SpcConfig::default()),
            ThresholdKind::Single,
            default_cutoffs(),
            1.5,
        ));
        let engine_b: Box<dyn FittedEngine> = Box::new(Engine::new(
            SpcProducer::new(SpcConfig::default()),
            ThresholdKind::Single,
            default_cutoffs(),
            1.5,
        ));

        let mut ensemble = StackEnsemble::new(vec![engine_a, engine_b]);
        let output = ensemble.fit_transform_predict(&batch, &filters).unwrap();

        assert_eq!(output.scores.len(), 2);
        assert_eq!(output.scores[0][0].len(), 2, "one column per engine");
        assert_eq!(output.predictions[0].len(), n);
    }

    #[test]
    fn naive_stack_ensemble_warns_but_does_not_fail_on_mismatched_buckets() {
        let narrow = vec![default_cutoffs()[0]];
        let engine: Box<dyn FittedEngine> =
            Box::new(Engine::new(SpcProducer::new(SpcConfig::default()), ThresholdKind::Single, narrow, 1.5));
        // Should not panic even though the engine's buckets differ from the full set.
        let _ensemble = NaiveStackEnsemble::new(vec![engine], &default_cutoffs());
    }
}
