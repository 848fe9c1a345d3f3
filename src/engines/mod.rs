//! Scoring engines: transform a preprocessed signal into a per-sample
//! anomaly score.
//!
//! Per SPEC_FULL.md's "Multiple mixin composition" design note, an engine
//! is explicit composition rather than diamond inheritance: a
//! [`ScoreProducer`] (the algorithm-specific part — SPC, isolation forest,
//! ARIMA family, binary segmentation) is paired with a threshold strategy
//! and driven by [`Engine`], which owns the fit/predict lifecycle and
//! threshold state. Concrete engine types (`SingleThresholdSpc`, …) are
//! thin type aliases over `Engine<P>`.

pub mod arima;
pub mod binary_segmentation;
pub mod isolation_forest;
pub mod sarimax;
pub mod spc;

use thiserror::Error;

use crate::types::{Bucket, LengthFilterBank, PredictionSequence, PreprocessedStation, RawLabel, ScoreSequence, ThresholdState};
use crate::{store::ModelStore, threshold};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("station {station_id}: {reason}")]
    Data { station_id: String, reason: String },
    #[error("engine has not been fit yet")]
    NotFitted,
    #[error(transparent)]
    Threshold(#[from] threshold::ThresholdError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// The algorithm-specific half of a scoring engine: turns a batch of
/// preprocessed stations into one score sequence per station. Implementors
/// own their hyperparameters and compute their own model string.
pub trait ScoreProducer: Send + Sync {
    /// Stable method name, used as the model-store path component.
    fn method_name(&self) -> &'static str;

    /// A stable, ordered textual rendering of this producer's
    /// hyperparameters, used as the input to the model-store's SHA-256
    /// hash (spec.md section 4.6).
    fn model_string(&self) -> String;

    /// Fit (where applicable) and score every station in `batch`.
    fn fit_transform(&mut self, batch: &[PreprocessedStation]) -> Result<Vec<ScoreSequence>, EngineError>;

    /// Score `batch` using already-fitted state, without refitting.
    fn transform(&self, batch: &[PreprocessedStation]) -> Result<Vec<ScoreSequence>, EngineError>;

    /// Serialize fitted state for the model store. Default: no extra
    /// state beyond hyperparameters (stateless producers like SPC).
    fn save_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Restore fitted state previously returned by `save_state`.
    fn load_state(&mut self, _state: &serde_json::Value) {}
}

/// Extra surface a segmentation-style producer exposes so
/// [`crate::ensemble::SequentialEnsemble`] can route non-anomalous segments
/// to a downstream detector (spec.md section 4.5.2; SPEC_FULL.md's
/// "Ensembles over engines" design note).
pub trait SegmentationProducer: ScoreProducer {
    /// Per-station strictly increasing breakpoint list, ending at the
    /// station length.
    fn breakpoints_per_station(&self) -> &[Vec<usize>];
    /// Per-station, per-segment mean values, parallel to the breakpoints.
    fn segment_means_per_station(&self) -> &[Vec<f64>];
}

/// Which threshold rule an [`Engine`] optimizes and predicts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Single,
    Double,
}

/// The uniform output every engine (and, by extension, every ensemble)
/// produces (spec.md section 2's `ScoringEngine` contract).
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub scores: Vec<ScoreSequence>,
    pub predictions: Vec<PredictionSequence>,
    pub threshold: ThresholdState,
}

/// Composition of a [`ScoreProducer`] with a threshold strategy, bucket
/// subset, and F-beta parameter. This is the concrete shape behind every
/// `SingleThreshold*`/`DoubleThreshold*` engine named in spec.md section 4.3.
pub struct Engine<P: ScoreProducer> {
    pub producer: P,
    pub threshold_kind: ThresholdKind,
    pub used_buckets: Vec<Bucket>,
    pub beta: f64,
    pub interp_len: usize,
    pub threshold: Option<ThresholdState>,
}

impl<P: ScoreProducer> Engine<P> {
    pub fn new(producer: P, threshold_kind: ThresholdKind, used_buckets: Vec<Bucket>, beta: f64) -> Self {
        Self {
            producer,
            threshold_kind,
            used_buckets,
            beta,
            interp_len: threshold::DEFAULT_INTERP_LEN,
            threshold: None,
        }
    }

    pub fn method_name(&self) -> &'static str {
        self.producer.method_name()
    }

    pub fn model_string(&self) -> String {
        format!(
            "{};threshold_kind={:?};used_buckets={};beta={}",
            self.producer.model_string(),
            self.threshold_kind,
            self.used_buckets.iter().map(Bucket::key).collect::<Vec<_>>().join(","),
            self.beta
        )
    }

    fn optimize(
        &self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
        scores: &[ScoreSequence],
    ) -> Result<ThresholdState, EngineError> {
        let labels: Vec<&[RawLabel]> = batch.iter().map(|s| s.label.as_slice()).collect();
        let score_slices: Vec<&[f64]> = scores.iter().map(Vec::as_slice).collect();
        let filter_refs: Vec<&LengthFilterBank> = filters.iter().collect();
        let threshold = match self.threshold_kind {
            ThresholdKind::Single => threshold::optimize_single(
                &labels,
                &score_slices,
                &filter_refs,
                &self.used_buckets,
                self.beta,
                self.interp_len,
            )?,
            ThresholdKind::Double => threshold::optimize_double(
                &labels,
                &score_slices,
                &filter_refs,
                &self.used_buckets,
                self.beta,
                self.interp_len,
            )?,
        };
        Ok(threshold)
    }

    /// Fit the producer, optimize the threshold against `filters`, and
    /// predict (spec.md section 4.3's `fit_transform_predict`).
    pub fn fit_transform_predict(
        &mut self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
    ) -> Result<EngineOutput, EngineError> {
        let scores = self.producer.fit_transform(batch)?;
        let threshold = self.optimize(batch, filters, &scores)?;
        let predictions = threshold::Predictor::predict(&threshold, &scores);
        self.threshold = Some(threshold);
        Ok(EngineOutput { scores, predictions, threshold })
    }

    /// Score and predict `batch` using a previously fitted threshold.
    pub fn transform_predict(&self, batch: &[PreprocessedStation]) -> Result<EngineOutput, EngineError> {
        let threshold = self.threshold.ok_or(EngineError::NotFitted)?;
        let scores = self.producer.transform(batch)?;
        let predictions = threshold::Predictor::predict(&threshold, &scores);
        Ok(EngineOutput { scores, predictions, threshold })
    }

    /// Persist fitted state (threshold + producer state + used buckets) to
    /// a [`ModelStore`], or reload it if already present for this
    /// hyperparameter hash (spec.md section 4.6).
    pub fn sync_with_store(&mut self, store: &ModelStore, preprocessing_hash: &str) -> Result<bool, EngineError> {
        let hp_hash = crate::store::hash_model_string(&self.model_string());
        if let Some(record) = store.load(self.method_name(), preprocessing_hash, &hp_hash)? {
            self.threshold = record.threshold;
            self.used_buckets = record.used_buckets;
            self.producer.load_state(&record.producer_state);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn save_to_store(&self, store: &ModelStore, preprocessing_hash: &str) -> Result<(), EngineError> {
        let hp_hash = crate::store::hash_model_string(&self.model_string());
        let record = crate::store::FittedRecord {
            threshold: self.threshold,
            used_buckets: self.used_buckets.clone(),
            producer_state: self.producer.save_state(),
        };
        store.save(self.method_name(), preprocessing_hash, &hp_hash, &record)?;
        Ok(())
    }
}

/// Object-safe facade over `Engine<P>` so an ensemble can hold a
/// heterogeneous collection of fitted engines behind one `Vec<Box<dyn
/// FittedEngine>>` (spec.md section 4.5, REDESIGN FLAGS' "Ensembles over
/// engines" note). `Engine<P>`'s own methods stay generic for callers that
/// know their concrete producer; this trait exists purely for the
/// ensemble layer.
pub trait FittedEngine: Send + Sync {
    fn method_name(&self) -> &'static str;
    fn model_string(&self) -> String;
    fn fit_transform_predict(
        &mut self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
    ) -> Result<EngineOutput, EngineError>;
    fn transform_predict(&self, batch: &[PreprocessedStation]) -> Result<EngineOutput, EngineError>;
    fn sync_with_store(&mut self, store: &ModelStore, preprocessing_hash: &str) -> Result<bool, EngineError>;
    fn save_to_store(&self, store: &ModelStore, preprocessing_hash: &str) -> Result<(), EngineError>;
    /// The bucket subset this engine is currently tuned against
    /// ([`NaiveStackEnsemble`](crate::ensemble::NaiveStackEnsemble) checks
    /// this is the full cutoff set).
    fn used_buckets(&self) -> Vec<Bucket>;
}

impl<P: ScoreProducer> FittedEngine for Engine<P> {
    fn method_name(&self) -> &'static str {
        Engine::method_name(self)
    }

    fn model_string(&self) -> String {
        Engine::model_string(self)
    }

    fn fit_transform_predict(
        &mut self,
        batch: &[PreprocessedStation],
        filters: &[LengthFilterBank],
    ) -> Result<EngineOutput, EngineError> {
        Engine::fit_transform_predict(self, batch, filters)
    }

    fn transform_predict(&self, batch: &[PreprocessedStation]) -> Result<EngineOutput, EngineError> {
        Engine::transform_predict(self, batch)
    }

    fn sync_with_store(&mut self, store: &ModelStore, preprocessing_hash: &str) -> Result<bool, EngineError> {
        Engine::sync_with_store(self, store, preprocessing_hash)
    }

    fn save_to_store(&self, store: &ModelStore, preprocessing_hash: &str) -> Result<(), EngineError> {
        Engine::save_to_store(self, store, preprocessing_hash)
    }

    fn used_buckets(&self) -> Vec<Bucket> {
        self.used_buckets.clone()
    }
}

/// Extra surface a fitted segmentation engine exposes so
/// [`crate::ensemble::SequentialEnsemble`] can route non-anomalous segments
/// to a downstream detector (spec.md section 4.5.2).
pub trait FittedSegmentationEngine: FittedEngine {
    fn breakpoints_per_station(&self) -> Vec<Vec<usize>>;
    fn segment_means_per_station(&self) -> Vec<Vec<f64>>;
    fn fitted_threshold(&self) -> Option<ThresholdState>;
}

impl<P: SegmentationProducer> FittedSegmentationEngine for Engine<P> {
    fn breakpoints_per_station(&self) -> Vec<Vec<usize>> {
        self.producer.breakpoints_per_station().to_vec()
    }

    fn segment_means_per_station(&self) -> Vec<Vec<f64>> {
        self.producer.segment_means_per_station().to_vec()
    }

    fn fitted_threshold(&self) -> Option<ThresholdState> {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::spc::{SpcConfig, SpcProducer};
    use crate::types::{default_cutoffs, RawLabel};

    fn station(diff: Vec<f64>, label: Vec<RawLabel>) -> PreprocessedStation {
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
            label,
            fit_a: 1.0,
            fit_b: 0.0,
        }
    }

    fn no_filter(n: usize) -> LengthFilterBank {
        default_cutoffs().into_iter().map(|b| (b.key(), vec![false; n])).collect()
    }

    /// Persistence round trip (spec.md section 4.6): fit, persist, discard
    /// in-memory state, reload from the store, and confirm `transform_predict`
    /// on the same batch reproduces the pre-persist output exactly.
    #[test]
    fn sync_with_store_reproduces_fit_transform_predict_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());

        let diff: Vec<f64> = (0..40).map(|i| (i as f64 * 0.3).sin() * 3.0).collect();
        let labels = vec![0; 40];
        let batch = vec![station(diff, labels)];
        let filters = vec![no_filter(40)];

        let mut engine = Engine::new(SpcProducer::new(SpcConfig::default()), ThresholdKind::Single, default_cutoffs(), 1.5);
        let fitted_output = engine.fit_transform_predict(&batch, &filters).unwrap();
        engine.save_to_store(&store, "pre-hash").unwrap();

        let mut reloaded = Engine::new(SpcProducer::new(SpcConfig::default()), ThresholdKind::Single, default_cutoffs(), 1.5);
        let hit = reloaded.sync_with_store(&store, "pre-hash").unwrap();
        assert!(hit, "model store should have the record we just saved");

        let reloaded_output = reloaded.transform_predict(&batch).unwrap();
        assert_eq!(reloaded_output.threshold, fitted_output.threshold);
        assert_eq!(reloaded_output.predictions, fitted_output.predictions);
        for (a, b) in reloaded_output.scores.iter().zip(&fitted_output.scores) {
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }
}
