//! Core data model shared by every stage of the pipeline.
//!
//! See `SPEC_FULL.md` section 3 for the authoritative description of each
//! type's invariants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A raw label code as it appears in the source `y/<station>.csv` files.
///
/// `0` = normal, `1` = anomaly, `5` = uncertain. Any other integer code is
/// remapped into this set by [`crate::preprocessing::PreprocessConfig::label_transform`]
/// before anything downstream sees it.
pub type RawLabel = i64;

/// One station's raw, unaligned input: two parallel signals and a label
/// series, all of length `N`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStation {
    /// Station identifier (file stem of `X/<station_id>.csv`).
    pub station_id: String,
    /// Unix-epoch-seconds timestamps, one per sample.
    pub timestamp: Vec<i64>,
    /// Directly measured load.
    pub s_original: Vec<Option<f64>>,
    /// Bottom-up reconstructed load.
    pub bu_original: Vec<Option<f64>>,
    /// Raw label codes, `None` where unlabeled.
    pub label: Vec<Option<RawLabel>>,
    /// Caller-supplied missing mask, if the source CSV carried one.
    pub missing: Option<Vec<bool>>,
}

impl RawStation {
    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }
}

/// An ordered collection of stations carried together through the pipeline.
///
/// Ordering is load-bearing: the worker pool and the sequential ensemble
/// both depend on result lists being parallel to this order (SPEC_FULL.md
/// section 5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationBatch {
    pub stations: Vec<RawStation>,
}

impl StationBatch {
    pub fn new(stations: Vec<RawStation>) -> Self {
        Self { stations }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

/// One station after preprocessing: aligned, sign-corrected, and with a
/// derived `missing` mask. Every field vector has the same length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessedStation {
    pub station_id: String,
    pub timestamp: Vec<i64>,
    pub s_original: Vec<f64>,
    pub bu_original: Vec<f64>,
    pub diff_original: Vec<f64>,
    /// Possibly sign-flipped measured load.
    pub s: Vec<f64>,
    /// Linearly rescaled bottom-up load: `a * bu_original + b`.
    pub bu: Vec<f64>,
    pub diff: Vec<f64>,
    pub missing: Vec<bool>,
    /// Transformed, possibly-filtered label series (`0`, `1`, or `5`).
    pub label: Vec<RawLabel>,
    /// Linear-fit coefficients applied to `bu_original` to produce `bu`.
    pub fit_a: f64,
    pub fit_b: f64,
}

impl PreprocessedStation {
    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }
}

/// A half-open event-length bucket `(lo, hi]`, with `hi = None` meaning `+inf`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub lo: u64,
    pub hi: Option<u64>,
}

impl Bucket {
    pub fn new(lo: u64, hi: Option<u64>) -> Self {
        Self { lo, hi }
    }

    /// `true` iff `length` falls in `(lo, hi]`.
    pub fn contains(&self, length: u64) -> bool {
        length > self.lo && self.hi.map_or(true, |hi| length <= hi)
    }

    /// Canonical textual key, used both as a `HashMap` key and as the
    /// column name of interpolated tables (SPEC_FULL.md section 6).
    pub fn key(&self) -> String {
        match self.hi {
            Some(hi) => format!("({}, {}]", self.lo, hi),
            None => format!("({}, inf)", self.lo),
        }
    }
}

/// The canonical StormPhase bucket set: `[(0, 24], (24, 288], (288, 4032], (4032, inf)]`.
pub fn default_cutoffs() -> Vec<Bucket> {
    vec![
        Bucket::new(0, Some(24)),
        Bucket::new(24, Some(288)),
        Bucket::new(288, Some(4032)),
        Bucket::new(4032, None),
    ]
}

/// Per-bucket exclusion masks: `length_filter[key][i] == true` means "exclude
/// sample `i` from bucket `key`'s evaluation".
pub type LengthFilterBank = HashMap<String, Vec<bool>>;

/// A per-sample real-valued anomaly score. Never NaN (SPEC_FULL.md section 3).
pub type ScoreSequence = Vec<f64>;

/// A per-sample binary prediction (`0` or `1`, stored as `bool` for clarity).
pub type PredictionSequence = Vec<bool>;

/// The fitted, applicable threshold rule produced by a [`crate::threshold`] optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ThresholdState {
    /// `|score| >= tau`.
    Single { tau: f64 },
    /// `score < tau_minus || score >= tau_plus`, with `tau_minus <= 0 <= tau_plus`.
    Double { tau_minus: f64, tau_plus: f64 },
}

impl ThresholdState {
    /// Apply the rule to one score, producing a prediction.
    pub fn predict_one(&self, score: f64) -> bool {
        match *self {
            ThresholdState::Single { tau } => score.abs() >= tau,
            ThresholdState::Double { tau_minus, tau_plus } => {
                score < tau_minus || score >= tau_plus
            }
        }
    }

    /// Apply the rule to a whole score sequence.
    pub fn predict(&self, scores: &[f64]) -> PredictionSequence {
        scores.iter().map(|&s| self.predict_one(s)).collect()
    }
}

/// The subset of configured buckets a particular engine instance is tuned
/// against.
pub type UsedBuckets = Vec<Bucket>;

/// F-beta default used throughout the system (SPEC_FULL.md glossary).
pub const DEFAULT_BETA: f64 = 1.5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_contains_is_lower_exclusive_upper_inclusive() {
        let b = Bucket::new(0, Some(24));
        assert!(!b.contains(0));
        assert!(b.contains(1));
        assert!(b.contains(24));
        assert!(!b.contains(25));
    }

    #[test]
    fn bucket_unbounded_hi_contains_everything_above_lo() {
        let b = Bucket::new(4032, None);
        assert!(!b.contains(4032));
        assert!(b.contains(4033));
        assert!(b.contains(1_000_000));
    }

    #[test]
    fn bucket_key_renders_tuple_form() {
        assert_eq!(Bucket::new(0, Some(24)).key(), "(0, 24]");
        assert_eq!(Bucket::new(4032, None).key(), "(4032, inf)");
    }

    #[test]
    fn threshold_single_predicts_on_absolute_value() {
        let t = ThresholdState::Single { tau: 2.0 };
        assert!(!t.predict_one(1.5));
        assert!(t.predict_one(-2.0));
        assert!(t.predict_one(2.5));
    }

    #[test]
    fn threshold_double_predicts_outside_band() {
        let t = ThresholdState::Double {
            tau_minus: -2.0,
            tau_plus: 2.0,
        };
        assert!(t.predict_one(-3.0));
        assert!(!t.predict_one(-1.0));
        assert!(!t.predict_one(1.9));
        assert!(t.predict_one(2.0));
    }

    #[test]
    fn default_cutoffs_match_canonical_set() {
        let cutoffs = default_cutoffs();
        assert_eq!(cutoffs.len(), 4);
        assert_eq!(cutoffs[0].key(), "(0, 24]");
        assert_eq!(cutoffs[3].key(), "(4032, inf)");
    }
}
