//! StormPhase: anomaly detection for paired substation load time series.
//!
//! ## Architecture
//!
//! Data flows in one direction through four layers:
//!
//! ```text
//! raw (S, BU, label) -> Preprocessor -> ScoringEngine -> ThresholdOptimizer -> Predictor -> Ensemble (opt.)
//! ```
//!
//! - [`preprocessing`]: robust alignment of `S`/`BU`, staleness masking, event-length bucketing.
//! - [`engines`]: SPC, isolation forest, ARIMA/SARIMAX (+ iterative variant), binary segmentation.
//! - [`threshold`]: single- and double-threshold optimization against bucketed F-beta.
//! - [`ensemble`]: stacking and sequential (segment-then-detect) combination of engines.
//! - [`store`]: content-addressed persistence of fitted engines and intermediates.

pub mod concurrency;
pub mod config;
pub mod ensemble;
pub mod engines;
pub mod event_length;
pub mod io;
pub mod linalg;
pub mod preprocessing;
pub mod stats;
pub mod store;
pub mod threshold;
pub mod types;

pub use config::RunConfig;
pub use types::{
    Bucket, LengthFilterBank, PreprocessedStation, RawStation, ScoreSequence, StationBatch,
    ThresholdState,
};
