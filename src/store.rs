//! Content-addressed persistence of fitted engines and cached
//! intermediates (spec.md section 4.6).
//!
//! Grounded in the teacher's `storage::lockfile::ProcessLock` for the
//! careful `std::fs` + `anyhow::Context` error handling style, generalized
//! from a single PID file to a directory tree keyed by
//! `<method_name>/<preprocessing_hash>/<hyperparameter_hash>`. Every write
//! is write-to-temp-then-rename, which is atomic on POSIX filesystems and
//! therefore safe even if two workers converge on the same path with
//! byte-identical state (spec.md section 5).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Bucket, ThresholdState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to rename {from:?} to {to:?}: {source}")]
    Rename { from: PathBuf, to: PathBuf, source: std::io::Error },
    #[error("corrupt model record at {path:?}: {source}")]
    Deserialize { path: PathBuf, source: serde_json::Error },
    #[error("breakpoint past end of signal for station {station_id}: breakpoint {breakpoint} > length {length}")]
    BreakpointConsistency { station_id: String, breakpoint: usize, length: usize },
}

/// SHA-256 of an engine's canonical model string, hex-encoded
/// (spec.md section 4.6).
pub fn hash_model_string(model_string: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_string.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The persisted state of one fitted engine: its optimized threshold, the
/// bucket subset it was tuned against (explicitly preserved across
/// load/re-tune per spec.md section 4.6), and any producer-specific state
/// (breakpoints, segment means, forest parameters, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedRecord {
    pub threshold: Option<ThresholdState>,
    pub used_buckets: Vec<Bucket>,
    pub producer_state: serde_json::Value,
}

/// Filesystem-backed content-addressed store rooted at `base_dir`.
#[derive(Debug, Clone)]
pub struct ModelStore {
    base_dir: PathBuf,
}

impl ModelStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn record_path(&self, method_name: &str, preprocessing_hash: &str, hyperparameter_hash: &str) -> PathBuf {
        self.base_dir
            .join(method_name)
            .join(preprocessing_hash)
            .join(format!("{hyperparameter_hash}.json"))
    }

    /// Load a previously persisted record, if present.
    pub fn load(
        &self,
        method_name: &str,
        preprocessing_hash: &str,
        hyperparameter_hash: &str,
    ) -> Result<Option<FittedRecord>, StoreError> {
        let path = self.record_path(method_name, preprocessing_hash, hyperparameter_hash);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|source| StoreError::Read { path: path.clone(), source })?;
        let record: FittedRecord =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Deserialize { path, source })?;
        tracing::debug!(method = method_name, hash = hyperparameter_hash, "model store hit");
        Ok(Some(record))
    }

    /// Persist `record` atomically: write to a temp file in the same
    /// directory, then rename over the final path.
    pub fn save(
        &self,
        method_name: &str,
        preprocessing_hash: &str,
        hyperparameter_hash: &str,
        record: &FittedRecord,
    ) -> Result<(), StoreError> {
        let path = self.record_path(method_name, preprocessing_hash, hyperparameter_hash);
        let dir = path.parent().expect("record path always has a parent");
        fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir { path: dir.to_path_buf(), source })?;

        let tmp_path = dir.join(format!(".{hyperparameter_hash}.tmp"));
        let bytes = serde_json::to_vec_pretty(record).expect("FittedRecord always serializes");
        fs::write(&tmp_path, &bytes).map_err(|source| StoreError::Write { path: tmp_path.clone(), source })?;
        fs::rename(&tmp_path, &path).map_err(|source| StoreError::Rename {
            from: tmp_path,
            to: path.clone(),
            source,
        })?;

        tracing::debug!(method = method_name, hash = hyperparameter_hash, "model store write");
        Ok(())
    }

    /// Generic JSON intermediate persistence for cached pipeline stages
    /// (preprocessed frames, event lengths, label filters — spec.md
    /// section 6), keyed by an arbitrary relative path under `base_dir`.
    pub fn save_intermediate<T: Serialize>(&self, relative_path: &str, value: &T) -> Result<(), StoreError> {
        let path = self.base_dir.join(relative_path);
        let dir = path.parent().expect("relative_path always has a parent");
        fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir { path: dir.to_path_buf(), source })?;
        let tmp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec(value).expect("intermediate always serializes");
        fs::write(&tmp_path, &bytes).map_err(|source| StoreError::Write { path: tmp_path.clone(), source })?;
        fs::rename(&tmp_path, &path).map_err(|source| StoreError::Rename { from: tmp_path, to: path, source })?;
        Ok(())
    }

    pub fn load_intermediate<T: for<'de> Deserialize<'de>>(&self, relative_path: &str) -> Result<Option<T>, StoreError> {
        let path = self.base_dir.join(relative_path);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|source| StoreError::Read { path: path.clone(), source })?;
        let value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Deserialize { path, source })?;
        Ok(Some(value))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Validate that every segment's end index stays within its station's
/// length (spec.md section 4.5.2's `BreakpointConsistencyError`).
pub fn check_breakpoint_consistency(station_id: &str, breakpoints: &[usize], length: usize) -> Result<(), StoreError> {
    if let Some(&last) = breakpoints.last() {
        if last > length {
            return Err(StoreError::BreakpointConsistency {
                station_id: station_id.to_string(),
                breakpoint: last,
                length,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_sensitive_to_content() {
        let h1 = hash_model_string("a=1;b=2");
        let h2 = hash_model_string("a=1;b=2");
        let h3 = hash_model_string("a=1;b=3");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn round_trip_persists_threshold_and_used_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let record = FittedRecord {
            threshold: Some(ThresholdState::Single { tau: 1.25 }),
            used_buckets: vec![Bucket::new(0, Some(24))],
            producer_state: serde_json::json!({"scale": 2.0}),
        };
        store.save("spc", "preA", "hpB", &record).unwrap();

        let loaded = store.load("spc", "preA", "hpB").unwrap().expect("record should exist");
        assert_eq!(loaded.used_buckets, record.used_buckets);
        match loaded.threshold {
            Some(ThresholdState::Single { tau }) => assert!((tau - 1.25).abs() < 1e-12),
            other => panic!("unexpected threshold: {other:?}"),
        }
    }

    #[test]
    fn missing_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        assert!(store.load("spc", "pre", "hp").unwrap().is_none());
    }

    #[test]
    fn breakpoint_past_end_is_an_error() {
        assert!(check_breakpoint_consistency("s1", &[10, 50], 40).is_err());
        assert!(check_breakpoint_consistency("s1", &[10, 40], 40).is_ok());
    }
}
