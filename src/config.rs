//! Run-wide configuration: preprocessing hyperparameters, the cutoff
//! bucket list, F-beta parameters, interpolation grid length, worker-pool
//! size, and per-engine default hyperparameter structs.
//!
//! Mirrors the teacher's `config::{init, get}` `OnceLock`-backed global
//! pattern (`well_config.rs`), generalized from a single `well_config.toml`
//! to `stormphase.toml`, with the same `SP_CONFIG`-env-var /
//! current-directory-file / built-in-defaults loading order.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engines::arima::ArimaConfig;
use crate::engines::binary_segmentation::BinsegConfig;
use crate::engines::isolation_forest::IsolationForestConfig;
use crate::engines::sarimax::SarimaxConfig;
use crate::engines::spc::SpcConfig;
use crate::preprocessing::PreprocessConfig;
use crate::types::{default_cutoffs, Bucket, DEFAULT_BETA};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

/// Run-wide configuration (SPEC_FULL.md section 2.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub preprocessing: PreprocessConfig,
    /// The cutoff bucket list every length-filter bank and threshold
    /// optimizer is evaluated against (spec.md section 6's canonical set).
    #[serde(default = "default_cutoffs")]
    pub cutoffs: Vec<Bucket>,
    /// Default F-beta parameter (spec.md glossary: `beta = 1.5`).
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_interp_len")]
    pub interp_len: usize,
    /// Bounded worker-pool size for per-station fits (spec.md section 5,
    /// default 32).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Uncertain label codes excluded from every bucket (spec.md section 2).
    #[serde(default = "default_uncertain_codes")]
    pub uncertain_codes: Vec<i64>,
    /// Exclude `missing`-flagged samples from length-filter banks.
    #[serde(default)]
    pub remove_missing: bool,

    #[serde(default)]
    pub spc: SpcConfig,
    #[serde(default)]
    pub isolation_forest: IsolationForestConfig,
    #[serde(default)]
    pub arima: ArimaConfig,
    #[serde(default)]
    pub iterative_arima: crate::engines::arima::IterativeArimaConfig,
    #[serde(default)]
    pub sarimax: SarimaxConfig,
    #[serde(default)]
    pub binary_segmentation: BinsegConfig,

    /// Filesystem root for the content-addressed model store and cached
    /// intermediates (spec.md section 6).
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_beta() -> f64 {
    DEFAULT_BETA
}

fn default_interp_len() -> usize {
    crate::threshold::DEFAULT_INTERP_LEN
}

fn default_max_workers() -> usize {
    32
}

fn default_uncertain_codes() -> Vec<i64> {
    vec![5]
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("stormphase_store")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            preprocessing: PreprocessConfig::default(),
            cutoffs: default_cutoffs(),
            beta: default_beta(),
            interp_len: default_interp_len(),
            max_workers: default_max_workers(),
            uncertain_codes: default_uncertain_codes(),
            remove_missing: false,
            spc: SpcConfig::default(),
            isolation_forest: IsolationForestConfig::default(),
            arima: ArimaConfig::default(),
            iterative_arima: crate::engines::arima::IterativeArimaConfig::default(),
            sarimax: SarimaxConfig::default(),
            binary_segmentation: BinsegConfig::default(),
            store_dir: default_store_dir(),
        }
    }
}

impl RunConfig {
    /// Load order (SPEC_FULL.md section 2.3): `SP_CONFIG` env var, then
    /// `stormphase.toml` in the working directory, then built-in defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SP_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        tracing::info!(path = %p.display(), "loaded RunConfig from SP_CONFIG");
                        return config;
                    }
                    Err(err) => {
                        tracing::warn!(path = %p.display(), error = %err, "failed to load SP_CONFIG, falling back");
                    }
                }
            } else {
                tracing::warn!(path = %path, "SP_CONFIG points to a non-existent file, falling back");
            }
        }

        let local = PathBuf::from("stormphase.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    tracing::info!("loaded RunConfig from ./stormphase.toml");
                    return config;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to load ./stormphase.toml, using defaults");
                }
            }
        }

        tracing::info!("no stormphase.toml found — using built-in defaults");
        Self::default()
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

/// Global run configuration, initialized once at startup (mirrors the
/// teacher's `config::init`/`config::get`).
static RUN_CONFIG: OnceLock<RunConfig> = OnceLock::new();

/// Initialize the global run configuration. Must be called at most once;
/// subsequent calls are ignored with a warning.
pub fn init(config: RunConfig) {
    if RUN_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Fetch the global run configuration.
///
/// Panics if `init()` has not been called — a missing config is a fatal
/// startup error, not a recoverable one.
pub fn get() -> &'static RunConfig {
    RUN_CONFIG.get().expect("config::get() called before config::init() — this is a startup bug")
}

pub fn is_initialized() -> bool {
    RUN_CONFIG.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_canonical_cutoffs_and_beta() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.cutoffs.len(), 4);
        assert!((cfg.beta - 1.5).abs() < 1e-12);
        assert_eq!(cfg.max_workers, 32);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = RunConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let parsed: RunConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.cutoffs.len(), cfg.cutoffs.len());
        assert_eq!(parsed.max_workers, cfg.max_workers);
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid = [").unwrap();
        assert!(matches!(RunConfig::load_from_file(&path), Err(ConfigError::Parse(_, _))));
    }
}
