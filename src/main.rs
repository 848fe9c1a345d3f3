//! `stormphase` command-line driver.
//!
//! Spec.md section 6 leaves the CLI out of scope ("any driver may call the
//! core library with the above inputs and inspect the above outputs"); this
//! binary is one such driver, wired the way the teacher's `main.rs` wires
//! its own: `clap` for arguments, `tracing_subscriber` for logging, then a
//! straight-line call into the library.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use stormphase::config::{self, RunConfig};
use stormphase::engines::arima::{BasicArimaProducer, IterativeArimaProducer};
use stormphase::engines::binary_segmentation::BinsegProducer;
use stormphase::engines::isolation_forest::IsolationForestProducer;
use stormphase::engines::sarimax::SarimaxProducer;
use stormphase::engines::spc::SpcProducer;
use stormphase::engines::{Engine, FittedEngine, FittedSegmentationEngine, ThresholdKind};
use stormphase::ensemble::{NaiveStackEnsemble, SequentialEnsemble, StackEnsemble};
use stormphase::{concurrency, io, preprocessing, store};

#[derive(Parser, Debug)]
#[command(name = "stormphase")]
#[command(about = "Substation electrical-load anomaly detection pipeline")]
#[command(version)]
struct CliArgs {
    /// Directory containing `X/` and `y/` station CSV pairs.
    #[arg(long, value_name = "DIR")]
    data_dir: PathBuf,

    /// Which scoring engine to run.
    #[arg(long, value_enum)]
    engine: EngineChoice,

    /// Optional ensemble to wrap the chosen engine in. `sequential` uses a
    /// binary-segmentation engine as `Seg` and the chosen `--engine` as `AD`;
    /// `stack`/`naive-stack` additionally run an SPC engine alongside it.
    #[arg(long, value_enum)]
    ensemble: Option<EnsembleChoice>,

    /// Threshold strategy for the chosen engine (and, for ensembles, the
    /// `AD`/SPC sub-engines).
    #[arg(long, value_enum, default_value = "single")]
    threshold: ThresholdChoice,

    /// Path to a `stormphase.toml`-shaped config file. Overrides `SP_CONFIG`
    /// and the default search path.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Re-fit even if a matching model-store record already exists.
    #[arg(long)]
    overwrite: bool,

    /// Run the full pipeline but skip writing results/model-store records.
    #[arg(long)]
    dry_run: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "kebab-case")]
enum EngineChoice {
    Spc,
    IsolationForest,
    Arima,
    IterativeArima,
    Sarimax,
    Binseg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "kebab-case")]
enum EnsembleChoice {
    Stack,
    NaiveStack,
    Sequential,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "kebab-case")]
enum ThresholdChoice {
    Single,
    Double,
}

impl From<ThresholdChoice> for ThresholdKind {
    fn from(choice: ThresholdChoice) -> Self {
        match choice {
            ThresholdChoice::Single => ThresholdKind::Single,
            ThresholdChoice::Double => ThresholdKind::Double,
        }
    }
}

fn build_engine(choice: EngineChoice, cfg: &RunConfig, threshold_kind: ThresholdKind) -> Box<dyn FittedEngine> {
    let buckets = cfg.cutoffs.clone();
    match choice {
        EngineChoice::Spc => Box::new(Engine::new(SpcProducer::new(cfg.spc.clone()), threshold_kind, buckets, cfg.beta)),
        EngineChoice::IsolationForest => Box::new(Engine::new(
            IsolationForestProducer::new(cfg.isolation_forest.clone()),
            threshold_kind,
            buckets,
            cfg.beta,
        )),
        EngineChoice::Arima => {
            Box::new(Engine::new(BasicArimaProducer::new(cfg.arima.clone()), threshold_kind, buckets, cfg.beta))
        }
        EngineChoice::IterativeArima => Box::new(Engine::new(
            IterativeArimaProducer::new(cfg.iterative_arima.clone()),
            threshold_kind,
            buckets,
            cfg.beta,
        )),
        EngineChoice::Sarimax => {
            Box::new(Engine::new(SarimaxProducer::new(cfg.sarimax.clone()), threshold_kind, buckets, cfg.beta))
        }
        EngineChoice::Binseg => {
            Box::new(Engine::new(BinsegProducer::new(cfg.binary_segmentation.clone()), threshold_kind, buckets, cfg.beta))
        }
    }
}

fn build_binseg_engine(cfg: &RunConfig, threshold_kind: ThresholdKind) -> Box<dyn FittedSegmentationEngine> {
    Box::new(Engine::new(BinsegProducer::new(cfg.binary_segmentation.clone()), threshold_kind, cfg.cutoffs.clone(), cfg.beta))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let run_config = match &args.config {
        Some(path) => RunConfig::load_from_file(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => RunConfig::load(),
    };
    config::init(run_config);
    let cfg = config::get();

    info!(data_dir = %args.data_dir.display(), engine = ?args.engine, "starting stormphase run");

    let batch = io::load_station_batch(&args.data_dir).context("loading station batch")?;
    info!(stations = batch.len(), "loaded station batch");

    let pool = concurrency::WorkerPool::new(cfg.max_workers);

    let preprocessed: Vec<_> = pool
        .map_ordered(&batch.stations, |raw| preprocessing::preprocess(raw, &cfg.preprocessing))
        .into_iter()
        .zip(&batch.stations)
        .filter_map(|(result, raw)| match result {
            Ok(station) => Some(station),
            Err(err) => {
                tracing::warn!(station_id = %raw.station_id, error = %err, "dropping station after preprocessing failure");
                None
            }
        })
        .collect();

    if preprocessed.is_empty() {
        anyhow::bail!("no station survived preprocessing");
    }

    let filters: Vec<_> = pool.map_ordered(&preprocessed, |station| {
        preprocessing::length_filters(station, &cfg.cutoffs, &cfg.uncertain_codes, cfg.remove_missing)
    });

    let model_store = store::ModelStore::new(&cfg.store_dir);
    let preprocessing_hash = store::hash_model_string(&format!("{:?}", cfg.preprocessing));

    let threshold_kind: ThresholdKind = args.threshold.into();

    match args.ensemble {
        None => {
            let mut engine = build_engine(args.engine, cfg, threshold_kind);
            if !args.overwrite {
                engine.sync_with_store(&model_store, &preprocessing_hash)?;
            }
            let output = engine.fit_transform_predict(&preprocessed, &filters)?;
            let anomalies: usize = output.predictions.iter().flatten().filter(|&&p| p).count();
            info!(method = engine.method_name(), anomalies, threshold = ?output.threshold, "fit complete");
            if !args.dry_run {
                engine.save_to_store(&model_store, &preprocessing_hash)?;
            }
        }
        Some(EnsembleChoice::Stack) => {
            let engines = vec![build_engine(args.engine, cfg, threshold_kind), build_engine(EngineChoice::Spc, cfg, threshold_kind)];
            let mut ensemble = StackEnsemble::new(engines);
            let output = ensemble.fit_transform_predict(&preprocessed, &filters)?;
            let anomalies: usize = output.predictions.iter().flatten().filter(|&&p| p).count();
            info!(anomalies, "stack ensemble fit complete");
        }
        Some(EnsembleChoice::NaiveStack) => {
            let engines = vec![
                build_engine(args.engine, cfg, threshold_kind),
                build_engine(EngineChoice::Spc, cfg, threshold_kind),
            ];
            let mut ensemble = NaiveStackEnsemble::new(engines, &cfg.cutoffs);
            let output = ensemble.fit_transform_predict(&preprocessed, &filters)?;
            let anomalies: usize = output.predictions.iter().flatten().filter(|&&p| p).count();
            info!(anomalies, "naive stack ensemble fit complete");
        }
        Some(EnsembleChoice::Sequential) => {
            let seg = build_binseg_engine(cfg, threshold_kind);
            let ad = build_engine(args.engine, cfg, threshold_kind);
            let mut ensemble = SequentialEnsemble::new(seg, ad);
            let output = ensemble.fit_transform_predict(&preprocessed, &filters)?;
            let anomalies: usize = output.predictions.iter().flatten().filter(|&&p| p).count();
            info!(anomalies, segments_routed_to_ad = output.segment_origins.len(), "sequential ensemble fit complete");
        }
    }

    Ok(())
}
