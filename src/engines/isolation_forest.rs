//! Isolation-forest scoring engine (spec.md section 4.3.2).
//!
//! No isolation-forest crate exists in the retrieved example corpus (the
//! closest hit, `paiml-renacer`, only *declares* `rand` for this purpose in
//! its manifest) so the forest — binary isolation trees with random
//! split-value selection, path length scored and normalized by Liu et
//! al.'s `c(n)` constant — is implemented from scratch here, using `rand`
//! for split selection exactly as that manifest anticipates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{EngineError, ScoreProducer};
use crate::stats;
use crate::types::PreprocessedStation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForestConfig {
    /// Fit a fresh forest per station instead of one shared forest over
    /// the concatenated batch.
    pub forest_per_station: bool,
    /// Robust-scale the input column before fitting. Only honored when
    /// `forest_per_station = false` (spec.md section 4.3.2).
    pub scaling: bool,
    pub quantiles: (f64, f64),
    pub n_trees: usize,
    pub subsample_size: usize,
    /// Deterministic seed for split selection (testable-properties
    /// determinism, spec.md section 8).
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            forest_per_station: false,
            scaling: true,
            quantiles: (10.0, 90.0),
            n_trees: 100,
            subsample_size: 256,
            seed: 1337,
        }
    }
}

enum Node {
    Leaf { size: usize },
    Internal { split_value: f64, left: Box<Node>, right: Box<Node> },
}

struct IsolationTree {
    root: Node,
}

fn euler_mascheroni() -> f64 {
    0.577_215_664_901_532_9
}

/// Liu et al.'s average path length of an unsuccessful BST search,
/// `c(n) = 2*H(n-1) - 2*(n-1)/n`, with `c(1) = c(2) = 0`.
fn c_factor(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let nf = n as f64;
    let h = ((n - 1) as f64).ln() + euler_mascheroni();
    2.0 * h - 2.0 * (nf - 1.0) / nf
}

impl IsolationTree {
    fn build(values: &[f64], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
        let n = values.len();
        if n <= 1 || depth >= max_depth {
            return Node::Leaf { size: n };
        }
        let lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !(hi > lo) {
            return Node::Leaf { size: n };
        }
        let split_value = rng.gen_range(lo..hi);
        let left: Vec<f64> = values.iter().copied().filter(|&v| v < split_value).collect();
        let right: Vec<f64> = values.iter().copied().filter(|&v| v >= split_value).collect();
        if left.is_empty() || right.is_empty() {
            return Node::Leaf { size: n };
        }
        Node::Internal {
            split_value,
            left: Box::new(Self::build(&left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build(&right, depth + 1, max_depth, rng)),
        }
    }

    fn fit(values: &[f64], rng: &mut StdRng) -> Self {
        let max_depth = (values.len().max(2) as f64).log2().ceil() as usize;
        Self { root: Self::build(values, 0, max_depth, rng) }
    }

    fn path_length(&self, x: f64) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + c_factor(*size),
                Node::Internal { split_value, left, right } => {
                    depth += 1.0;
                    node = if x < *split_value { left.as_ref() } else { right.as_ref() };
                }
            }
        }
    }
}

struct Forest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
}

impl Forest {
    fn fit(values: &[f64], config: &IsolationForestConfig, rng: &mut StdRng) -> Self {
        let subsample_size = config.subsample_size.min(values.len()).max(1);
        let mut trees = Vec::with_capacity(config.n_trees);
        for _ in 0..config.n_trees {
            let sample: Vec<f64> = if values.len() <= subsample_size {
                values.to_vec()
            } else {
                (0..subsample_size).map(|_| values[rng.gen_range(0..values.len())]).collect()
            };
            trees.push(IsolationTree::fit(&sample, rng));
        }
        Self { trees, subsample_size }
    }

    /// `1 - decision_function(x)`: a non-negative anomaly score, higher
    /// for more anomalous points (spec.md section 4.3.2).
    fn score(&self, x: f64) -> f64 {
        let mean_path: f64 = self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64;
        let c = c_factor(self.subsample_size).max(1e-9);
        let raw = 2f64.powf(-mean_path / c);
        let decision_function = 0.5 - raw;
        let score = 1.0 - decision_function;
        debug_assert!(score >= 0.0, "isolation forest score must be non-negative, got {score}");
        score.max(0.0)
    }
}

pub struct IsolationForestProducer {
    pub config: IsolationForestConfig,
    shared_forest: Option<Forest>,
    scaler: Option<stats::RobustScaler>,
}

impl IsolationForestProducer {
    pub fn new(config: IsolationForestConfig) -> Self {
        Self { config, shared_forest: None, scaler: None }
    }

    fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.config.seed)
    }
}

impl ScoreProducer for IsolationForestProducer {
    fn method_name(&self) -> &'static str {
        "isolation_forest"
    }

    fn model_string(&self) -> String {
        format!(
            "method=isolation_forest;forest_per_station={};scaling={};quantiles=({},{});n_trees={};subsample_size={};seed={}",
            self.config.forest_per_station,
            self.config.scaling,
            self.config.quantiles.0,
            self.config.quantiles.1,
            self.config.n_trees,
            self.config.subsample_size,
            self.config.seed
        )
    }

    fn fit_transform(&mut self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        if self.config.forest_per_station {
            let mut rng = self.rng();
            return Ok(batch
                .iter()
                .map(|s| {
                    let forest = Forest::fit(&s.diff, &self.config, &mut rng);
                    s.diff.iter().map(|&x| forest.score(x)).collect()
                })
                .collect());
        }

        // Fit sequentially over the concatenated batch before the
        // per-station scoring phase (spec.md section 5's isolation-forest
        // caveat).
        let scaler = if self.config.scaling {
            let all: Vec<f64> = batch.iter().flat_map(|s| s.diff.iter().copied()).collect();
            Some(stats::RobustScaler::fit(&all, self.config.quantiles.0, self.config.quantiles.1))
        } else {
            None
        };
        let transform = |v: f64| scaler.map_or(v, |sc| sc.transform_one(v));
        let all_scaled: Vec<f64> = batch.iter().flat_map(|s| s.diff.iter().map(|&v| transform(v))).collect();

        let mut rng = self.rng();
        let forest = Forest::fit(&all_scaled, &self.config, &mut rng);
        let scores = batch
            .iter()
            .map(|s| s.diff.iter().map(|&v| forest.score(transform(v))).collect())
            .collect();

        self.shared_forest = Some(forest);
        self.scaler = scaler;
        Ok(scores)
    }

    fn transform(&self, batch: &[PreprocessedStation]) -> Result<Vec<Vec<f64>>, EngineError> {
        if self.config.forest_per_station {
            // Per-station forests aren't persisted across calls in this
            // producer (they're cheap to refit deterministically from the
            // same seed); refit per station as fit_transform does.
            let mut rng = self.rng();
            return Ok(batch
                .iter()
                .map(|s| {
                    let forest = Forest::fit(&s.diff, &self.config, &mut rng);
                    s.diff.iter().map(|&x| forest.score(x)).collect()
                })
                .collect());
        }
        let forest = self.shared_forest.as_ref().ok_or(EngineError::NotFitted)?;
        let transform = |v: f64| self.scaler.map_or(v, |sc| sc.transform_one(v));
        Ok(batch
            .iter()
            .map(|s| s.diff.iter().map(|&v| forest.score(transform(v))).collect())
            .collect())
    }
}
