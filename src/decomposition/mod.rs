//! Dimensionality reduction between hierarchy levels.
//!
//! [`Pca`] is the primitive shared with the gap-statistic null model. The reducers implement
//! [`DimReduce`] so they can be handed to
//! [`hierarchical_clusters`](crate::clustering::hierarchical_clusters):
//!
//! - [`NoReduction`] clusters the rows as they are
//! - [`PcaReducer`] projects onto a fixed number of components
//! - [`ShufflePcaReducer`] keeps the components that explain more variance than the first
//!   component of column-shuffled data

pub mod pca;

pub use pca::Pca;

use anyhow::anyhow;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clustering::{DimReduce, ParallelEvaluator};

/// Center every column and scale it to unit variance (population standard deviation).
///
/// Columns with zero variance are only centered.
pub fn standardize(data: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
    if data.nrows() == 0 || data.ncols() == 0 {
        return Err(anyhow!("Cannot standardize an empty matrix"));
    }
    let mean = data
        .mean_axis(Axis(0))
        .ok_or_else(|| anyhow!("Cannot compute column means"))?;
    let std = data.std_axis(Axis(0), 0.0);

    let mut result = &data - &mean;
    for (mut column, &sd) in result.axis_iter_mut(Axis(1)).zip(std.iter()) {
        if sd > 0.0 {
            column /= sd;
        }
    }
    Ok(result)
}

/// Identity reducer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReduction;

impl DimReduce for NoReduction {
    fn reduce(&self, data: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
        Ok(data.to_owned())
    }
}

/// Projection onto a fixed number of principal components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaReducer {
    /// Upper bound on the number of components; clamped to the number of features.
    pub n_components: usize,
    /// Z-score the columns before fitting.
    pub standardize: bool,
}

impl Default for PcaReducer {
    fn default() -> Self {
        PcaReducer {
            n_components: 10,
            standardize: false,
        }
    }
}

impl PcaReducer {
    pub fn new(n_components: usize) -> Self {
        PcaReducer {
            n_components,
            ..Default::default()
        }
    }

    pub fn with_standardize(mut self, standardize: bool) -> Self {
        self.standardize = standardize;
        self
    }
}

impl DimReduce for PcaReducer {
    fn reduce(&self, data: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
        let input = if self.standardize {
            standardize(data)?
        } else {
            data.to_owned()
        };
        let n_components = self.n_components.min(input.ncols());
        let pca = Pca::fit(input.view(), n_components)?;
        pca.transform(input.view())
    }
}

/// Principal components selected by a permutation test.
///
/// Every column of the standardized matrix is shuffled independently, which destroys the
/// correlation between features, and the variance of the first principal component of the
/// shuffled matrix is recorded. Components of the real data whose variance exceeds the
/// `(1 - alpha)` percentile of those scores are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShufflePcaReducer {
    pub n_shuffles: usize,
    pub alpha: f64,
    /// Number of components computed on the real data.
    pub max_pcs: usize,
    pub n_processes: usize,
    pub seed: Option<u64>,
}

impl Default for ShufflePcaReducer {
    fn default() -> Self {
        ShufflePcaReducer {
            n_shuffles: 100,
            alpha: 0.05,
            max_pcs: 100,
            n_processes: 1,
            seed: None,
        }
    }
}

/// Outcome of [`ShufflePcaReducer::fit_transform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleTest {
    /// Projection onto the significant components, observations × `n_significant`.
    pub projection: Array2<f64>,
    pub n_significant: usize,
    /// Variance threshold taken from the shuffle scores.
    pub cutoff: f64,
    /// First-component variance of every shuffled matrix, in job order.
    pub scores: Vec<f64>,
    /// Variance of each computed component of the real data.
    pub explained_variance: Array1<f64>,
}

impl ShufflePcaReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_shuffles(mut self, n_shuffles: usize) -> Self {
        self.n_shuffles = n_shuffles;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_max_pcs(mut self, max_pcs: usize) -> Self {
        self.max_pcs = max_pcs;
        self
    }

    pub fn with_n_processes(mut self, n_processes: usize) -> Self {
        self.n_processes = n_processes;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn fit_transform(&self, data: ArrayView2<'_, f64>) -> anyhow::Result<ShuffleTest> {
        if self.n_shuffles == 0 {
            return Err(anyhow!("n_shuffles must be at least 1"));
        }
        if self.max_pcs == 0 {
            return Err(anyhow!("max_pcs must be at least 1"));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(anyhow!("alpha must lie in (0, 1), got {}", self.alpha));
        }

        let zscored = standardize(data)?;
        let base_seed = self.seed.unwrap_or_else(rand::random);
        let jobs: Vec<u64> = (0..self.n_shuffles as u64)
            .map(|i| base_seed.wrapping_add(i))
            .collect();

        let evaluator = ParallelEvaluator::new(self.n_processes)?;
        let scores = evaluator.run(jobs, |seed| shuffled_first_variance(zscored.view(), seed))?;
        let cutoff = percentile(&scores, 1.0 - self.alpha);

        let n_components = self.max_pcs.min(zscored.ncols());
        let pca = Pca::fit(zscored.view(), n_components)?;
        let explained_variance = pca.explained_variance().clone();

        let n_significant = match explained_variance.iter().position(|&v| v < cutoff) {
            Some(first_below) => first_below.max(1),
            None => {
                warn!(
                    n_components = explained_variance.len(),
                    "all computed principal components are significant; consider raising max_pcs"
                );
                explained_variance.len().max(1)
            }
        };
        debug!(n_significant, cutoff, "shuffle test selected components");

        let projection = pca.transform(zscored.view())?;
        let keep = n_significant.min(projection.ncols());
        Ok(ShuffleTest {
            projection: projection.slice(s![.., ..keep]).to_owned(),
            n_significant: keep,
            cutoff,
            scores,
            explained_variance,
        })
    }
}

impl DimReduce for ShufflePcaReducer {
    fn reduce(&self, data: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
        Ok(self.fit_transform(data)?.projection)
    }
}

fn shuffled_first_variance(data: ArrayView2<'_, f64>, seed: u64) -> anyhow::Result<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut shuffled = data.to_owned();
    for mut column in shuffled.axis_iter_mut(Axis(1)) {
        let mut values = column.to_vec();
        values.shuffle(&mut rng);
        column.assign(&Array1::from(values));
    }
    let pca = Pca::fit(shuffled.view(), 1)?;
    Ok(pca.explained_variance().first().copied().unwrap_or(0.0))
}

/// Percentile `q` in `[0, 1]` of `values` with linear interpolation between ranks.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}
