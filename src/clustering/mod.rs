//! Automatic cluster-count selection and recursive hierarchical clustering.
//!
//! The number of clusters is chosen with the gap statistic of Tibshirani, Walther & Hastie
//! (J. R. Statist. Soc. B, 2001): the within-cluster dispersion of the real data is compared
//! against the dispersion of reference samples drawn uniformly from the principal-component
//! bounding box of the data, and `k` grows until an extra cluster no longer improves the gap
//! by more than the sampling error.
//!
//! ## Components
//!
//! - [`null_model`]: reference distribution fit and seeded sampling
//! - [`dispersion`]: log within-cluster dispersion of a fitted clustering
//! - [`parallel`]: order-preserving fan-out of independent jobs over worker threads
//! - [`gap`]: the gap-statistic search over `k`
//! - [`hierarchy`]: top-down recursive clustering into a [`ClusterTree`]
//! - [`kmeans`]: a k-means implementation of [`ClusterAlgorithm`]
//!
//! Any clustering method can drive the search by implementing [`ClusterAlgorithm`], and any
//! projection can be used between hierarchy levels by implementing [`DimReduce`].

use ndarray::{Array2, ArrayBase, ArrayView2, Data, Ix2};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod dispersion;
pub mod gap;
pub mod hierarchy;
pub mod kmeans;
pub mod null_model;
pub mod parallel;

pub use gap::{GapStatisticConfig, gap_statistic};
pub use hierarchy::{ClusterTree, HierarchyConfig, hierarchical_clusters};
pub use kmeans::KMeans;
pub use null_model::NullModelParameters;
pub use parallel::ParallelEvaluator;

/// A clustering fitted for a fixed number of clusters.
pub trait FittedClustering {
    /// Cluster label of every observation, each in `[0, k)`.
    fn labels(&self) -> &[usize];

    /// Distance of every observation to the center of its assigned cluster.
    fn distances_to_center(&self) -> &[f64];
}

/// A clustering method that can be fit for an exact number of clusters.
///
/// Algorithm parameters live on the implementing type. The `seed` drives every random choice
/// the method makes, so a fit is reproducible from `(data, k, seed)` alone; this is what lets
/// null-sample fits run on any worker without changing results.
pub trait ClusterAlgorithm: Sync {
    type Model: FittedClustering;

    fn fit(&self, data: ArrayView2<'_, f64>, k: usize, seed: u64) -> anyhow::Result<Self::Model>;
}

/// Projection applied to each subset before it is clustered by the hierarchy driver.
pub trait DimReduce {
    fn reduce(&self, data: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>>;
}

/// Outcome of fitting one candidate `k` on one matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFit {
    pub k: usize,
    /// `ln(Σ distance²)` over all observations
    pub log_dispersion: f64,
    pub labels: Vec<usize>,
}

/// Gap statistic of one evaluated `k`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub k: usize,
    /// Mean null log-dispersion minus the real log-dispersion
    pub gap: f64,
    /// `sqrt(1 - 1/B) · std` of the `B` null log-dispersions
    pub standard_error: f64,
    /// `gap(k) - gap(k - 1)`, with `gap(0) = 0`
    pub delta_gap: f64,
}

/// The cluster count chosen by the gap statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCount {
    Selected(usize),
    /// The search reached the configured cutoff without the stopping rule firing.
    CutoffExceeded,
}

impl ClusterCount {
    /// Integer form of [`ClusterCount::CutoffExceeded`].
    pub const CUTOFF_SENTINEL: i64 = -1;

    /// The count as a signed integer, `-1` when the cutoff was exceeded.
    pub fn as_i64(self) -> i64 {
        match self {
            ClusterCount::Selected(k) => k as i64,
            ClusterCount::CutoffExceeded => Self::CUTOFF_SENTINEL,
        }
    }

    pub fn selected(self) -> Option<usize> {
        match self {
            ClusterCount::Selected(k) => Some(k),
            ClusterCount::CutoffExceeded => None,
        }
    }

    pub fn is_cutoff_exceeded(self) -> bool {
        matches!(self, ClusterCount::CutoffExceeded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapStatisticResult {
    pub count: ClusterCount,
    /// Labels of the selected `k`, or of `k = cutoff` when the cutoff was exceeded
    pub labels: Vec<usize>,
    /// One record per evaluated `k`, in evaluation order
    pub history: Vec<GapRecord>,
}

impl GapStatisticResult {
    /// Selected `k`, or `-1` when the cutoff was exceeded.
    pub fn k(&self) -> i64 {
        self.count.as_i64()
    }
}

/// Cluster-count selection and hierarchical clustering on dense matrices
/// (observations × features).
pub trait MatrixClustering {
    fn gap_statistic<A>(
        &self,
        algorithm: &A,
        config: &GapStatisticConfig,
    ) -> Result<GapStatisticResult>
    where
        A: ClusterAlgorithm;

    fn hierarchical_clusters<R, A>(
        &self,
        reducer: &R,
        algorithm: &A,
        config: &HierarchyConfig,
    ) -> Result<ClusterTree>
    where
        R: DimReduce,
        A: ClusterAlgorithm;
}

impl<S> MatrixClustering for ArrayBase<S, Ix2>
where
    S: Data<Elem = f64>,
{
    fn gap_statistic<A>(
        &self,
        algorithm: &A,
        config: &GapStatisticConfig,
    ) -> Result<GapStatisticResult>
    where
        A: ClusterAlgorithm,
    {
        gap::gap_statistic(self.view(), algorithm, config)
    }

    fn hierarchical_clusters<R, A>(
        &self,
        reducer: &R,
        algorithm: &A,
        config: &HierarchyConfig,
    ) -> Result<ClusterTree>
    where
        R: DimReduce,
        A: ClusterAlgorithm,
    {
        hierarchy::hierarchical_clusters(self.view(), reducer, algorithm, config)
    }
}
