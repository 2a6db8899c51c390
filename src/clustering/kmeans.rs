//! K-means clustering with k-means++ seeding and multiple restarts.
//!
//! Lloyd iterations minimise the within-cluster sum of squares, which is exactly the
//! dispersion `W` the gap statistic measures, so this is the default algorithm for the
//! cluster-count search.

use anyhow::anyhow;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{ClusterAlgorithm, FittedClustering};

/// K-means configuration.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// Number of independently seeded runs; the lowest-inertia run wins.
    n_init: usize,
    max_iter: usize,
    /// Convergence tolerance relative to the mean per-feature variance.
    tol: f64,
}

impl Default for KMeans {
    fn default() -> Self {
        KMeans {
            n_init: 10,
            max_iter: 300,
            tol: 1e-4,
        }
    }
}

impl KMeans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }
}

/// A fitted k-means partition.
#[derive(Debug, Clone)]
pub struct KMeansModel {
    centroids: Array2<f64>,
    labels: Vec<usize>,
    distances: Vec<f64>,
    inertia: f64,
    n_iter: usize,
}

impl KMeansModel {
    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }

    /// Sum of squared distances to the assigned centroids.
    pub fn inertia(&self) -> f64 {
        self.inertia
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }
}

impl FittedClustering for KMeansModel {
    fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn distances_to_center(&self) -> &[f64] {
        &self.distances
    }
}

impl ClusterAlgorithm for KMeans {
    type Model = KMeansModel;

    fn fit(&self, data: ArrayView2<'_, f64>, k: usize, seed: u64) -> anyhow::Result<KMeansModel> {
        let (n, d) = data.dim();
        if n == 0 || d == 0 {
            return Err(anyhow!("Cannot cluster an empty matrix"));
        }
        if k == 0 {
            return Err(anyhow!("Number of clusters must be at least 1"));
        }
        if k > n {
            return Err(anyhow!("Cannot create {} clusters from {} observations", k, n));
        }
        if self.n_init == 0 || self.max_iter == 0 {
            return Err(anyhow!("n_init and max_iter must be at least 1"));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("Input contains non-finite values"));
        }

        let tol = self.tol * mean_feature_variance(&data);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut best: Option<KMeansModel> = None;
        for _ in 0..self.n_init {
            let run = self.single_run(&data, k, tol, &mut rng);
            if best.as_ref().is_none_or(|b| run.inertia < b.inertia) {
                best = Some(run);
            }
        }
        best.ok_or_else(|| anyhow!("k-means produced no runs"))
    }
}

struct Assignment {
    labels: Vec<usize>,
    squared_distances: Vec<f64>,
}

impl KMeans {
    fn single_run(
        &self,
        data: &ArrayView2<'_, f64>,
        k: usize,
        tol: f64,
        rng: &mut ChaCha8Rng,
    ) -> KMeansModel {
        let mut centroids = init_plus_plus(data, k, rng);
        let mut assignment = assign(data, &centroids);
        let mut n_iter = 0;

        for iter in 0..self.max_iter {
            repair_empty_clusters(data, &mut centroids, &mut assignment, k);
            let updated = centroid_means(data, &assignment.labels, k);
            let shift: f64 = (&updated - &centroids).iter().map(|v| v * v).sum();
            centroids = updated;
            assignment = assign(data, &centroids);
            n_iter = iter + 1;
            if shift <= tol {
                break;
            }
        }
        repair_empty_clusters(data, &mut centroids, &mut assignment, k);

        let inertia = assignment.squared_distances.iter().sum();
        KMeansModel {
            centroids,
            distances: assignment.squared_distances.iter().map(|d| d.sqrt()).collect(),
            labels: assignment.labels,
            inertia,
            n_iter,
        }
    }
}

fn mean_feature_variance(data: &ArrayView2<'_, f64>) -> f64 {
    data.var_axis(Axis(0), 0.0).mean().unwrap_or(0.0)
}

#[inline]
fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// k-means++: the first centroid uniformly, the rest with probability proportional to the
/// squared distance to the nearest centroid chosen so far.
fn init_plus_plus(data: &ArrayView2<'_, f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));
    centroids.row_mut(0).assign(&data.row(rng.gen_range(0..n)));

    let mut nearest: Vec<f64> = (0..n)
        .map(|i| squared_distance(data.row(i), centroids.row(0)))
        .collect();

    for c in 1..k {
        let total: f64 = nearest.iter().sum();
        let selected = if total > 0.0 {
            let threshold = rng.gen_range(0.0..total);
            let mut cumulative = 0.0;
            nearest
                .iter()
                .position(|&d| {
                    cumulative += d;
                    cumulative > threshold
                })
                .unwrap_or(n - 1)
        } else {
            rng.gen_range(0..n)
        };
        centroids.row_mut(c).assign(&data.row(selected));

        for (i, current) in nearest.iter_mut().enumerate() {
            *current = current.min(squared_distance(data.row(i), centroids.row(c)));
        }
    }

    centroids
}

fn assign(data: &ArrayView2<'_, f64>, centroids: &Array2<f64>) -> Assignment {
    let (labels, squared_distances) = data
        .outer_iter()
        .map(|point| {
            centroids
                .outer_iter()
                .map(|centroid| squared_distance(point, centroid))
                .enumerate()
                .fold((0, f64::INFINITY), |best, (c, dist)| {
                    if dist < best.1 { (c, dist) } else { best }
                })
        })
        .unzip();
    Assignment {
        labels,
        squared_distances,
    }
}

fn centroid_means(data: &ArrayView2<'_, f64>, labels: &[usize], k: usize) -> Array2<f64> {
    let mut sums = Array2::<f64>::zeros((k, data.ncols()));
    let mut counts = Array1::<f64>::zeros(k);
    for (point, &label) in data.outer_iter().zip(labels) {
        let mut row = sums.row_mut(label);
        row += &point;
        counts[label] += 1.0;
    }
    for (mut row, &count) in sums.outer_iter_mut().zip(counts.iter()) {
        if count > 0.0 {
            row /= count;
        }
    }
    sums
}

/// Move the point farthest from its centroid into every empty cluster, taking it only from
/// clusters that keep at least one member.
fn repair_empty_clusters(
    data: &ArrayView2<'_, f64>,
    centroids: &mut Array2<f64>,
    assignment: &mut Assignment,
    k: usize,
) {
    let mut counts = vec![0usize; k];
    for &label in &assignment.labels {
        counts[label] += 1;
    }

    for empty in 0..k {
        if counts[empty] > 0 {
            continue;
        }
        let donor = assignment
            .squared_distances
            .iter()
            .enumerate()
            .filter(|&(i, _)| counts[assignment.labels[i]] > 1)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i);

        if let Some(i) = donor {
            counts[assignment.labels[i]] -= 1;
            counts[empty] = 1;
            assignment.labels[i] = empty;
            assignment.squared_distances[i] = 0.0;
            centroids.row_mut(empty).assign(&data.row(i));
        }
    }
}
