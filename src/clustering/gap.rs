//! Gap-statistic search for the number of clusters.

use ndarray::ArrayView2;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use super::dispersion::log_within_dispersion;
use super::{
    CandidateFit, ClusterAlgorithm, ClusterCount, GapRecord, GapStatisticResult,
    NullModelParameters, ParallelEvaluator,
};
use crate::error::{ClusteringError, Result};

/// Settings for one gap-statistic search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapStatisticConfig {
    /// Number of null samples drawn per candidate `k`.
    pub n_samples: usize,
    /// Worker threads used to evaluate the null samples.
    pub n_processes: usize,
    /// Largest `k` that may be selected. `None` searches until the stopping rule fires or the
    /// algorithm can no longer fit.
    ///
    /// The stopping rule for `k = cutoff` needs `k = cutoff + 1`, so that count is still
    /// evaluated (including its null samples) before
    /// [`ClusterCount::CutoffExceeded`] is returned.
    pub cutoff: Option<usize>,
    /// Master seed. `None` draws one from the thread RNG, making the run non-reproducible.
    pub seed: Option<u64>,
}

impl Default for GapStatisticConfig {
    fn default() -> Self {
        GapStatisticConfig {
            n_samples: 100,
            n_processes: 1,
            cutoff: Some(10),
            seed: None,
        }
    }
}

impl GapStatisticConfig {
    pub fn with_n_samples(mut self, n_samples: usize) -> Self {
        self.n_samples = n_samples;
        self
    }

    pub fn with_n_processes(mut self, n_processes: usize) -> Self {
        self.n_processes = n_processes;
        self
    }

    pub fn with_cutoff(mut self, cutoff: Option<usize>) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.n_samples == 0 {
            return Err(ClusteringError::invalid("n_samples", "must be at least 1"));
        }
        if self.n_processes == 0 {
            return Err(ClusteringError::invalid("n_processes", "must be at least 1"));
        }
        if self.cutoff == Some(0) {
            return Err(ClusteringError::invalid("cutoff", "must be at least 1"));
        }
        Ok(())
    }
}

/// Choose the number of clusters in `data` (observations × features) with the gap statistic.
///
/// For `k = 1, 2, ...` the real data is clustered, `n_samples` null samples are drawn and
/// clustered on the worker pool, and
///
/// ```text
/// gap(k)   = mean(ln W*_b) - ln W
/// error(k) = sqrt(1 - 1/B) · std(ln W*_b)
/// ```
///
/// After evaluating `k >= 2` the search stops as soon as `gap(k) - gap(k-1) < error(k)` and
/// returns `k - 1` with the labels fitted at `k - 1`. No decision is taken after `k = 1`.
/// When an evaluated `k` exceeds `cutoff` first, the result is
/// [`ClusterCount::CutoffExceeded`] with the labels fitted at `k = cutoff`.
///
/// Every iteration draws one seed offset from the master generator; the real fit uses the
/// offset and null sample `i` is drawn from `offset + 1 + i`, so results do not depend on
/// `n_processes`. The null fit takes its seed from a separate ChaCha stream of the sample
/// seed, keeping the algorithm's randomness apart from the sample's.
///
/// # Errors
///
/// - [`ClusteringError::Fit`] when the algorithm cannot fit the real data for some `k`
/// - [`ClusteringError::Worker`] when any null-sample evaluation fails
/// - [`ClusteringError::InvalidParameter`] / [`ClusteringError::EmptyInput`] for bad input
pub fn gap_statistic<A>(
    data: ArrayView2<'_, f64>,
    algorithm: &A,
    config: &GapStatisticConfig,
) -> Result<GapStatisticResult>
where
    A: ClusterAlgorithm,
{
    config.validate()?;
    let params = NullModelParameters::fit(data)?;
    let evaluator = ParallelEvaluator::new(config.n_processes)?;
    let mut seeds = ChaCha8Rng::seed_from_u64(config.seed.unwrap_or_else(rand::random));

    let n_obs = data.nrows();
    let n_samples = config.n_samples;
    let mut history: Vec<GapRecord> = Vec::new();
    let mut previous: Option<CandidateFit> = None;
    let mut gap_previous = 0.0;
    let mut k = 0;

    loop {
        k += 1;
        let offset = seeds.next_u64();
        let fit = log_within_dispersion(data, algorithm, k, offset)?;

        let jobs: Vec<u64> = (0..n_samples as u64)
            .map(|i| offset.wrapping_add(1 + i))
            .collect();
        let null_dispersions = evaluator.run(jobs, |seed| {
            let sample = params.generate_sample(n_obs, seed)?;
            let null_fit = log_within_dispersion(sample.view(), algorithm, k, null_fit_seed(seed))?;
            Ok(null_fit.log_dispersion)
        })?;

        let log_w_star = null_dispersions.iter().mean();
        let standard_error =
            (1.0 - 1.0 / n_samples as f64).sqrt() * null_dispersions.iter().population_std_dev();
        let gap = log_w_star - fit.log_dispersion;
        let record = GapRecord {
            k,
            gap,
            standard_error,
            delta_gap: gap - gap_previous,
        };
        gap_previous = gap;
        history.push(record);

        debug!(
            k,
            log_w = fit.log_dispersion,
            log_w_star,
            gap,
            standard_error,
            delta_gap = record.delta_gap,
            "evaluated candidate cluster count"
        );

        if let Some(last) = previous.take() {
            if record.delta_gap < record.standard_error {
                info!(k = last.k, evaluated = k, "gap statistic selected cluster count");
                return Ok(GapStatisticResult {
                    count: ClusterCount::Selected(last.k),
                    labels: last.labels,
                    history,
                });
            }
            if config.cutoff.is_some_and(|cutoff| k > cutoff) {
                warn!(
                    cutoff = last.k,
                    "gap statistic found no stable cluster count within the cutoff"
                );
                return Ok(GapStatisticResult {
                    count: ClusterCount::CutoffExceeded,
                    labels: last.labels,
                    history,
                });
            }
        }
        previous = Some(fit);
    }
}

/// Seed for clustering the null sample drawn from `sample_seed`, taken from stream 1 of the
/// same key.
fn null_fit_seed(sample_seed: u64) -> u64 {
    let mut rng = ChaCha8Rng::seed_from_u64(sample_seed);
    rng.set_stream(1);
    rng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{FittedClustering, KMeans};
    use ndarray::{Array2, array};

    struct AlwaysFails;

    struct NoModel;

    impl FittedClustering for NoModel {
        fn labels(&self) -> &[usize] {
            &[]
        }
        fn distances_to_center(&self) -> &[f64] {
            &[]
        }
    }

    impl ClusterAlgorithm for AlwaysFails {
        type Model = NoModel;

        fn fit(&self, _: ArrayView2<'_, f64>, k: usize, _: u64) -> anyhow::Result<NoModel> {
            Err(anyhow::anyhow!("refusing to fit {} clusters", k))
        }
    }

    fn grid() -> Array2<f64> {
        Array2::from_shape_fn((25, 2), |(i, j)| {
            if j == 0 { (i % 5) as f64 } else { (i / 5) as f64 }
        })
    }

    #[test]
    fn test_invalid_configs() {
        let data = grid();
        let algorithm = KMeans::new();
        for config in [
            GapStatisticConfig::default().with_n_samples(0),
            GapStatisticConfig::default().with_n_processes(0),
            GapStatisticConfig::default().with_cutoff(Some(0)),
        ] {
            let err = gap_statistic(data.view(), &algorithm, &config).unwrap_err();
            assert!(matches!(err, ClusteringError::InvalidParameter { .. }));
        }
    }

    #[test]
    fn test_fit_error_on_real_data_propagates() {
        let data = grid();
        let config = GapStatisticConfig::default().with_n_samples(3).with_seed(1);
        let err = gap_statistic(data.view(), &AlwaysFails, &config).unwrap_err();
        assert!(matches!(err, ClusteringError::Fit { k: 1, .. }));
    }

    #[test]
    fn test_running_out_of_observations_is_a_fit_error() {
        // Three spread points keep improving the gap until k exceeds n
        let data = array![[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];
        let config = GapStatisticConfig::default()
            .with_n_samples(5)
            .with_cutoff(None)
            .with_seed(9);
        let result = gap_statistic(data.view(), &KMeans::new().with_n_init(2), &config);
        match result {
            Ok(found) => assert!(found.count.selected().is_some_and(|k| k >= 1 && k <= 2)),
            Err(err) => assert!(err.is_fit_failure(), "unexpected error {err}"),
        }
    }

    #[test]
    fn test_history_grows_by_one_per_k() {
        let data = grid();
        let config = GapStatisticConfig::default().with_n_samples(10).with_seed(5);
        let result = gap_statistic(data.view(), &KMeans::new().with_n_init(3), &config).unwrap();

        for (i, record) in result.history.iter().enumerate() {
            assert_eq!(record.k, i + 1);
            assert!(record.gap.is_finite());
            assert!(record.standard_error >= 0.0);
        }
        approx::assert_relative_eq!(result.history[0].delta_gap, result.history[0].gap);
        assert_eq!(result.labels.len(), 25);
    }

    /// K-means that refuses every matrix other than the one it was built for.
    struct OnlyRealData<'a> {
        real: ArrayView2<'a, f64>,
        inner: KMeans,
    }

    impl ClusterAlgorithm for OnlyRealData<'_> {
        type Model = <KMeans as ClusterAlgorithm>::Model;

        fn fit(
            &self,
            data: ArrayView2<'_, f64>,
            k: usize,
            seed: u64,
        ) -> anyhow::Result<Self::Model> {
            if data != self.real {
                return Err(anyhow::anyhow!("not the real data"));
            }
            self.inner.fit(data, k, seed)
        }
    }

    #[test]
    fn test_null_sample_failures_are_worker_errors() {
        let data = grid();
        let algorithm = OnlyRealData {
            real: data.view(),
            inner: KMeans::new().with_n_init(2),
        };
        let config = GapStatisticConfig::default()
            .with_n_samples(8)
            .with_n_processes(3)
            .with_seed(11);
        match gap_statistic(data.view(), &algorithm, &config) {
            Err(ClusteringError::Worker { total, failures }) => {
                assert_eq!(total, 8);
                assert_eq!(failures.len(), 8);
                let mut indices: Vec<usize> = failures.iter().map(|f| f.index).collect();
                indices.sort_unstable();
                assert_eq!(indices, (0..8).collect::<Vec<_>>());
                assert!(failures[0].message.contains("not the real data"));
            }
            other => panic!("expected a worker error, got {:?}", other),
        }
    }

    /// K-means that logs the seed of every fit, flagged by whether it saw the real data.
    struct SeedLog<'a> {
        real: ArrayView2<'a, f64>,
        inner: KMeans,
        seeds: std::sync::Mutex<Vec<(bool, u64)>>,
    }

    impl ClusterAlgorithm for SeedLog<'_> {
        type Model = <KMeans as ClusterAlgorithm>::Model;

        fn fit(
            &self,
            data: ArrayView2<'_, f64>,
            k: usize,
            seed: u64,
        ) -> anyhow::Result<Self::Model> {
            if let Ok(mut seeds) = self.seeds.lock() {
                seeds.push((data == self.real, seed));
            }
            self.inner.fit(data, k, seed)
        }
    }

    #[test]
    fn test_null_fits_do_not_reuse_sample_seeds() {
        let data = grid();
        let algorithm = SeedLog {
            real: data.view(),
            inner: KMeans::new().with_n_init(1),
            seeds: std::sync::Mutex::new(Vec::new()),
        };
        let n_samples = 5;
        let config = GapStatisticConfig::default()
            .with_n_samples(n_samples)
            .with_cutoff(Some(2))
            .with_seed(21);
        gap_statistic(data.view(), &algorithm, &config).unwrap();

        let seeds = algorithm.seeds.into_inner().unwrap();
        let (real, null): (Vec<(bool, u64)>, Vec<(bool, u64)>) =
            seeds.into_iter().partition(|&(is_real, _)| is_real);
        let offsets: Vec<u64> = real.into_iter().map(|(_, seed)| seed).collect();
        let null_seeds: Vec<u64> = null.into_iter().map(|(_, seed)| seed).collect();
        assert!(!offsets.is_empty());
        assert_eq!(null_seeds.len(), offsets.len() * n_samples);

        for offset in offsets {
            for i in 0..n_samples as u64 {
                let sample_seed = offset.wrapping_add(1 + i);
                assert!(!null_seeds.contains(&sample_seed));
                assert!(null_seeds.contains(&null_fit_seed(sample_seed)));
            }
        }
    }

    #[test]
    fn test_single_null_sample_has_zero_error() {
        let data = grid();
        let config = GapStatisticConfig::default().with_n_samples(1).with_seed(2);
        let result = gap_statistic(data.view(), &KMeans::new().with_n_init(2), &config).unwrap();
        assert!(result.history.iter().all(|r| r.standard_error == 0.0));
    }
}
