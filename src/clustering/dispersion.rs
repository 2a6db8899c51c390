use anyhow::anyhow;
use ndarray::ArrayView2;

use super::{CandidateFit, ClusterAlgorithm, FittedClustering};
use crate::error::{ClusteringError, Result};

/// Fit `algorithm` for exactly `k` clusters and compute `ln(W)`, where `W` is the sum of
/// squared distances from each observation to its assigned center.
///
/// Any failure of the algorithm, a model whose output does not cover every observation with a
/// label in `[0, k)`, and a degenerate dispersion (`W == 0` or non-finite, e.g. from duplicate
/// points) are all reported as [`ClusteringError::Fit`].
pub fn log_within_dispersion<A>(
    data: ArrayView2<'_, f64>,
    algorithm: &A,
    k: usize,
    seed: u64,
) -> Result<CandidateFit>
where
    A: ClusterAlgorithm,
{
    let fit_error = |source: anyhow::Error| ClusteringError::Fit { k, source };

    let model = algorithm.fit(data, k, seed).map_err(fit_error)?;
    let labels = model.labels();
    let distances = model.distances_to_center();
    let n = data.nrows();

    if labels.len() != n || distances.len() != n {
        return Err(fit_error(anyhow!(
            "Model returned {} labels and {} distances for {} observations",
            labels.len(),
            distances.len(),
            n
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&label| label >= k) {
        return Err(fit_error(anyhow!("Label {} is outside [0, {})", bad, k)));
    }

    let dispersion: f64 = distances.iter().map(|d| d * d).sum();
    if !(dispersion.is_finite() && dispersion > 0.0) {
        return Err(fit_error(anyhow!(
            "Degenerate within-cluster dispersion {} (duplicate points or k too large)",
            dispersion
        )));
    }

    Ok(CandidateFit {
        k,
        log_dispersion: dispersion.ln(),
        labels: labels.to_vec(),
    })
}
