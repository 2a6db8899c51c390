//! Marker genes for the clusters found by the hierarchy.
//!
//! Each cluster is compared against all remaining cells with a Welch t-test per gene. Group
//! sums and sums of squares are accumulated in a single pass over the sparse matrix, so the
//! cost is linear in the number of stored entries regardless of the number of clusters.

use std::cmp::Ordering;

use anyhow::anyhow;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::preprocessing::value_f64;

/// One gene reported as a marker of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerGene {
    /// Column index of the gene.
    pub gene: usize,
    /// Welch t-statistic, cluster versus rest.
    pub statistic: f64,
    pub p_value: f64,
    /// Benjamini-Hochberg adjusted p-value across all genes of the cluster.
    pub adjusted_p_value: f64,
    pub mean_in: f64,
    pub mean_out: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMarkers {
    pub cluster: usize,
    pub n_cells: usize,
    /// Up-regulated genes, strongest statistic first.
    pub markers: Vec<MarkerGene>,
}

/// Per-gene sums over a group of cells.
#[derive(Debug, Clone)]
struct GroupSums {
    n: f64,
    sums: Vec<f64>,
    sum_squares: Vec<f64>,
}

impl GroupSums {
    fn new(n_genes: usize) -> Self {
        GroupSums {
            n: 0.0,
            sums: vec![0.0; n_genes],
            sum_squares: vec![0.0; n_genes],
        }
    }
}

/// Find the `n_top` most up-regulated genes of every cluster.
///
/// # Arguments
///
/// * `matrix` - Expression matrix (cells × genes), typically log-normalized
/// * `labels` - Cluster label of every cell
/// * `n_top` - Number of markers to report per cluster
///
/// # Returns
///
/// One entry per label in `0..=max(labels)`. Only genes with a positive statistic are reported,
/// so a cluster may have fewer than `n_top` markers.
pub fn find_markers<T>(
    matrix: &CsrMatrix<T>,
    labels: &[usize],
    n_top: usize,
) -> anyhow::Result<Vec<ClusterMarkers>>
where
    T: FloatOpsTS,
{
    if labels.len() != matrix.nrows() {
        return Err(anyhow!(
            "Expected {} labels, got {}",
            matrix.nrows(),
            labels.len()
        ));
    }
    let n_clusters = labels
        .iter()
        .max()
        .map(|&max| max + 1)
        .ok_or_else(|| anyhow!("Cannot find markers without cells"))?;

    let n_genes = matrix.ncols();
    let mut groups = vec![GroupSums::new(n_genes); n_clusters];
    let mut total = GroupSums::new(n_genes);

    for &label in labels {
        groups[label].n += 1.0;
    }
    total.n = labels.len() as f64;

    for (cell, gene, &value) in matrix.triplet_iter() {
        let value = value_f64(value);
        let group = &mut groups[labels[cell]];
        group.sums[gene] += value;
        group.sum_squares[gene] += value * value;
        total.sums[gene] += value;
        total.sum_squares[gene] += value * value;
    }

    groups
        .par_iter()
        .enumerate()
        .map(|(cluster, group)| -> anyhow::Result<ClusterMarkers> {
            let markers = cluster_markers(group, &total, n_top)?;
            Ok(ClusterMarkers {
                cluster,
                n_cells: group.n as usize,
                markers,
            })
        })
        .collect()
}

fn cluster_markers(
    group: &GroupSums,
    total: &GroupSums,
    n_top: usize,
) -> anyhow::Result<Vec<MarkerGene>> {
    let n_rest = total.n - group.n;
    if group.n < 2.0 || n_rest < 2.0 {
        return Ok(Vec::new());
    }

    let tests: Vec<(f64, f64)> = (0..group.sums.len())
        .map(|gene| {
            welch_t_test_from_sums(
                group.sums[gene],
                group.sum_squares[gene],
                group.n,
                total.sums[gene] - group.sums[gene],
                total.sum_squares[gene] - group.sum_squares[gene],
                n_rest,
            )
        })
        .collect();

    let p_values: Vec<f64> = tests.iter().map(|&(_, p)| p).collect();
    let adjusted = benjamini_hochberg(&p_values)?;

    let mut markers: Vec<MarkerGene> = tests
        .iter()
        .enumerate()
        .filter(|(_, (statistic, _))| *statistic > 0.0)
        .map(|(gene, &(statistic, p_value))| MarkerGene {
            gene,
            statistic,
            p_value,
            adjusted_p_value: adjusted[gene],
            mean_in: group.sums[gene] / group.n,
            mean_out: (total.sums[gene] - group.sums[gene]) / n_rest,
        })
        .collect();

    markers.sort_by(|a, b| b.statistic.partial_cmp(&a.statistic).unwrap_or(Ordering::Equal));
    markers.truncate(n_top);
    Ok(markers)
}

/// Two-sided Welch t-test from group sums, returning `(statistic, p_value)`.
fn welch_t_test_from_sums(
    sum1: f64,
    sum_sq1: f64,
    n1: f64,
    sum2: f64,
    sum_sq2: f64,
    n2: f64,
) -> (f64, f64) {
    let mean1 = sum1 / n1;
    let mean2 = sum2 / n2;
    // Clamp the rounding error of the computational formula
    let var1 = ((sum_sq1 - sum1 * mean1) / (n1 - 1.0)).max(0.0);
    let var2 = ((sum_sq2 - sum2 * mean2) / (n2 - 1.0)).max(0.0);

    let term1 = var1 / n1;
    let term2 = var2 / n2;
    let combined = term1 + term2;
    let mean_diff = mean1 - mean2;

    if combined == 0.0 {
        return match mean_diff.partial_cmp(&0.0) {
            Some(Ordering::Greater) => (f64::INFINITY, 0.0),
            Some(Ordering::Less) => (f64::NEG_INFINITY, 0.0),
            _ => (0.0, 1.0),
        };
    }

    let t = mean_diff / combined.sqrt();
    let df = combined * combined / (term1 * term1 / (n1 - 1.0) + term2 * term2 / (n2 - 1.0));
    (t, two_sided_p_value(t, df))
}

fn two_sided_p_value(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return if t.is_infinite() { 0.0 } else { 1.0 };
    }
    if !(df > 0.0 && df.is_finite()) {
        return 1.0;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

/// Benjamini-Hochberg step-up adjustment.
fn benjamini_hochberg(p_values: &[f64]) -> anyhow::Result<Vec<f64>> {
    let n = p_values.len();
    if let Some((i, p)) = p_values
        .iter()
        .enumerate()
        .find(|(_, p)| !(0.0..=1.0).contains(*p))
    {
        return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].partial_cmp(&p_values[b]).unwrap_or(Ordering::Equal));

    let mut adjusted = vec![0.0; n];
    let mut running_min: f64 = 1.0;
    for (rank, &idx) in order.iter().enumerate().rev() {
        let scaled = p_values[idx] * n as f64 / (rank + 1) as f64;
        running_min = running_min.min(scaled);
        adjusted[idx] = running_min;
    }
    Ok(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra_sparse::CooMatrix;

    fn create_test_matrix() -> CsrMatrix<f64> {
        // 6 cells × 3 genes, cells 0..3 form cluster 0 and 3..6 cluster 1
        // Gene 0: high in cluster 0
        // Gene 1: high in cluster 1
        // Gene 2: same mean in both
        let rows = vec![0, 1, 2, 3, 5, 0, 2, 3, 4, 5, 0, 1, 2, 3, 4, 5];
        let cols = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2];
        let vals = vec![
            8.0, 9.0, 10.0, 1.0, 2.0, // gene 0, cell 4 is zero
            1.0, 2.0, 9.0, 10.0, 8.0, // gene 1, cell 1 is zero
            5.0, 4.0, 6.0, 5.0, 6.0, 4.0, // gene 2
        ];
        let coo = CooMatrix::try_from_triplets(6, 3, rows, cols, vals).unwrap();
        CsrMatrix::from(&coo)
    }

    #[test]
    fn test_markers_per_cluster() {
        let matrix = create_test_matrix();
        let labels = vec![0, 0, 0, 1, 1, 1];
        let markers = find_markers(&matrix, &labels, 5).unwrap();

        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].cluster, 0);
        assert_eq!(markers[0].n_cells, 3);

        let genes: Vec<usize> = markers[0].markers.iter().map(|m| m.gene).collect();
        assert_eq!(genes, vec![0]);
        let genes: Vec<usize> = markers[1].markers.iter().map(|m| m.gene).collect();
        assert_eq!(genes, vec![1]);

        let top = &markers[0].markers[0];
        assert_relative_eq!(top.mean_in, 9.0);
        assert_relative_eq!(top.mean_out, 1.0);
        assert!(top.p_value < 0.01);
        assert!(top.adjusted_p_value >= top.p_value);
    }

    #[test]
    fn test_n_top_truncates() {
        let matrix = create_test_matrix();
        let labels = vec![0, 0, 0, 1, 1, 1];
        let markers = find_markers(&matrix, &labels, 0).unwrap();
        assert!(markers.iter().all(|c| c.markers.is_empty()));
    }

    #[test]
    fn test_label_count_must_match() {
        let matrix = create_test_matrix();
        assert!(find_markers(&matrix, &[0, 1], 3).is_err());
        assert!(find_markers(&CsrMatrix::<f64>::zeros(0, 3), &[], 3).is_err());
    }

    #[test]
    fn test_welch_matches_known_value() {
        // x = [1, 2, 3, 4], y = [2, 4, 6, 8]
        let (t, p) = welch_t_test_from_sums(10.0, 30.0, 4.0, 20.0, 120.0, 4.0);
        assert_relative_eq!(t, -1.7320508075688772, epsilon = 1e-12);
        assert!(p > 0.14 && p < 0.16, "p = {}", p);
    }

    #[test]
    fn test_constant_groups() {
        let (t, p) = welch_t_test_from_sums(6.0, 12.0, 3.0, 3.0, 3.0, 3.0);
        assert!(t.is_infinite() && t > 0.0);
        assert_eq!(p, 0.0);

        let (t, p) = welch_t_test_from_sums(3.0, 3.0, 3.0, 3.0, 3.0, 3.0);
        assert_eq!((t, p), (0.0, 1.0));
    }

    #[test]
    fn test_benjamini_hochberg() {
        let adjusted = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.2]).unwrap();
        let expected = [0.04, 0.0533333333, 0.0533333333, 0.2];
        for (a, e) in adjusted.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *e, epsilon = 1e-8);
        }
        assert!(benjamini_hochberg(&[0.5, 1.5]).is_err());
    }
}
