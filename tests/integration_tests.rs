// End-to-end scenarios for cluster-count selection and the hierarchy driver.

use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::{Array2, Axis, concatenate};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use single_clustering::decomposition::{NoReduction, PcaReducer};
use single_clustering::markers::find_markers;
use single_clustering::preprocessing::{GeneFilter, drop_genes, log_normalize, to_dense};
use single_clustering::{
    ClusterCount, ClusterTree, GapStatisticConfig, HierarchyConfig, KMeans, MatrixClustering,
};

fn blob(n: usize, center: (f64, f64), std: f64, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut points = Array2::random_using((n, 2), Normal::new(0.0, std).unwrap(), &mut rng);
    points.column_mut(0).mapv_inplace(|x| x + center.0);
    points.column_mut(1).mapv_inplace(|y| y + center.1);
    points
}

fn two_blobs() -> Array2<f64> {
    concatenate![
        Axis(0),
        blob(50, (-2.0, 0.0), 0.2, 11),
        blob(50, (2.0, 0.0), 0.2, 12)
    ]
}

/// Fraction of points whose label agrees with the blob they came from, under the better of the
/// two label assignments.
fn two_blob_accuracy(labels: &[usize]) -> f64 {
    let agree = labels
        .iter()
        .enumerate()
        .filter(|&(i, &label)| (i < 50) == (label == 0))
        .count();
    let best = agree.max(labels.len() - agree);
    best as f64 / labels.len() as f64
}

#[cfg(test)]
mod gap_statistic_tests {
    use super::*;

    #[test]
    fn test_single_blob_selects_one_cluster() {
        let data = blob(100, (0.0, 0.0), 1.0, 5);
        let config = GapStatisticConfig::default().with_n_samples(50).with_seed(21);
        let result = data.gap_statistic(&KMeans::new(), &config).unwrap();

        assert_eq!(result.count, ClusterCount::Selected(1));
        assert_eq!(result.k(), 1);
        assert!(result.labels.iter().all(|&l| l == 0));
        assert_eq!(result.history.len(), 2);
    }

    #[test]
    fn test_two_blobs_select_two_clusters() {
        let data = two_blobs();
        let config = GapStatisticConfig::default().with_n_samples(100).with_seed(3);
        let result = data.gap_statistic(&KMeans::new(), &config).unwrap();

        assert_eq!(result.k(), 2);
        assert_eq!(result.labels.len(), 100);
        assert!(result.labels.iter().all(|&l| l < 2));
        assert!(two_blob_accuracy(&result.labels) >= 0.95);

        // The stop fired on the third evaluation
        assert_eq!(result.history.len(), 3);
        let third = result.history[2];
        assert!(third.delta_gap < third.standard_error);
    }

    #[test]
    fn test_cutoff_of_one_reports_sentinel() {
        let data = two_blobs();
        let config = GapStatisticConfig::default()
            .with_n_samples(30)
            .with_cutoff(Some(1))
            .with_seed(3);
        let result = data.gap_statistic(&KMeans::new(), &config).unwrap();

        assert_eq!(result.count, ClusterCount::CutoffExceeded);
        assert_eq!(result.k(), -1);
        assert_eq!(result.labels, vec![0; 100]);
        // k = 2 is still evaluated to decide on k = 1
        let evaluated: Vec<usize> = result.history.iter().map(|r| r.k).collect();
        assert_eq!(evaluated, vec![1, 2]);
    }

    #[test]
    fn test_cutoff_monotonicity() {
        let data = two_blobs();
        let algorithm = KMeans::new().with_n_init(5);
        let base = GapStatisticConfig::default().with_n_samples(40).with_seed(8);

        let results: Vec<_> = [Some(2), Some(3), Some(10), None]
            .into_iter()
            .map(|cutoff| {
                data.gap_statistic(&algorithm, &base.clone().with_cutoff(cutoff))
                    .unwrap()
            })
            .collect();

        for result in &results {
            assert_eq!(result.count, ClusterCount::Selected(2));
            assert_eq!(result.labels, results[0].labels);
        }
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let data = two_blobs();
        let algorithm = KMeans::new().with_n_init(3);
        let sequential = GapStatisticConfig::default().with_n_samples(24).with_seed(99);
        let parallel = sequential.clone().with_n_processes(4);

        let a = data.gap_statistic(&algorithm, &sequential).unwrap();
        let b = data.gap_statistic(&algorithm, &parallel).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_result_serializes() {
        let data = two_blobs();
        let config = GapStatisticConfig::default().with_n_samples(10).with_seed(1);
        let result = data.gap_statistic(&KMeans::new(), &config).unwrap();

        let json = serde_json::to_string(&result).unwrap();
        let restored: single_clustering::GapStatisticResult = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.count, result.count);
        assert_eq!(restored.labels, result.labels);
    }
}

#[cfg(test)]
mod hierarchy_tests {
    use super::*;

    #[test]
    fn test_two_blob_tree() {
        let data = two_blobs();
        let config = HierarchyConfig::default()
            .with_gap(GapStatisticConfig::default().with_n_samples(50).with_seed(6));
        let tree = data
            .hierarchical_clusters(&NoReduction, &KMeans::new(), &config)
            .unwrap();

        assert_eq!(tree.k(), 2);
        assert_eq!(tree.children().len(), 2);
        for child in tree.children() {
            assert!(matches!(child, ClusterTree::Leaf { .. }));
            assert_eq!(child.k(), 1);
        }

        let labels: Vec<usize> = tree
            .leaf_labels(100)
            .into_iter()
            .map(|label| label.unwrap())
            .collect();
        assert!(two_blob_accuracy(&labels) >= 0.95);
    }

    /// Cells × genes counts: the first half of the cells express genes `0..10`, the second
    /// half genes `10..20`.
    fn two_cell_types(n_cells: usize, seed: u64) -> CsrMatrix<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let high = Normal::new(8.0, 1.5).unwrap();
        let low = Normal::new(0.2, 0.5).unwrap();

        let mut coo = CooMatrix::new(n_cells, 20);
        for cell in 0..n_cells {
            let first_type = cell < n_cells / 2;
            for gene in 0..20 {
                let expressed = (gene < 10) == first_type;
                let draw: f64 = if expressed {
                    high.sample(&mut rng)
                } else {
                    low.sample(&mut rng)
                };
                let count = draw.round().max(0.0);
                if count > 0.0 {
                    coo.push(cell, gene, count);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    #[test]
    fn test_pipeline_from_counts_to_markers() {
        let counts = two_cell_types(60, 4);
        let (counts, kept_genes) =
            drop_genes(&counts, &GeneFilter::default().with_min_cells(3)).unwrap();
        assert_eq!(kept_genes.len(), 20);

        let normalized = log_normalize(&counts).unwrap();
        let dense = to_dense(&normalized);

        let config = HierarchyConfig::default()
            .with_min_cluster_size(40)
            .with_gap(GapStatisticConfig::default().with_n_samples(30).with_seed(12));
        let tree = dense
            .hierarchical_clusters(&PcaReducer::new(5), &KMeans::new(), &config)
            .unwrap();
        assert_eq!(tree.k(), 2);

        // Subsets of 30 cells are below the minimum size and stay leaves
        for child in tree.children() {
            assert_eq!(child.indices().len(), 30);
            let first_type = child.indices().iter().filter(|&&i| i < 30).count();
            assert!(first_type == 0 || first_type == 30);
        }

        let labels: Vec<usize> = tree.leaf_labels(60).into_iter().map(|l| l.unwrap()).collect();
        let markers = find_markers(&normalized, &labels, 5).unwrap();
        assert_eq!(markers.len(), 2);
        for cluster in &markers {
            assert_eq!(cluster.markers.len(), 5);
            let first_type = labels[0] == cluster.cluster;
            for marker in &cluster.markers {
                assert_eq!(marker.gene < 10, first_type);
                assert!(marker.adjusted_p_value < 0.01);
            }
        }
    }
}
