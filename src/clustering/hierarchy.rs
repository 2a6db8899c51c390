//! Top-down recursive clustering.
//!
//! Each subset of observations is projected with a [`DimReduce`], handed to the gap-statistic
//! engine, and split by the selected labels. Every group is then clustered again from its
//! original, unreduced rows until the engine selects a single cluster.

use ndarray::{ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::gap::{GapStatisticConfig, gap_statistic};
use super::{ClusterAlgorithm, ClusterCount, DimReduce};
use crate::error::{ClusteringError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Settings used for the gap-statistic search at every node.
    pub gap: GapStatisticConfig,
    /// Subsets with fewer observations become leaves without being clustered.
    pub min_cluster_size: usize,
    /// Deepest level a node may sit at. The root is depth 0.
    pub max_depth: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        HierarchyConfig {
            gap: GapStatisticConfig::default(),
            min_cluster_size: 10,
            max_depth: 16,
        }
    }
}

impl HierarchyConfig {
    pub fn with_gap(mut self, gap: GapStatisticConfig) -> Self {
        self.gap = gap;
        self
    }

    pub fn with_min_cluster_size(mut self, min_cluster_size: usize) -> Self {
        self.min_cluster_size = min_cluster_size;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// Result of [`hierarchical_clusters`].
///
/// Indices are row indices into the matrix passed at the root, so the children of a node
/// always partition the node's own indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterTree {
    /// The engine selected a single cluster, or the subset was below the minimum size.
    Leaf { indices: Vec<usize> },
    /// The engine reached its cutoff on this subset without settling on a count.
    Unresolved { indices: Vec<usize> },
    Node {
        indices: Vec<usize>,
        children: Vec<ClusterTree>,
    },
}

impl ClusterTree {
    pub fn indices(&self) -> &[usize] {
        match self {
            ClusterTree::Leaf { indices }
            | ClusterTree::Unresolved { indices }
            | ClusterTree::Node { indices, .. } => indices,
        }
    }

    pub fn children(&self) -> &[ClusterTree] {
        match self {
            ClusterTree::Node { children, .. } => children,
            _ => &[],
        }
    }

    /// Number of clusters at this node; 1 for leaves.
    pub fn k(&self) -> usize {
        match self {
            ClusterTree::Node { children, .. } => children.len(),
            _ => 1,
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, ClusterTree::Node { .. })
    }

    /// The index subsets of the children, in label order.
    pub fn subsets(&self) -> Vec<&[usize]> {
        self.children().iter().map(ClusterTree::indices).collect()
    }

    pub fn n_leaves(&self) -> usize {
        match self {
            ClusterTree::Node { children, .. } => children.iter().map(ClusterTree::n_leaves).sum(),
            _ => 1,
        }
    }

    /// Levels below this node; 0 for a leaf.
    pub fn depth(&self) -> usize {
        self.children()
            .iter()
            .map(|child| child.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Flatten the tree into one label per observation, numbering leaves depth-first.
    ///
    /// Observations in `0..n_observations` that this tree does not cover are `None`.
    pub fn leaf_labels(&self, n_observations: usize) -> Vec<Option<usize>> {
        let mut labels = vec![None; n_observations];
        let mut next = 0;
        self.label_leaves(&mut labels, &mut next);
        labels
    }

    fn label_leaves(&self, labels: &mut [Option<usize>], next: &mut usize) {
        match self {
            ClusterTree::Node { children, .. } => {
                for child in children {
                    child.label_leaves(labels, next);
                }
            }
            leaf => {
                for &i in leaf.indices() {
                    if let Some(slot) = labels.get_mut(i) {
                        *slot = Some(*next);
                    }
                }
                *next += 1;
            }
        }
    }
}

/// Recursively cluster `data` (observations × features) into a [`ClusterTree`].
///
/// At each node the subset is reduced with `reducer` and passed to [`gap_statistic`]. A
/// selected count of 1 gives a leaf, a cutoff gives an [`ClusterTree::Unresolved`] leaf, and
/// any larger count splits the subset by label and recurses on each group. Siblings are built
/// one after another.
///
/// # Errors
///
/// Engine errors at the root propagate unchanged. Below the root, a failed fit, an empty
/// group, or a node deeper than `max_depth` is a [`ClusteringError::Partition`]. A failing
/// reducer is a [`ClusteringError::DimensionReduction`] at any depth.
pub fn hierarchical_clusters<R, A>(
    data: ArrayView2<'_, f64>,
    reducer: &R,
    algorithm: &A,
    config: &HierarchyConfig,
) -> Result<ClusterTree>
where
    R: DimReduce,
    A: ClusterAlgorithm,
{
    if data.nrows() == 0 || data.ncols() == 0 {
        return Err(ClusteringError::EmptyInput);
    }
    let indices: Vec<usize> = (0..data.nrows()).collect();
    build_node(data, indices, 0, reducer, algorithm, config)
}

fn build_node<R, A>(
    data: ArrayView2<'_, f64>,
    indices: Vec<usize>,
    depth: usize,
    reducer: &R,
    algorithm: &A,
    config: &HierarchyConfig,
) -> Result<ClusterTree>
where
    R: DimReduce,
    A: ClusterAlgorithm,
{
    let n_observations = indices.len();
    if depth > config.max_depth {
        return Err(ClusteringError::Partition {
            depth,
            n_observations,
            reason: format!("maximum depth {} exceeded", config.max_depth),
            source: None,
        });
    }
    if n_observations == 0 {
        return Err(ClusteringError::Partition {
            depth,
            n_observations,
            reason: "subset is empty".to_string(),
            source: None,
        });
    }
    if n_observations < config.min_cluster_size {
        debug!(depth, n_observations, "subset below minimum size, keeping as leaf");
        return Ok(ClusterTree::Leaf { indices });
    }

    let subset = data.select(Axis(0), &indices);
    let reduced = reducer
        .reduce(subset.view())
        .map_err(|source| ClusteringError::DimensionReduction { depth, source })?;

    let result = match gap_statistic(reduced.view(), algorithm, &config.gap) {
        Ok(result) => result,
        Err(e) if depth == 0 => return Err(e),
        Err(e) => {
            return Err(ClusteringError::Partition {
                depth,
                n_observations,
                reason: "cluster count search failed".to_string(),
                source: Some(Box::new(e)),
            });
        }
    };

    let k = match result.count {
        ClusterCount::Selected(k) => k,
        ClusterCount::CutoffExceeded => {
            debug!(depth, n_observations, "cutoff reached, keeping as unresolved leaf");
            return Ok(ClusterTree::Unresolved { indices });
        }
    };
    debug!(depth, n_observations, k, "partitioned subset");
    if k == 1 {
        return Ok(ClusterTree::Leaf { indices });
    }

    let groups = partition_by_label(&indices, &result.labels, k);
    if let Some(label) = groups.iter().position(Vec::is_empty) {
        return Err(ClusteringError::Partition {
            depth: depth + 1,
            n_observations: 0,
            reason: format!("cluster {} of {} has no observations", label, k),
            source: None,
        });
    }

    let mut children = Vec::with_capacity(k);
    for group in groups {
        children.push(build_node(data, group, depth + 1, reducer, algorithm, config)?);
    }

    Ok(ClusterTree::Node { indices, children })
}

/// Split `indices` into `k` groups, keeping the original order within each group.
fn partition_by_label(indices: &[usize], labels: &[usize], k: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); k];
    for (&index, &label) in indices.iter().zip(labels) {
        groups[label].push(index);
    }
    groups
}
