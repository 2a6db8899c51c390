//! # single-clustering
//!
//! Clustering with automatic model-order selection for single-cell data, part of the single-rust ecosystem.
//!
//! The core of the crate chooses the number of clusters with the gap statistic and applies that choice
//! recursively, splitting cells top-down until no subset shows further structure. Around it sit the
//! preprocessing, dimensionality reduction and marker-gene steps of a typical exploratory pipeline over
//! sparse count matrices.
//!
//! ## Core Features
//!
//! - **Gap Statistic**: Selects `k` against a uniform reference drawn from the principal-component box of the data
//! - **Hierarchical Clustering**: Recursive subdivision into a [`ClusterTree`]
//! - **Parallel Null Sampling**: Reference samples evaluated on a worker pool with per-job seeds, reproducible for any thread count
//! - **Sparse Matrix Support**: Filtering, normalization and marker detection on `CsrMatrix` from nalgebra-sparse
//!
//! ## Quick Start
//!
//! Filter and normalize the counts with [`preprocessing`], convert them with
//! [`preprocessing::to_dense`], and call `hierarchical_clusters` through the [`MatrixClustering`]
//! trait with a reducer from [`decomposition`] and [`KMeans`]. Leaf labels from the resulting tree
//! can be passed to [`markers::find_markers`].
//!
//! ## Module Organization
//!
//! - **[`clustering`]**: Gap-statistic engine, hierarchy driver and the k-means algorithm
//! - **[`decomposition`]**: PCA and the reducers applied between hierarchy levels
//! - **[`preprocessing`]**: Cell and gene filters, log normalization, expression ordering
//! - **[`markers`]**: One-vs-rest differential expression per cluster
//! - **[`error`]**: The [`ClusteringError`] taxonomy

pub mod clustering;
pub mod decomposition;
pub mod error;
pub mod markers;
pub mod preprocessing;

pub use clustering::{
    ClusterAlgorithm, ClusterCount, ClusterTree, DimReduce, FittedClustering, GapStatisticConfig,
    GapStatisticResult, HierarchyConfig, KMeans, MatrixClustering,
};
pub use error::{ClusteringError, Result};
