use anyhow::anyhow;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Eigenvalues below this (relative to the largest) are treated as zero when
/// components are recovered from the Gram matrix.
const GRAM_RANK_TOLERANCE: f64 = 1e-12;

/// Principal component analysis fit by eigendecomposition of the covariance
/// matrix.
///
/// When there are fewer observations than features the n×n Gram matrix is
/// decomposed instead and the feature-space components are recovered from it,
/// so at most `n_observations` components with non-zero variance are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    mean: Array1<f64>,
    /// Components as rows, shape (n_components, n_features).
    components: Array2<f64>,
    explained_variance: Array1<f64>,
}

impl Pca {
    /// Fit `n_components` principal axes on `data` (observations × features).
    ///
    /// The data is centered internally; the mean is stored and re-applied by
    /// [`Pca::inverse_transform`].
    pub fn fit(data: ArrayView2<'_, f64>, n_components: usize) -> anyhow::Result<Self> {
        let (n_obs, n_features) = data.dim();
        if n_obs == 0 || n_features == 0 {
            return Err(anyhow!("Cannot fit PCA on an empty matrix"));
        }
        if n_components == 0 {
            return Err(anyhow!("n_components must be at least 1"));
        }
        if n_components > n_features {
            return Err(anyhow!(
                "n_components ({}) cannot exceed the number of features ({})",
                n_components,
                n_features
            ));
        }

        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("Cannot compute column means"))?;
        let centered = &data - &mean;
        let divisor = if n_obs > 1 { (n_obs - 1) as f64 } else { 1.0 };

        let (components, explained_variance) = if n_obs < n_features {
            gram_components(&centered, n_components, divisor)
        } else {
            covariance_components(&centered, n_components, divisor)
        };

        Ok(Pca {
            mean,
            components,
            explained_variance,
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.components.ncols()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    /// Variance of the data along each retained component, descending.
    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    /// Project `data` into component space: `(X - mean) · Cᵀ`.
    pub fn transform(&self, data: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
        if data.ncols() != self.n_features() {
            return Err(anyhow!(
                "Expected {} features, got {}",
                self.n_features(),
                data.ncols()
            ));
        }
        let centered = &data - &self.mean;
        Ok(centered.dot(&self.components.t()))
    }

    /// Map component-space coordinates back to feature space: `Y · C + mean`.
    pub fn inverse_transform(&self, projected: ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
        if projected.ncols() != self.n_components() {
            return Err(anyhow!(
                "Expected {} components, got {}",
                self.n_components(),
                projected.ncols()
            ));
        }
        Ok(projected.dot(&self.components) + &self.mean)
    }
}

/// Indices of `eigenvalues` sorted by value, largest first.
fn descending_order(eigenvalues: &nalgebra::DVector<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

fn covariance_components(
    centered: &Array2<f64>,
    n_components: usize,
    divisor: f64,
) -> (Array2<f64>, Array1<f64>) {
    let n_features = centered.ncols();
    let cov = centered.t().dot(centered) / divisor;
    let cov = DMatrix::from_fn(n_features, n_features, |i, j| cov[[i, j]]);
    let eigen = SymmetricEigen::new(cov);
    let order = descending_order(&eigen.eigenvalues);

    let components = Array2::from_shape_fn((n_components, n_features), |(c, j)| {
        eigen.eigenvectors[(j, order[c])]
    });
    let variance = Array1::from_iter(
        order
            .iter()
            .take(n_components)
            .map(|&idx| eigen.eigenvalues[idx].max(0.0)),
    );
    (components, variance)
}

fn gram_components(
    centered: &Array2<f64>,
    n_components: usize,
    divisor: f64,
) -> (Array2<f64>, Array1<f64>) {
    let (n_obs, n_features) = centered.dim();
    let gram = centered.dot(&centered.t()) / divisor;
    let gram = DMatrix::from_fn(n_obs, n_obs, |i, j| gram[[i, j]]);
    let eigen = SymmetricEigen::new(gram);
    let order = descending_order(&eigen.eigenvalues);

    let largest = order
        .first()
        .map(|&idx| eigen.eigenvalues[idx])
        .unwrap_or(0.0);
    let kept: Vec<usize> = order
        .into_iter()
        .take(n_components)
        .filter(|&idx| eigen.eigenvalues[idx] > GRAM_RANK_TOLERANCE * largest.max(1.0))
        .collect();

    // v = Xᵀ u / sqrt(λ · (n - 1))
    let mut components = Array2::zeros((kept.len(), n_features));
    let mut variance = Array1::zeros(kept.len());
    for (c, &idx) in kept.iter().enumerate() {
        let lambda = eigen.eigenvalues[idx];
        let u = Array1::from_iter((0..n_obs).map(|i| eigen.eigenvectors[(i, idx)]));
        let v = centered.t().dot(&u) / (lambda * divisor).sqrt();
        components.row_mut(c).assign(&v);
        variance[c] = lambda;
    }
    (components, variance)
}
