use thiserror::Error;

/// Result alias for the clustering engine and the hierarchy driver.
pub type Result<T> = std::result::Result<T, ClusteringError>;

/// A single failed job reported by the parallel evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    /// Position of the job in the submitted batch.
    pub index: usize,
    /// Rendered error chain of the failure.
    pub message: String,
}

/// Errors raised while selecting a cluster count or building a cluster tree.
///
/// Exhausting the configured cutoff is *not* an error, see
/// [`ClusterCount::CutoffExceeded`](crate::clustering::ClusterCount::CutoffExceeded).
#[derive(Debug, Error)]
pub enum ClusteringError {
    #[error("input matrix has no observations or no features")]
    EmptyInput,

    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },

    /// The clustering algorithm could not produce `k` clusters for the data.
    #[error("clustering algorithm failed to fit k={k}: {source:#}")]
    Fit {
        k: usize,
        #[source]
        source: anyhow::Error,
    },

    /// One or more parallel jobs failed; no partial results are returned.
    #[error("{} of {total} parallel jobs failed{}", .failures.len(), first_failure(.failures))]
    Worker {
        total: usize,
        failures: Vec<JobFailure>,
    },

    /// A recursive subdivision produced a subset that cannot be clustered.
    #[error("cannot partition {n_observations} observations at depth {depth}: {reason}")]
    Partition {
        depth: usize,
        n_observations: usize,
        reason: String,
        #[source]
        source: Option<Box<ClusteringError>>,
    },

    #[error("dimensionality reduction failed at depth {depth}: {source:#}")]
    DimensionReduction {
        depth: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

fn first_failure(failures: &[JobFailure]) -> String {
    failures
        .first()
        .map(|f| format!(" (job {}: {})", f.index, f.message))
        .unwrap_or_default()
}

impl ClusteringError {
    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        ClusteringError::InvalidParameter {
            name,
            message: message.into(),
        }
    }

    /// True for failures of the clustering algorithm itself, either on the
    /// real data or inside a null-sample worker.
    pub fn is_fit_failure(&self) -> bool {
        matches!(
            self,
            ClusteringError::Fit { .. } | ClusteringError::Worker { .. }
        )
    }
}
