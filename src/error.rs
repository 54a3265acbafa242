//! Error types for the reconstruction pipeline
//!
//! Shape and argument problems fail fast; numerically degenerate
//! per-location solves are zero-filled by the callers instead of
//! surfacing here (see the SENSE and eigenvector paths).

use thiserror::Error;

/// Errors produced by the reconstruction core
#[derive(Debug, Clone, Error)]
pub enum ReconError {
    /// Array dimensions do not match what the operation requires
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A covariance (or other Hermitian) matrix failed Cholesky factorization.
    /// Indicates invalid input data, not a runtime transient.
    #[error("matrix is not positive definite: {0}")]
    NotPositiveDefinite(String),

    /// A linear system could not be solved
    #[error("singular linear system: {0}")]
    Singular(String),

    /// An argument is out of its valid range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for reconstruction operations
pub type Result<T> = std::result::Result<T, ReconError>;
