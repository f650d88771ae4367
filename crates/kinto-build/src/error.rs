//! Build client error types.

use thiserror::Error;

/// Errors reported by a build client.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The build service refused the request (already finished, bad input).
    #[error("build rejected: {0}")]
    Rejected(String),

    #[error("build service unavailable: {0}")]
    Unavailable(String),
}

pub type BuildResult<T> = Result<T, BuildError>;
