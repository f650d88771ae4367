//! Controller error types.
//!
//! Collaborator errors are classified into the kinds callers branch on.
//! Workflows prefix the failing step with [`ControlError::at`] before
//! returning, so the message names where it broke.

use kinto_build::BuildError;
use kinto_core::{InvalidTransition, ManifestError};
use kinto_state::{StoreError, StoreErrorKind};
use thiserror::Error;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate, stale write, or a move the release state machine forbids.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The caller cancelled, or a watch destination refused an event.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Unavailable,
    PermissionDenied,
    Aborted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::NotFound(_) => ErrorKind::NotFound,
            ControlError::Conflict(_) => ErrorKind::Conflict,
            ControlError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ControlError::Unavailable(_) => ErrorKind::Unavailable,
            ControlError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ControlError::Aborted(_) => ErrorKind::Aborted,
            ControlError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ControlError::NotFound(m)
            | ControlError::Conflict(m)
            | ControlError::InvalidArgument(m)
            | ControlError::Unavailable(m)
            | ControlError::PermissionDenied(m)
            | ControlError::Aborted(m)
            | ControlError::Internal(m) => m,
        }
    }

    /// Prefix the message with the workflow step that failed, keeping the kind.
    pub fn at(self, step: &str) -> Self {
        let wrap = |m: String| format!("{step}: {m}");
        match self {
            ControlError::NotFound(m) => ControlError::NotFound(wrap(m)),
            ControlError::Conflict(m) => ControlError::Conflict(wrap(m)),
            ControlError::InvalidArgument(m) => ControlError::InvalidArgument(wrap(m)),
            ControlError::Unavailable(m) => ControlError::Unavailable(wrap(m)),
            ControlError::PermissionDenied(m) => ControlError::PermissionDenied(wrap(m)),
            ControlError::Aborted(m) => ControlError::Aborted(wrap(m)),
            ControlError::Internal(m) => ControlError::Internal(wrap(m)),
        }
    }
}

/// Classify a collaborator error and tag it with the failing step.
pub(crate) trait AtStep<T> {
    fn at(self, step: &str) -> ControlResult<T>;
}

impl<T, E: Into<ControlError>> AtStep<T> for Result<T, E> {
    fn at(self, step: &str) -> ControlResult<T> {
        self.map_err(|e| e.into().at(step))
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        let msg = err.to_string();
        match err.kind() {
            StoreErrorKind::NotFound => ControlError::NotFound(msg),
            StoreErrorKind::Conflict => ControlError::Conflict(msg),
            StoreErrorKind::Unavailable => ControlError::Unavailable(msg),
            StoreErrorKind::Corrupt => ControlError::Internal(msg),
        }
    }
}

impl From<BuildError> for ControlError {
    fn from(err: BuildError) -> Self {
        let msg = err.to_string();
        match err {
            BuildError::NotFound(_) => ControlError::NotFound(msg),
            BuildError::Rejected(_) => ControlError::Conflict(msg),
            BuildError::Unavailable(_) => ControlError::Unavailable(msg),
        }
    }
}

impl From<ManifestError> for ControlError {
    fn from(err: ManifestError) -> Self {
        ControlError::InvalidArgument(err.to_string())
    }
}

impl From<InvalidTransition> for ControlError {
    fn from(err: InvalidTransition) -> Self {
        ControlError::Conflict(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinto_core::BuildState;

    #[test]
    fn store_errors_keep_their_kind() {
        let err: ControlError = StoreError::Conflict("version".into()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err: ControlError = StoreError::Transaction("io".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let err: ControlError = StoreError::Deserialize("bad json".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn at_prefixes_step_and_keeps_kind() {
        let err = ControlError::NotFound("block api".into()).at("rollback");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "rollback: block api");
        assert_eq!(err.to_string(), "not found: rollback: block api");
    }

    #[test]
    fn fsm_violations_are_conflicts() {
        let err: ControlError = BuildState::Succeeded
            .transition(BuildState::Building)
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
