//! Error taxonomy returned by every master entry point.

use thiserror::Error;

use crate::actors::ActorError;
use crate::allocator::AllocatorError;
use crate::operator::validation::ValidationError as OperatorValidationError;
use crate::registry::RegistryError;
use crate::scheduler::validation::ValidationError as SchedulerValidationError;

/// Outcome of a rejected call.
///
/// `Accepted` is the `Ok` side of every entry point; everything a caller can
/// see go wrong is one of these variants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// Malformed or incomplete call or operation. Never retried.
    #[error("{0}")]
    BadRequest(String),

    /// The principal is not allowed to perform the action.
    #[error("{0}")]
    Forbidden(String),

    /// Referenced agent, framework or machine is absent.
    #[error("{0}")]
    NotFound(String),

    /// The operation could not be applied against the current resources.
    #[error("{0}")]
    Conflict(String),

    /// A conflicting lifecycle transition is already in flight.
    #[error("{0}")]
    Unavailable(String),

    /// Registry or actor invariant violated; the master is going down.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl MasterError {
    /// Returns true if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MasterError::Conflict(_) | MasterError::Unavailable(_))
    }

    /// Short machine-readable code for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            MasterError::BadRequest(_) => "bad_request",
            MasterError::Forbidden(_) => "forbidden",
            MasterError::NotFound(_) => "not_found",
            MasterError::Conflict(_) => "conflict",
            MasterError::Unavailable(_) => "service_unavailable",
            MasterError::Fatal(_) => "fatal",
        }
    }

    pub(crate) fn actor_stopped() -> Self {
        MasterError::Fatal("master actor is not running".to_string())
    }
}

impl From<SchedulerValidationError> for MasterError {
    fn from(err: SchedulerValidationError) -> Self {
        MasterError::BadRequest(format!("Failed to validate scheduler::Call: {err}"))
    }
}

impl From<OperatorValidationError> for MasterError {
    fn from(err: OperatorValidationError) -> Self {
        MasterError::BadRequest(format!("Failed to validate master::Call: {err}"))
    }
}

impl From<RegistryError> for MasterError {
    fn from(err: RegistryError) -> Self {
        MasterError::Conflict(err.to_string())
    }
}

impl From<AllocatorError> for MasterError {
    fn from(err: AllocatorError) -> Self {
        MasterError::Conflict(err.to_string())
    }
}

impl From<ActorError> for MasterError {
    fn from(_: ActorError) -> Self {
        MasterError::actor_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(MasterError::Conflict("x".into()).is_retryable());
        assert!(MasterError::Unavailable("x".into()).is_retryable());
        assert!(!MasterError::BadRequest("x".into()).is_retryable());
        assert!(!MasterError::Forbidden("x".into()).is_retryable());
        assert!(!MasterError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn test_registry_error_maps_to_conflict() {
        let err: MasterError = RegistryError::Unavailable("log not writable".into()).into();
        assert!(matches!(err, MasterError::Conflict(msg) if msg.contains("log not writable")));
    }
}
