//! Error types for reservation operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reservation error kinds
///
/// Every admission operation is all-or-nothing: when one of these is
/// returned, the table and the kernel scheduler are exactly as they were
/// before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    /// Malformed parameters, period mismatch, DP/non-DP mismatch
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Reservation table is full
    #[error("Reservation table full ({capacity} entries)")]
    OutOfCapacity { capacity: usize },

    /// Schedulability check failed
    #[error("Not schedulable: {0}")]
    Infeasible(String),

    /// The kernel scheduler refused or failed the operation
    #[error("Kernel scheduler error: {0}")]
    Kernel(String),

    /// Unknown thread, task or reservation id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Reservation is already watched
    #[error("Busy: {0}")]
    Busy(String),
}

/// Result type for reservation operations
pub type Result<T> = std::result::Result<T, ReserveError>;

/// Wire-level error codes carried by IPC error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request or parameters
    InvalidRequest,
    /// Table capacity exhausted
    OutOfCapacity,
    /// Would miss a deadline
    Infeasible,
    /// Kernel refused the operation
    PermissionDenied,
    /// Resource not found
    NotFound,
    /// Resource busy
    Busy,
}

impl ReserveError {
    /// Convert to IPC error code
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_) => ErrorCode::InvalidRequest,
            Self::OutOfCapacity { .. } => ErrorCode::OutOfCapacity,
            Self::Infeasible(_) => ErrorCode::Infeasible,
            Self::Kernel(_) => ErrorCode::PermissionDenied,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Busy(_) => ErrorCode::Busy,
        }
    }

    /// Check if this error came from a failed schedulability check
    pub fn is_infeasible(&self) -> bool {
        matches!(self, Self::Infeasible(_))
    }
}

/// Failure reported by the kernel scheduler collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed: {reason}")]
pub struct KernelError {
    /// Kernel operation that failed
    pub op: &'static str,
    /// Reason given by the kernel
    pub reason: String,
}

impl KernelError {
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

impl From<KernelError> for ReserveError {
    fn from(err: KernelError) -> Self {
        Self::Kernel(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ReserveError::Invalid("x".into()).to_error_code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            ReserveError::OutOfCapacity { capacity: 4 }.to_error_code(),
            ErrorCode::OutOfCapacity
        );
        assert_eq!(
            ReserveError::Kernel("x".into()).to_error_code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(ReserveError::Busy("x".into()).to_error_code(), ErrorCode::Busy);
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: ReserveError = KernelError::new("add_timeslice", "no such thread").into();
        assert_eq!(
            err,
            ReserveError::Kernel("add_timeslice failed: no such thread".into())
        );
    }
}
