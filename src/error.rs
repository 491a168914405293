//! Error types for the apex-block-sparse library
//!
//! Only recoverable conditions are represented here. Violated structural
//! invariants (mismatched dimensions, out-of-range blocks) are programmer
//! errors and panic at the call site. The outcome of an iterative solve is
//! reported through [`LinearSolverSummary`](crate::linalg::LinearSolverSummary),
//! never through this type.

use std::io::Error;
use thiserror::Error;

/// Main result type used throughout the apex-block-sparse library
pub type ApexResult<T> = Result<T, ApexError>;

/// Main error type for the apex-block-sparse library
#[derive(Debug, Clone, Error)]
pub enum ApexError {
    /// Linear algebra related errors (conversions into faer types, etc.)
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// IO related errors (text dumps of matrices)
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Thread pool construction errors
    #[error("Thread synchronization error: {0}")]
    ThreadError(String),
}

impl From<Error> for ApexError {
    fn from(err: Error) -> Self {
        ApexError::Io(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for ApexError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        ApexError::ThreadError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_apex_error_display() {
        let error = ApexError::LinearAlgebra("Matrix is singular".to_string());
        assert_eq!(
            error.to_string(),
            "Linear algebra error: Matrix is singular"
        );
    }

    #[test]
    fn test_apex_error_from_io() {
        let io_error = Error::new(ErrorKind::BrokenPipe, "pipe closed");
        let apex_error = ApexError::from(io_error);

        match apex_error {
            ApexError::Io(msg) => assert!(msg.contains("pipe closed")),
            _ => panic!("Expected IO error"),
        }
    }

    #[test]
    fn test_apex_result_err() {
        let result: ApexResult<i32> = Err(ApexError::InvalidInput("zero threads".to_string()));
        assert!(result.is_err());
    }
}
