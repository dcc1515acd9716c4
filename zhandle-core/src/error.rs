//! Error taxonomy for handle and buffer operations.

use std::os::raw::c_int;

use crate::failure::FailureSignal;

/// Failure surfaced by an explicit, caller-invoked operation.
/// Double release is prevented by idempotency and has no variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("foreign resource acquisition failed: {0}")]
    AcquisitionFailure(FailureSignal),
    #[error("foreign resource release failed: {0}")]
    ReleaseFailure(FailureSignal),
    #[error("buffer too small: need {required} bytes, got {actual}")]
    InvalidBufferSize { required: usize, actual: usize },
    #[error("foreign call rejected adopted buffer: {0}")]
    BufferRejected(FailureSignal),
    #[error("foreign call failed: {0}")]
    Foreign(FailureSignal),
    #[error("foreign resource already released")]
    Closed,
}

pub type Result<T> = std::result::Result<T, HandleError>;

impl HandleError {
    /// The foreign signal behind this error, if it came from the foreign side.
    pub fn signal(&self) -> Option<&FailureSignal> {
        match self {
            HandleError::AcquisitionFailure(s)
            | HandleError::ReleaseFailure(s)
            | HandleError::BufferRejected(s)
            | HandleError::Foreign(s) => Some(s),
            HandleError::InvalidBufferSize { .. } | HandleError::Closed => None,
        }
    }

    /// Foreign error code, for callers that branch on it.
    pub fn code(&self) -> Option<c_int> {
        self.signal().map(FailureSignal::code)
    }
}
