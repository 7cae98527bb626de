use thiserror::Error;

use crate::backend::spec::BackendError;

/// Failure taxonomy for the capture subsystem.
///
/// `Precondition` and `NullAccess` signal programmer errors; neither leaves a
/// partially opened session behind. `ResourceExhausted` covers device-side
/// materialization failures and always rolls the session back to idle before
/// surfacing. Capture setup is not safe to retry blindly, so none of these are
/// retried internally.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("precondition violated: {message}")]
    Precondition { message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("null access: {message}")]
    NullAccess { message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CaptureError {
    pub fn precondition(message: impl Into<String>) -> Self {
        CaptureError::Precondition {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        CaptureError::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn null_access(message: impl Into<String>) -> Self {
        CaptureError::NullAccess {
            message: message.into(),
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
