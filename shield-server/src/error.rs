use hyper::StatusCode;
use thiserror::Error;

/// Failures surfaced by registry, dispatcher and handshake operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShieldError {
    /// Missing or malformed request fields. Client-correctable.
    #[error("{0}")]
    Validation(String),
    /// SOS raised for an identity without a location fix.
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    NotFound(String),
}

impl ShieldError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShieldError::Validation(_) | ShieldError::Precondition(_) => StatusCode::BAD_REQUEST,
            ShieldError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

pub type ShieldResult<T> = Result<T, ShieldError>;
