//! Error types for model access.

use std::fmt;

/// Errors from model backends and decision parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The backend could not be constructed or reached.
    Unavailable { details: String },
    /// The provider answered with a non-success status.
    RequestFailed { status: Option<u16>, details: String },
    /// The provider's answer could not be interpreted.
    InvalidResponse { details: String },
    /// The request did not finish within the configured timeout.
    Timeout,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "model backend unavailable: {details}"),
            Self::RequestFailed {
                status: Some(status),
                details,
            } => write!(f, "model request failed with status {status}: {details}"),
            Self::RequestFailed {
                status: None,
                details,
            } => write!(f, "model request failed: {details}"),
            Self::InvalidResponse { details } => {
                write!(f, "invalid model response: {details}")
            }
            Self::Timeout => write!(f, "model request timed out"),
        }
    }
}

impl std::error::Error for ModelError {}
