//! Error types for the engine binary.

use std::fmt;
use std::path::PathBuf;

/// Errors raised while assembling or driving a run.
#[derive(Debug)]
pub enum AppError {
    /// No workflow definition was given.
    MissingWorkflow,
    /// A file could not be read.
    Read { path: PathBuf, details: String },
    /// A file did not hold the expected JSON.
    Parse { path: PathBuf, details: String },
    /// The configured user id is malformed.
    InvalidUserId { value: String },
    /// The database could not be reached or migrated.
    Database { details: String },
    /// The model backend could not be built.
    Model { details: String },
    /// The workflow could not be executed.
    Execution,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingWorkflow => write!(
                f,
                "no workflow given; pass a path or set RUN__WORKFLOW_PATH"
            ),
            Self::Read { path, details } => {
                write!(f, "failed to read {}: {}", path.display(), details)
            }
            Self::Parse { path, details } => {
                write!(f, "failed to parse {}: {}", path.display(), details)
            }
            Self::InvalidUserId { value } => write!(f, "invalid user id '{}'", value),
            Self::Database { details } => write!(f, "database error: {}", details),
            Self::Model { details } => write!(f, "model backend error: {}", details),
            Self::Execution => write!(f, "workflow execution failed"),
        }
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_path() {
        let err = AppError::Read {
            path: PathBuf::from("/tmp/flow.json"),
            details: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to read /tmp/flow.json: No such file or directory"
        );
    }
}
