//! Postgres-backed stores for the engine.
//!
//! This module provides persistence for:
//! - Workflow graphs (the workflow source)
//! - Runs and their node steps
//! - Usage records and plan assignments

pub mod run_store;
pub mod usage_store;
pub mod workflow;

pub use run_store::PgRunStore;
pub use usage_store::PgUsageStore;
pub use workflow::PgWorkflowSource;

/// A decode error for a column that held an unexpected value.
fn invalid_data(message: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    )))
}
