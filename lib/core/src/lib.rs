//! Core identifiers and error handling for chainweave.
//!
//! Every other crate in the workspace builds on the typed identifiers and the
//! rootcause-backed `Result` alias defined here.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ExecutionId, NodeExecutionId, ParseIdError, UserId, WorkflowId};
