//! Model access for AI-driven routing.
//!
//! This crate provides:
//!
//! - **Backends**: The `ModelBackend` trait, request/response types, and an
//!   OpenAI-compatible HTTP implementation
//! - **Pricing**: Per-model token prices used for admission estimates and settlement
//! - **Routing**: Prompt construction for path selection and parsing of the model's decision

pub mod backend;
pub mod error;
pub mod openai;
pub mod pricing;
pub mod routing;

pub use backend::{ModelBackend, ModelRequest, ModelResponse, StaticBackend, TokenUsage};
pub use error::ModelError;
pub use openai::{ModelSettings, OpenAiCompatibleBackend};
pub use pricing::{ModelPrice, PricingTable};
pub use routing::{RouteChoice, RouteDecision, RouteOption, build_routing_request, parse_decision};
