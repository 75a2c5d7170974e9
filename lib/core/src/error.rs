//! Shared error plumbing.
//!
//! Crates define their own error enums next to the code that raises them and
//! return them wrapped in a rootcause `Report` at their public boundary.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
