//! Common utilities and types for Model Serve
//!
//! This crate provides shared functionality used across the Model Serve workspace,
//! including the error taxonomy, small value types, and utility functions.

pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{AllocationError, CacheError, Error, FetchError, FetchErrorKind, Result};
pub use types::*;
