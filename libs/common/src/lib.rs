//! Gateway basic library
//!
//! Provides functions shared by all services:
//! - logging bootstrap with runtime level changes
//! - shutdown signal handling
//! - API response envelopes

pub mod api_types;
pub mod logging;
pub mod shutdown;

// Re-export commonly used API types
pub use api_types::{ErrorInfo, ErrorResponse, SuccessResponse};

// Re-export AppError when axum feature is enabled
#[cfg(feature = "axum")]
pub use api_types::AppError;
