//! HTTP control plane

pub mod handlers;
pub mod routes;

pub use routes::{create_api_routes, AppState};
