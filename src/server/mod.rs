//! HTTP front exposing the cache as a JSON service.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE stream of cache notifications

pub mod api;
pub mod streaming;

pub use api::{build_router, AppState};
