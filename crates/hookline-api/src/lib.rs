//! Hookline API - REST API server
//!
//! Campaign management, bulk target import and job status endpoints,
//! authenticated with API keys.

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
