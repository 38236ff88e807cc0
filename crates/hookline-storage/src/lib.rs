//! Hookline Storage - Campaign, group and delivery unit persistence
//!
//! PostgreSQL repositories plus an in-memory store implementing the same
//! traits.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
