//! Hookline Common - Shared types and configuration
//!
//! This crate provides the configuration model, error taxonomy and
//! recipient/identifier types shared across all Hookline components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
