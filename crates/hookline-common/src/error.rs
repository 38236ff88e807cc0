//! Error types for Hookline

use thiserror::Error;

/// Main error type for Hookline
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Import error: {0}")]
    Import(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Hookline
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Template(_) => 422,
            Error::NotFound(_) => 404,
            Error::Unauthorized(_) => 401,
            Error::Import(_) => 400,
            Error::Transport(_) => 502,
            Error::Config(_)
            | Error::Database(_)
            | Error::Storage(_)
            | Error::Internal(_)
            | Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Template(_) => "TEMPLATE_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Import(_) => "IMPORT_ERROR",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Internal(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
