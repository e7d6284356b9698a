//! Error types for the unwind_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for unwind_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No signed-in user was supplied when starting an exercise
    #[error("No authenticated user")]
    NotAuthenticated,

    /// Remote log store call failed
    #[error("Remote log error: {0}")]
    Remote(String),

    /// Local draft storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Exercise type not present in the catalog
    #[error("Unknown exercise: {0}")]
    UnknownExercise(String),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    Session(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
