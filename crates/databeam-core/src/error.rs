use thiserror::Error;

/// Errors raised by the core helpers.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required environment variable is missing or empty.
    #[error("environment error: {0}")]
    Env(String),

    /// A configuration value parsed but is semantically invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
