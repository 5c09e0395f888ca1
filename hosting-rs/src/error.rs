//! Error types for hosting-rs

use thiserror::Error;

/// Result type alias for hosting operations
pub type Result<T> = std::result::Result<T, HostingError>;

/// Hosting error types
#[derive(Error, Debug)]
pub enum HostingError {
    /// A hostname was registered twice
    #[error("App already exists: {0}")]
    AlreadyExists(String),

    /// An edit or removal referenced an unknown hostname
    #[error("App does not exist: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),
}
