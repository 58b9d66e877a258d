use thiserror::Error;

use crate::identity::IdentityError;

/// Scopegate error types
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid OAuth callback: {0}")]
    InvalidCallback(String),

    #[error("Identity broker error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider catalogue error: {0}")]
    Catalogue(String),

    #[error("Turn stream error: {0}")]
    StreamError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for scopegate operations
pub type Result<T> = std::result::Result<T, GateError>;
