use thiserror::Error;

#[derive(Error, Debug)]
pub enum VesperError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Chain error: {0}")]
    ChainError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for VesperError {
    fn from(err: serde_json::Error) -> Self {
        VesperError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VesperError>;
