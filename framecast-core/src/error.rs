use std::net::IpAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream key not found")]
    KeyNotFound,

    #[error("Stream key is inactive")]
    KeyInactive,

    #[error("Stream key expired at {0}")]
    KeyExpired(chrono::DateTime<chrono::Utc>),

    #[error("IP {0} is not in the key's allowlist")]
    IpNotAllowed(IpAddr),

    #[error("Alias not found: {0}")]
    AliasNotFound(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a publish rejection rather than a fault.
    ///
    /// Rejections terminate the offending session; they are never
    /// escalated to the orchestrator.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound
                | Self::KeyInactive
                | Self::KeyExpired(_)
                | Self::IpNotAllowed(_)
                | Self::AliasNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
