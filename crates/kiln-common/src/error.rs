use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, KilnError>;
