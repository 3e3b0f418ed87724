use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Configuration error:\n{0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HeraldError>;
