use thiserror::Error;

pub type Result<T> = std::result::Result<T, GantryError>;

#[derive(Debug, Error)]
pub enum GantryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no entry produced within {seconds}s, upstream appears stalled")]
    Stalled { seconds: u64 },

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}
