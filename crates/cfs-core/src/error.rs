use thiserror::Error;

pub type CfsResult<T> = Result<T, CfsError>;

#[derive(Debug, Error)]
pub enum CfsError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("scan error: {0}")]
    Scan(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
