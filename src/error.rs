use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("already running")]
    AlreadyRunning,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error(transparent)]
    Core(#[from] peerlink_core::error::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
