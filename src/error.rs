use thiserror::Error;

/// Errors raised by the supervisor and its workers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn process {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// Every file-save port is held by an active recording.
    #[error("No free UDP port left for file saving")]
    NoFreePort,

    #[error("Invalid UDP port list: {0:?}")]
    InvalidPortList(String),
}

pub type Result<T> = std::result::Result<T, Error>;
