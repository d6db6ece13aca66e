use thiserror::Error;

/// Setup-time failures. Anything in here stops the process before the
/// conversation loop starts.
#[derive(Debug, Error)]
pub enum TalkbackError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TalkbackError>;
