use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TokiError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("speech synthesis error: {0}")]
    Synthesis(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("not connected")]
    NotConnected,

    #[error("session is no longer running")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TokiError>;
