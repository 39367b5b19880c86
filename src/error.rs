use thiserror::Error;

use crate::comm::ProtocolError;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Exchange error: {0}")]
    Exchange(#[from] tonic::Status),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Command `{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;
