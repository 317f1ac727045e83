//! Error types for RTDE operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RtdeError>;

#[derive(Error, Debug)]
pub enum RtdeError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Recipe registration rejected: {0}")]
    Registration(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("RTDE protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RtdeError {
    /// True for failures of the underlying connection rather than of the
    /// data that travelled over it.
    pub fn is_transport(&self) -> bool {
        matches!(self, RtdeError::Connection(_) | RtdeError::Io(_))
    }
}
