use crate::api::ApiError;
use crate::config::ConfigError;
use crate::host::HostError;
use crate::io::ProcessError;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Remote call failed: {0}")]
    Api(#[from] ApiError),

    #[error("Editor process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Host surface error: {0}")]
    Host(#[from] HostError),

    #[error("Editor lacks required feature {0}")]
    UnsupportedEditor(String),

    #[error("Mirror is not running")]
    NotRunning,

    #[error("Editor exited unexpectedly with status {code:?}")]
    UnexpectedExit { code: Option<i32> },
}

impl MirrorError {
    /// Whether the failure means the remote session is gone
    pub fn is_closed(&self) -> bool {
        match self {
            MirrorError::Api(e) => e.is_closed(),
            MirrorError::NotRunning | MirrorError::UnexpectedExit { .. } => true,
            _ => false,
        }
    }
}
