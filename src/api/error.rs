//! Error types for the typed API facade

use crate::rpc::error::RpcError;

/// Failures of a typed remote call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Session-level failure, including remote application errors
    #[error("RPC error: {0}")]
    Rpc(RpcError),

    /// The remote answered with a value of the wrong shape
    #[error("Unexpected result from {method}: expected {expected}, got {actual}")]
    UnexpectedResult {
        method: String,
        expected: &'static str,
        actual: String,
    },

    /// The remote returned a non-positive handle from buffer creation
    #[error("Buffer creation failed: remote returned handle {0}")]
    BufferCreationFailed(i64),

    /// The configured per-call timeout elapsed
    #[error("Request timed out: {method}")]
    Timeout { method: String },
}

impl From<RpcError> for ApiError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Timeout { method } => ApiError::Timeout { method },
            other => ApiError::Rpc(other),
        }
    }
}

impl ApiError {
    pub(crate) fn unexpected(method: &str, expected: &'static str, actual: &crate::rpc::Value) -> Self {
        ApiError::UnexpectedResult {
            method: method.to_string(),
            expected,
            actual: format!("{} {}", actual.kind(), actual),
        }
    }

    /// Remote rejected the arguments (out-of-range positions and the like)
    pub fn is_validation(&self) -> bool {
        matches!(self, ApiError::Rpc(error) if error.is_validation())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ApiError::Rpc(error) if error.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error::RemoteError;

    #[test]
    fn test_timeout_is_lifted() {
        let error = ApiError::from(RpcError::Timeout {
            method: "nvim_input".to_string(),
        });
        assert!(matches!(error, ApiError::Timeout { ref method } if method == "nvim_input"));
    }

    #[test]
    fn test_validation_classification() {
        let validation = ApiError::from(RpcError::Remote(RemoteError::validation("out of range")));
        assert!(validation.is_validation());
        assert!(!validation.is_closed());

        let exception = ApiError::from(RpcError::Remote(RemoteError::exception("boom")));
        assert!(!exception.is_validation());

        assert!(ApiError::from(RpcError::SessionClosed).is_closed());
    }
}
