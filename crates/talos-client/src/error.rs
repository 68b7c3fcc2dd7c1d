//! Talos client errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when talking to the Talos machine API
#[derive(Debug, Error)]
pub enum TalosError {
    /// Credential bundle could not be turned into a TLS identity
    #[error("Invalid credentials: {0}")]
    Credential(String),

    /// Target address could not be turned into an endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Connection or TLS failure before a call completed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The machine API answered with a gRPC error
    #[error("RPC failed ({code:?}): {message}")]
    Rpc {
        /// gRPC status code
        code: tonic::Code,
        /// Status message
        message: String,
    },

    /// A node accepted the call but reported an error in the response metadata
    #[error("Node {node} reported: {message}")]
    Node {
        /// Hostname reported by the node
        node: String,
        /// Error text from the response metadata
        message: String,
    },

    /// The call did not finish within the configured timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Kubeconfig archive or document could not be read
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TalosError {
    /// The remote side already has what was asked for
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            TalosError::Rpc {
                code: tonic::Code::AlreadyExists,
                ..
            }
        )
    }

    /// Retrying without operator intervention can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TalosError::Credential(_) | TalosError::InvalidEndpoint(_) => false,
            TalosError::Rpc { code, .. } => !matches!(
                code,
                tonic::Code::InvalidArgument
                    | tonic::Code::PermissionDenied
                    | tonic::Code::Unauthenticated
                    | tonic::Code::Unimplemented
            ),
            _ => true,
        }
    }
}

impl From<tonic::Status> for TalosError {
    fn from(status: tonic::Status) -> Self {
        TalosError::Rpc {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for TalosError {
    fn from(err: tonic::transport::Error) -> Self {
        TalosError::Transport(err.to_string())
    }
}
