//! Controller-specific error types.
//!
//! Every error a stage can raise ends up as the message of the record's
//! `Synced` condition, so remote failures carry the stage and node they
//! happened on.

use kube::Error as KubeError;
use talos_client::TalosError;
use thiserror::Error;

/// Errors that can occur in the Talos provisioning controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Credential material is missing or malformed
    #[error("Credential error: {0}")]
    Credential(String),

    /// An upstream record has not produced its artifact yet
    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    /// A configuration document still carries unfilled placeholder content
    #[error("Placeholder input: {0}")]
    PlaceholderInput(String),

    /// Applying a configuration to a node failed
    #[error("configuration apply on node {node} failed: {source}")]
    RemoteApply {
        /// Target node
        node: String,
        /// Underlying RPC error
        source: TalosError,
    },

    /// Bootstrapping a node failed
    #[error("bootstrap on node {node} failed: {source}")]
    RemoteBootstrap {
        /// Target node
        node: String,
        /// Underlying RPC error
        source: TalosError,
    },

    /// Retrieving the kubeconfig from a node failed
    #[error("kubeconfig retrieval from node {node} failed: {source}")]
    RemoteKubeconfig {
        /// Target node
        node: String,
        /// Underlying RPC error
        source: TalosError,
    },

    /// Resetting a node on delete failed
    #[error("reset of node {node} failed: {source}")]
    RemoteReset {
        /// Target node
        node: String,
        /// Underlying RPC error
        source: TalosError,
    },

    /// Attempted mutation of an immutable record
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rendering a machine configuration failed
    #[error("Render failed: {0}")]
    Render(String),

    /// Generating PKI material failed
    #[error("PKI generation failed: {0}")]
    Pki(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Adding or removing the finalizer failed
    #[error("Finalizer error: {0}")]
    Finalizer(String),

    /// A reconciliation pass exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Waiting on an upstream record; retried on the next poll without
    /// escalating backoff
    pub fn is_dependency_wait(&self) -> bool {
        matches!(self, Self::DependencyNotReady(_) | Self::PlaceholderInput(_))
    }

    /// Requires operator intervention; retrying without a spec change
    /// cannot succeed
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Credential(_) | Self::Conflict(_) | Self::InvalidConfig(_) => true,
            Self::RemoteApply { source, .. }
            | Self::RemoteBootstrap { source, .. }
            | Self::RemoteKubeconfig { source, .. }
            | Self::RemoteReset { source, .. } => !source.is_retryable(),
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Credential(_) => "credential",
            Self::DependencyNotReady(_) => "dependency_not_ready",
            Self::PlaceholderInput(_) => "placeholder_input",
            Self::RemoteApply { .. } => "remote_apply",
            Self::RemoteBootstrap { .. } => "remote_bootstrap",
            Self::RemoteKubeconfig { .. } => "remote_kubeconfig",
            Self::RemoteReset { .. } => "remote_reset",
            Self::Conflict(_) => "conflict",
            Self::Render(_) => "render",
            Self::Pki(_) => "pki",
            Self::Json(_) | Self::Yaml(_) => "serialization",
            Self::Finalizer(_) => "finalizer",
            Self::Timeout(_) => "timeout",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Watch(_) => "watch",
        }
    }
}
