//! Machine API traits for mocking
//!
//! The controller only ever talks to machines through these traits, so
//! reconcilers can be exercised against `MockTalosClient` in unit tests.

use crate::error::TalosError;
use crate::models::{ApplyMode, ApplyOutcome, ClientBundle, Target};

/// Operations on one machine over one connection
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait MachineClientTrait: Send + Sync {
    /// Where this client is connected
    fn target(&self) -> &Target;

    /// Push a configuration document
    async fn apply_configuration(&self, data: &[u8], mode: ApplyMode) -> Result<ApplyOutcome, TalosError>;

    /// Bootstrap etcd on the node
    async fn bootstrap(&self) -> Result<(), TalosError>;

    /// Retrieve the admin kubeconfig document
    async fn kubeconfig(&self) -> Result<Vec<u8>, TalosError>;

    /// Reset the node
    async fn reset(&self, graceful: bool, reboot: bool) -> Result<(), TalosError>;

    /// State of a service on the node, `None` when the service is unknown
    async fn service_state(&self, service: &str) -> Result<Option<String>, TalosError>;
}

/// Builds machine clients from a target and a credential bundle
///
/// One client per reconciliation pass; it is dropped (and its connection
/// closed) when the pass ends.
#[async_trait::async_trait]
pub trait MachineConnector: Send + Sync {
    /// Open a connection to `target`
    async fn connect(
        &self,
        target: &Target,
        bundle: &ClientBundle,
    ) -> Result<Box<dyn MachineClientTrait>, TalosError>;
}
