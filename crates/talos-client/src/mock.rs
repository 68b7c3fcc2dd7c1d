//! Mock machine API for unit testing
//!
//! `MockTalosClient` keeps per-node state in memory and behaves like a real
//! node where it matters to the controller: a second bootstrap is answered
//! with `AlreadyExists` and a bootstrapped node reports etcd as running.
//! `MockConnector` hands out clients that share state per node and runs the
//! real TLS factory over every bundle so credential errors still surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::TalosError;
use crate::models::{ApplyMode, ApplyOutcome, ClientBundle, Target};
use crate::talos_trait::{MachineClientTrait, MachineConnector};
use crate::tls::{SecurityMode, client_tls_config};

#[derive(Debug, Default)]
struct NodeState {
    applied: Vec<(Vec<u8>, ApplyMode)>,
    apply_failure: Option<String>,
    bootstrap_calls: u32,
    bootstrap_failure: Option<String>,
    bootstrapped: bool,
    kubeconfig: Option<Vec<u8>>,
    kubeconfig_calls: u32,
    resets: Vec<(bool, bool)>,
    services: HashMap<String, String>,
}

/// In-memory stand-in for one Talos node
#[derive(Debug, Clone)]
pub struct MockTalosClient {
    target: Target,
    state: Arc<Mutex<NodeState>>,
}

impl MockTalosClient {
    /// Create a mock node
    pub fn new(node: &str) -> Self {
        Self {
            target: Target::new(node, None),
            state: Arc::new(Mutex::new(NodeState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_target(&self, target: &Target) -> Self {
        Self {
            target: target.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Make every apply fail with `message`, `None` to clear
    pub fn set_apply_failure(&self, message: Option<&str>) {
        self.state().apply_failure = message.map(str::to_string);
    }

    /// Make every bootstrap fail with `message`, `None` to clear
    pub fn set_bootstrap_failure(&self, message: Option<&str>) {
        self.state().bootstrap_failure = message.map(str::to_string);
    }

    /// Mark the node as already bootstrapped
    pub fn mark_bootstrapped(&self) {
        let mut state = self.state();
        state.bootstrapped = true;
        state.services.insert("etcd".to_string(), "Running".to_string());
    }

    /// Set the kubeconfig document the node returns
    pub fn set_kubeconfig(&self, kubeconfig: &[u8]) {
        self.state().kubeconfig = Some(kubeconfig.to_vec());
    }

    /// Set a service state
    pub fn set_service_state(&self, service: &str, state: &str) {
        self.state().services.insert(service.to_string(), state.to_string());
    }

    /// Documents applied so far, with their modes
    pub fn applied(&self) -> Vec<(Vec<u8>, ApplyMode)> {
        self.state().applied.clone()
    }

    /// Number of bootstrap calls received
    pub fn bootstrap_calls(&self) -> u32 {
        self.state().bootstrap_calls
    }

    /// Whether the node is bootstrapped
    pub fn is_bootstrapped(&self) -> bool {
        self.state().bootstrapped
    }

    /// Number of kubeconfig calls received
    pub fn kubeconfig_calls(&self) -> u32 {
        self.state().kubeconfig_calls
    }

    /// Resets received, as `(graceful, reboot)`
    pub fn resets(&self) -> Vec<(bool, bool)> {
        self.state().resets.clone()
    }
}

#[async_trait::async_trait]
impl MachineClientTrait for MockTalosClient {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn apply_configuration(&self, data: &[u8], mode: ApplyMode) -> Result<ApplyOutcome, TalosError> {
        let mut state = self.state();
        if let Some(message) = &state.apply_failure {
            return Err(TalosError::Rpc {
                code: tonic::Code::Unavailable,
                message: message.clone(),
            });
        }
        state.applied.push((data.to_vec(), mode));
        Ok(ApplyOutcome::default())
    }

    async fn bootstrap(&self) -> Result<(), TalosError> {
        let mut state = self.state();
        state.bootstrap_calls += 1;
        if let Some(message) = &state.bootstrap_failure {
            return Err(TalosError::Rpc {
                code: tonic::Code::Unavailable,
                message: message.clone(),
            });
        }
        if state.bootstrapped {
            return Err(TalosError::Rpc {
                code: tonic::Code::AlreadyExists,
                message: "etcd data directory is not empty".to_string(),
            });
        }
        state.bootstrapped = true;
        state.services.insert("etcd".to_string(), "Running".to_string());
        Ok(())
    }

    async fn kubeconfig(&self) -> Result<Vec<u8>, TalosError> {
        let mut state = self.state();
        state.kubeconfig_calls += 1;
        if !state.bootstrapped {
            return Err(TalosError::Rpc {
                code: tonic::Code::FailedPrecondition,
                message: "cluster is not bootstrapped".to_string(),
            });
        }
        state
            .kubeconfig
            .clone()
            .ok_or_else(|| TalosError::Kubeconfig("no kubeconfig configured".to_string()))
    }

    async fn reset(&self, graceful: bool, reboot: bool) -> Result<(), TalosError> {
        let mut state = self.state();
        state.resets.push((graceful, reboot));
        state.bootstrapped = false;
        state.services.clear();
        Ok(())
    }

    async fn service_state(&self, service: &str) -> Result<Option<String>, TalosError> {
        Ok(self.state().services.get(service).cloned())
    }
}

/// A connection made through `MockConnector`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedConnection {
    /// Target that was dialed
    pub target: Target,
    /// TLS mode the bundle produced
    pub mode: SecurityMode,
}

/// Connector handing out `MockTalosClient`s keyed by node
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    nodes: Arc<Mutex<HashMap<String, MockTalosClient>>>,
    connections: Arc<Mutex<Vec<RecordedConnection>>>,
    unreachable: Arc<Mutex<Option<String>>>,
}

impl MockConnector {
    /// Empty connector
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock for `node`, created on first use; state is shared with
    /// every client later handed out for the same node
    pub fn node(&self, node: &str) -> MockTalosClient {
        let mut nodes = match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        nodes
            .entry(node.to_string())
            .or_insert_with(|| MockTalosClient::new(node))
            .clone()
    }

    /// Fail every connection attempt with `message`, `None` to clear
    pub fn set_unreachable(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.unreachable.lock() {
            *guard = message.map(str::to_string);
        }
    }

    /// Connections made so far
    pub fn connections(&self) -> Vec<RecordedConnection> {
        self.connections.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl MachineConnector for MockConnector {
    async fn connect(
        &self,
        target: &Target,
        bundle: &ClientBundle,
    ) -> Result<Box<dyn MachineClientTrait>, TalosError> {
        let tls = client_tls_config(bundle)?;
        if let Ok(guard) = self.unreachable.lock() {
            if let Some(message) = guard.as_ref() {
                return Err(TalosError::Transport(message.clone()));
            }
        }
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(RecordedConnection {
                target: target.clone(),
                mode: tls.mode,
            });
        }
        Ok(Box::new(self.node(&target.node).with_target(target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_bootstrap_already_exists() {
        let node = MockTalosClient::new("10.0.0.9");
        node.bootstrap().await.unwrap();
        let err = node.bootstrap().await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(node.bootstrap_calls(), 2);
        assert_eq!(node.service_state("etcd").await.unwrap().as_deref(), Some("Running"));
    }

    #[tokio::test]
    async fn test_connector_shares_node_state() {
        let connector = MockConnector::new();
        let target = Target::new("10.0.0.9", None);
        let client = connector.connect(&target, &ClientBundle::insecure()).await.unwrap();
        client.apply_configuration(b"doc", ApplyMode::NoReboot).await.unwrap();

        assert_eq!(connector.node("10.0.0.9").applied().len(), 1);
        assert_eq!(connector.connections()[0].mode, SecurityMode::Maintenance);
    }

    #[tokio::test]
    async fn test_connector_rejects_bad_credentials() {
        let connector = MockConnector::new();
        let target = Target::new("10.0.0.9", None);
        let bundle = ClientBundle::new("garbage", "garbage", "garbage");
        let err = connector.connect(&target, &bundle).await.err().unwrap();
        assert!(matches!(err, TalosError::Credential(_)));
        assert!(connector.connections().is_empty());
    }
}
