//! Per-pass machine API session
//!
//! A session is built in `connect` and dropped when the pass ends. The
//! underlying channel is only dialed the first time a stage actually calls
//! the node, so stages that decide from status alone never open one.

use std::sync::Arc;

use talos_client::{ClientBundle, MachineClientTrait, MachineConnector, TalosError, Target};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::ControllerError;

/// Lazily connected machine API client for one node
pub struct MachineSession {
    target: Target,
    bundle: ClientBundle,
    connector: Arc<dyn MachineConnector>,
    client: OnceCell<Box<dyn MachineClientTrait>>,
}

impl std::fmt::Debug for MachineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineSession")
            .field("target", &self.target)
            .field("bundle", &self.bundle)
            .field("connected", &self.client.initialized())
            .finish_non_exhaustive()
    }
}

impl MachineSession {
    pub fn new(target: Target, bundle: ClientBundle, connector: Arc<dyn MachineConnector>) -> Self {
        Self {
            target,
            bundle,
            connector,
            client: OnceCell::new(),
        }
    }

    /// Node the session talks about
    pub fn node(&self) -> &str {
        &self.target.node
    }

    /// The client, dialing on first use
    pub async fn client(&self) -> Result<&dyn MachineClientTrait, TalosError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                debug!("Dialing {} for node {}", self.target.endpoint, self.target.node);
                self.connector.connect(&self.target, &self.bundle).await
            })
            .await?;
        Ok(client.as_ref())
    }
}

/// Map a machine API error, keeping credential problems distinct from
/// remote failures
pub fn remote_error(source: TalosError, remote: impl FnOnce(TalosError) -> ControllerError) -> ControllerError {
    match source {
        TalosError::Credential(message) => ControllerError::Credential(message),
        other => remote(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_client::{ApplyMode, MockConnector};

    #[tokio::test]
    async fn test_dials_once_per_session() {
        let connector = MockConnector::new();
        let session = MachineSession::new(
            Target::new("10.0.0.9", None),
            ClientBundle::insecure(),
            Arc::new(connector.clone()),
        );
        assert!(connector.connections().is_empty());

        session.client().await.unwrap().apply_configuration(b"a", ApplyMode::NoReboot).await.unwrap();
        session.client().await.unwrap().apply_configuration(b"b", ApplyMode::NoReboot).await.unwrap();

        assert_eq!(connector.connections().len(), 1);
        assert_eq!(connector.node("10.0.0.9").applied().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_credentials_map_to_credential_error() {
        let session = MachineSession::new(
            Target::new("10.0.0.9", None),
            ClientBundle::new("garbage", "garbage", "garbage"),
            Arc::new(MockConnector::new()),
        );
        let err = session.client().await.err().unwrap();
        let mapped = remote_error(err, |source| ControllerError::RemoteBootstrap {
            node: "10.0.0.9".to_string(),
            source,
        });
        assert!(matches!(mapped, ControllerError::Credential(_)));
        assert!(mapped.is_fatal());
    }
}
