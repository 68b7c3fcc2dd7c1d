//! Bootstrap stage
//!
//! Bootstraps etcd on one control plane node, at most once per record.
//!
//! The driver persists `intentIssuedTime` before the call goes out. A record
//! that carries the intent but not the outcome is ambiguous: the call may or
//! may not have reached the node. Ambiguity is settled by asking the node for
//! its etcd service state, never by calling bootstrap again blind. A node
//! that answers a repeated call with `AlreadyExists` counts as bootstrapped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crds::{Bootstrap, BootstrapStatus};
use kube::ResourceExt;
use talos_client::{MachineConnector, TalosError, Target};
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::managed::{Observation, Stage, StageKind};
use crate::reconciler::credentials::CredentialContext;
use crate::reconciler::session::{MachineSession, remote_error};
use crate::store::ConnectionDetails;

/// Service whose state proves a node was bootstrapped
pub const ETCD_SERVICE: &str = "etcd";

const RUNNING: &str = "Running";

/// Issues the one-time etcd bootstrap
pub struct BootstrapStage {
    credentials: CredentialContext,
    connector: Arc<dyn MachineConnector>,
}

impl std::fmt::Debug for BootstrapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapStage").finish_non_exhaustive()
    }
}

impl BootstrapStage {
    pub fn new(credentials: CredentialContext, connector: Arc<dyn MachineConnector>) -> Self {
        Self { credentials, connector }
    }
}

fn bootstrap_error(node: &str) -> impl Fn(TalosError) -> ControllerError + Copy + '_ {
    move |source| ControllerError::RemoteBootstrap {
        node: node.to_string(),
        source,
    }
}

fn mark_bootstrapped(status: &mut BootstrapStatus) {
    status.bootstrapped = true;
    status.bootstrap_time = Some(Utc::now());
}

#[async_trait]
impl Stage for BootstrapStage {
    type Resource = Bootstrap;
    type Status = BootstrapStatus;
    type Connection = MachineSession;

    const KIND: StageKind = StageKind::Bootstrap;
    const SINGLE_FIRE: bool = true;

    async fn connect(&self, resource: &Bootstrap) -> Result<MachineSession, ControllerError> {
        let spec = &resource.spec;
        let bundle = self.credentials.bundle(&spec.credentials).await?;
        let target = Target::new(&spec.node, spec.endpoint.as_deref());
        Ok(MachineSession::new(target, bundle, Arc::clone(&self.connector)))
    }

    async fn observe(
        &self,
        session: &MachineSession,
        resource: &Bootstrap,
        status: &mut BootstrapStatus,
    ) -> Result<Observation, ControllerError> {
        if status.is_bootstrapped() {
            return Ok(Observation::up_to_date());
        }
        if !status.is_ambiguous() {
            return Ok(Observation::absent());
        }

        let node = session.node();
        let client = session.client().await.map_err(|e| remote_error(e, bootstrap_error(node)))?;
        let state = client
            .service_state(ETCD_SERVICE)
            .await
            .map_err(|e| remote_error(e, bootstrap_error(node)))?;
        if state.as_deref() == Some(RUNNING) {
            info!(
                "Node {} already runs etcd; recording {} as bootstrapped without a new call",
                node,
                resource.name_any()
            );
            mark_bootstrapped(status);
            return Ok(Observation::up_to_date());
        }
        warn!(
            "Earlier bootstrap of {} on node {} did not complete (etcd: {}); issuing again",
            resource.name_any(),
            node,
            state.as_deref().unwrap_or("unknown")
        );
        Ok(Observation::absent())
    }

    async fn create(
        &self,
        session: &MachineSession,
        resource: &Bootstrap,
        status: &mut BootstrapStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        let node = session.node();
        let client = session.client().await.map_err(|e| remote_error(e, bootstrap_error(node)))?;
        match client.bootstrap().await {
            Ok(()) => info!("Bootstrapped etcd on node {} for {}", node, resource.name_any()),
            Err(e) if e.is_already_exists() => {
                info!("Node {} reports etcd already bootstrapped", node);
            }
            Err(e) => return Err(remote_error(e, bootstrap_error(node))),
        }
        mark_bootstrapped(status);
        Ok(None)
    }

    async fn update(
        &self,
        _session: &MachineSession,
        resource: &Bootstrap,
        _status: &mut BootstrapStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        info!("Bootstrap {} already completed; spec changes have no effect", resource.name_any());
        Ok(None)
    }

    async fn delete(
        &self,
        session: &MachineSession,
        resource: &Bootstrap,
        _status: &mut BootstrapStatus,
    ) -> Result<(), ControllerError> {
        info!(
            "Bootstrap {} removed; node {} stays bootstrapped",
            resource.name_any(),
            session.node()
        );
        Ok(())
    }

    fn record_intent(&self, status: &mut BootstrapStatus, now: DateTime<Utc>) -> bool {
        status.intent_issued_time = Some(now);
        true
    }
}
