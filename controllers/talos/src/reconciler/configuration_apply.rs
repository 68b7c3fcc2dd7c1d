//! ConfigurationApply stage
//!
//! Pushes a machine configuration to a node and re-applies it whenever the
//! desired document's digest differs from the last one applied. The desired
//! document comes from, in order: a referenced Configuration, raw
//! `machineConfigurationInput`, or the structured `machineConfiguration`.
//! Anything that is not a rendered document is never sent to the node.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crds::{Configuration, ConfigurationApply, ConfigurationApplySpec, ConfigurationApplyStatus};
use kube::ResourceExt;
use talos_client::{ApplyMode, MachineConnector, TalosError, Target};
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::machinery::ConfigDocument;
use crate::machinery::patch::apply_patches;
use crate::managed::{Observation, Stage, StageKind};
use crate::reconciler::credentials::CredentialContext;
use crate::reconciler::session::{MachineSession, remote_error};
use crate::store::{ConnectionDetails, ResourceLookup};

/// Per-pass state: the desired document and a session to the node
#[derive(Debug)]
pub struct ApplyConnection {
    document: ConfigDocument,
    source: String,
    session: MachineSession,
}

/// Applies configuration documents to nodes
pub struct ConfigurationApplyStage {
    configurations: Arc<dyn ResourceLookup<Configuration>>,
    credentials: CredentialContext,
    connector: Arc<dyn MachineConnector>,
}

impl std::fmt::Debug for ConfigurationApplyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationApplyStage").finish_non_exhaustive()
    }
}

/// Wire apply mode for a requested one; unset means no reboot
pub fn wire_mode(mode: Option<crds::ApplyMode>) -> ApplyMode {
    match mode.unwrap_or_default() {
        crds::ApplyMode::Auto => ApplyMode::Auto,
        crds::ApplyMode::Reboot => ApplyMode::Reboot,
        crds::ApplyMode::NoReboot => ApplyMode::NoReboot,
        crds::ApplyMode::Staged => ApplyMode::Staged,
        crds::ApplyMode::Try => ApplyMode::Try,
    }
}

impl ConfigurationApplyStage {
    pub fn new(
        configurations: Arc<dyn ResourceLookup<Configuration>>,
        credentials: CredentialContext,
        connector: Arc<dyn MachineConnector>,
    ) -> Self {
        Self {
            configurations,
            credentials,
            connector,
        }
    }

    /// The desired document and a label naming where it came from
    async fn desired_document(&self, spec: &ConfigurationApplySpec) -> Result<(ConfigDocument, String), ControllerError> {
        let (raw, source) = if let Some(reference) = &spec.configuration_ref {
            let document = self
                .configurations
                .get(&reference.name)
                .await?
                .and_then(|record| record.status)
                .and_then(|status| status.rendered_document().map(str::to_string));
            (document, format!("configuration {}", reference.name))
        } else if let Some(input) = &spec.machine_configuration_input {
            (Some(input.clone()), "machineConfigurationInput".to_string())
        } else if let Some(structured) = &spec.machine_configuration {
            (Some(serde_yaml::to_string(structured)?), "machineConfiguration".to_string())
        } else {
            (None, "no configuration source".to_string())
        };

        let document = match ConfigDocument::classify(raw.as_deref()) {
            ConfigDocument::Rendered(text) if !spec.config_patches.is_empty() => {
                ConfigDocument::Rendered(apply_patches(&text, &spec.config_patches)?)
            }
            other => other,
        };
        Ok((document, source))
    }

    async fn apply(
        &self,
        connection: &ApplyConnection,
        resource: &ConfigurationApply,
        status: &mut ConfigurationApplyStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        let node = connection.session.node();
        let Some(document) = connection.document.rendered() else {
            return Err(ControllerError::PlaceholderInput(format!(
                "refusing to apply to node {node}: {} has no rendered document",
                connection.source
            )));
        };
        let remote = |source: TalosError| ControllerError::RemoteApply {
            node: node.to_string(),
            source,
        };

        let mode = wire_mode(resource.spec.apply_mode);
        let client = connection.session.client().await.map_err(|e| remote_error(e, remote))?;
        let outcome = client
            .apply_configuration(document.as_bytes(), mode)
            .await
            .map_err(|e| remote_error(e, remote))?;
        for warning in &outcome.warnings {
            warn!("Node {} warned while applying {}: {}", node, resource.name_any(), warning);
        }

        status.applied = true;
        status.last_applied_time = Some(Utc::now());
        status.applied_configuration_hash = connection.document.digest();
        info!("Applied configuration to node {} ({:?})", node, mode);
        Ok(None)
    }
}

#[async_trait]
impl Stage for ConfigurationApplyStage {
    type Resource = ConfigurationApply;
    type Status = ConfigurationApplyStatus;
    type Connection = ApplyConnection;

    const KIND: StageKind = StageKind::ConfigurationApply;

    async fn connect(&self, resource: &ConfigurationApply) -> Result<ApplyConnection, ControllerError> {
        let spec = &resource.spec;
        let (document, source) = self.desired_document(spec).await?;
        let bundle = self.credentials.bundle(&spec.credentials).await?;
        let target = Target::new(&spec.node, spec.endpoint.as_deref());
        Ok(ApplyConnection {
            document,
            source,
            session: MachineSession::new(target, bundle, Arc::clone(&self.connector)),
        })
    }

    async fn observe(
        &self,
        connection: &ApplyConnection,
        _resource: &ConfigurationApply,
        status: &mut ConfigurationApplyStatus,
    ) -> Result<Observation, ControllerError> {
        if !status.applied {
            return Ok(Observation::absent());
        }
        let current = connection.document.digest();
        if current.is_none() || status.applied_configuration_hash != current {
            return Ok(Observation::stale());
        }
        Ok(Observation::up_to_date())
    }

    async fn create(
        &self,
        connection: &ApplyConnection,
        resource: &ConfigurationApply,
        status: &mut ConfigurationApplyStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        self.apply(connection, resource, status).await
    }

    async fn update(
        &self,
        connection: &ApplyConnection,
        resource: &ConfigurationApply,
        status: &mut ConfigurationApplyStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        self.apply(connection, resource, status).await
    }

    async fn delete(
        &self,
        connection: &ApplyConnection,
        resource: &ConfigurationApply,
        status: &mut ConfigurationApplyStatus,
    ) -> Result<(), ControllerError> {
        if let Some(on_destroy) = resource.spec.on_destroy.as_ref().filter(|d| d.reset) {
            let node = connection.session.node();
            let remote = |source: TalosError| ControllerError::RemoteReset {
                node: node.to_string(),
                source,
            };
            let client = connection.session.client().await.map_err(|e| remote_error(e, remote))?;
            client
                .reset(on_destroy.graceful, on_destroy.reboot)
                .await
                .map_err(|e| remote_error(e, remote))?;
            info!(
                "Reset node {} (graceful={}, reboot={})",
                node, on_destroy.graceful, on_destroy.reboot
            );
        }
        status.applied = false;
        status.last_applied_time = None;
        status.applied_configuration_hash = None;
        Ok(())
    }
}
