//! Configuration stage
//!
//! Renders a machine configuration from the spec and the referenced Secrets
//! record. The render is repeated on every pass; the stored document is
//! replaced only when its digest no longer matches.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crds::{Configuration, ConfigurationStatus, DocumentState, Secrets};
use kube::ResourceExt;
use tracing::info;

use crate::config::RenderDefaults;
use crate::error::ControllerError;
use crate::machinery::{ConfigDocument, MachineSecrets, render};
use crate::managed::{Observation, Stage, StageKind};
use crate::store::{ConnectionDetails, ResourceLookup};

/// Connection secret key carrying the document
pub const MACHINE_CONFIG_KEY: &str = "machineconfig";

/// Renders machine configuration documents
pub struct ConfigurationStage {
    secrets: Arc<dyn ResourceLookup<Secrets>>,
    defaults: RenderDefaults,
}

impl std::fmt::Debug for ConfigurationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationStage")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl ConfigurationStage {
    pub fn new(secrets: Arc<dyn ResourceLookup<Secrets>>, defaults: RenderDefaults) -> Self {
        Self { secrets, defaults }
    }

    fn store(document: &ConfigDocument, status: &mut ConfigurationStatus) -> Option<ConnectionDetails> {
        status.machine_configuration = document.rendered().map(str::to_string);
        status.document_state = document.state();
        status.generated_time = Some(Utc::now());
        status.input_hash = document.digest();
        document.rendered().map(details)
    }
}

fn details(document: &str) -> ConnectionDetails {
    BTreeMap::from([(MACHINE_CONFIG_KEY.to_string(), document.as_bytes().to_vec())])
}

#[async_trait]
impl Stage for ConfigurationStage {
    type Resource = Configuration;
    type Status = ConfigurationStatus;
    type Connection = ConfigDocument;

    const KIND: StageKind = StageKind::Configuration;

    async fn connect(&self, resource: &Configuration) -> Result<ConfigDocument, ControllerError> {
        let reference = resource.spec.machine_secrets_ref.as_ref().ok_or_else(|| {
            ControllerError::InvalidConfig(format!("configuration {} has no machineSecretsRef", resource.name_any()))
        })?;
        let record = self
            .secrets
            .get(&reference.name)
            .await?
            .ok_or_else(|| ControllerError::DependencyNotReady(format!("secrets {} not found", reference.name)))?;
        let data = record
            .status
            .as_ref()
            .filter(|status| status.is_generated())
            .and_then(|status| status.machine_secrets.as_ref())
            .ok_or_else(|| {
                ControllerError::DependencyNotReady(format!("secrets {} have not been generated yet", reference.name))
            })?;

        let secrets = MachineSecrets::from_data(data)?;
        match ConfigDocument::classify(Some(&render(&resource.spec, &secrets, &self.defaults)?)) {
            ConfigDocument::Unset => Err(ControllerError::Render(format!(
                "configuration {} rendered to an unusable document",
                resource.name_any()
            ))),
            rendered => Ok(rendered),
        }
    }

    async fn observe(
        &self,
        document: &ConfigDocument,
        _resource: &Configuration,
        status: &mut ConfigurationStatus,
    ) -> Result<Observation, ControllerError> {
        let Some(stored) = status.rendered_document() else {
            return Ok(Observation::absent());
        };
        if status.input_hash != document.digest() {
            return Ok(Observation::stale());
        }
        Ok(Observation::up_to_date().with_details(details(stored)))
    }

    async fn create(
        &self,
        document: &ConfigDocument,
        resource: &Configuration,
        status: &mut ConfigurationStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        info!(
            "Rendered {} configuration {}",
            resource.spec.machine_type.as_str(),
            resource.name_any()
        );
        Ok(Self::store(document, status))
    }

    async fn update(
        &self,
        document: &ConfigDocument,
        resource: &Configuration,
        status: &mut ConfigurationStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        info!("Inputs of configuration {} changed; re-rendered", resource.name_any());
        Ok(Self::store(document, status))
    }

    async fn delete(
        &self,
        _document: &ConfigDocument,
        _resource: &Configuration,
        status: &mut ConfigurationStatus,
    ) -> Result<(), ControllerError> {
        status.machine_configuration = None;
        status.document_state = DocumentState::Unset;
        status.generated_time = None;
        status.input_hash = None;
        Ok(())
    }
}
