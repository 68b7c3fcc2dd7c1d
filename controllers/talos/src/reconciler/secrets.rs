//! Secrets stage
//!
//! Generates the cluster PKI once and never again. A record whose material
//! exists is up to date for as long as the fields it was generated for
//! (`node`, `talosVersion`) are unchanged; changing them after generation is
//! reported as a conflict instead of silently rotating the cluster's trust
//! roots. Deletion policy and connection secret target may change freely.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use crds::{ClientConfiguration, Secrets, SecretsSpec, SecretsStatus};
use kube::ResourceExt;
use serde::Serialize;
use tracing::info;

use crate::error::ControllerError;
use crate::machinery::MachineSecrets;
use crate::machinery::document::digest;
use crate::managed::{Observation, Stage, StageKind};
use crate::store::ConnectionDetails;

/// Generates and holds a cluster's secrets bundle
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretsStage;

#[async_trait]
impl Stage for SecretsStage {
    type Resource = Secrets;
    type Status = SecretsStatus;
    type Connection = ();

    const KIND: StageKind = StageKind::Secrets;

    async fn connect(&self, _resource: &Secrets) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn observe(&self, _: &(), resource: &Secrets, status: &mut SecretsStatus) -> Result<Observation, ControllerError> {
        if !status.is_generated() {
            return Ok(Observation::absent());
        }
        let current = input_digest(&resource.spec);
        if status.input_hash.as_deref().is_some_and(|hash| hash != current) {
            return Ok(Observation::stale());
        }
        Ok(Observation::up_to_date().with_details(connection_details(resource, status)?))
    }

    async fn create(
        &self,
        _: &(),
        resource: &Secrets,
        status: &mut SecretsStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        let secrets = MachineSecrets::generate()?;
        status.client_configuration = Some(secrets.admin_client()?);
        status.machine_secrets = Some(secrets.to_data()?);
        status.generated_time = Some(Utc::now());
        status.input_hash = Some(input_digest(&resource.spec));
        info!("Generated cluster secrets for {}", resource.name_any());
        Ok(Some(connection_details(resource, status)?))
    }

    async fn update(
        &self,
        _: &(),
        resource: &Secrets,
        _status: &mut SecretsStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        Err(ControllerError::Conflict(format!(
            "secrets {} are immutable once generated; delete and recreate the record to rotate them",
            resource.name_any()
        )))
    }

    async fn delete(&self, _: &(), resource: &Secrets, status: &mut SecretsStatus) -> Result<(), ControllerError> {
        status.machine_secrets = None;
        status.client_configuration = None;
        status.generated_time = None;
        status.input_hash = None;
        info!("Discarded cluster secrets of {}", resource.name_any());
        Ok(())
    }
}

/// Digest of the spec fields that shape the generated material
fn input_digest(spec: &SecretsSpec) -> String {
    digest(&format!(
        "node={}\ntalosVersion={}\n",
        spec.node.as_deref().unwrap_or_default(),
        spec.talos_version.as_deref().unwrap_or_default()
    ))
}

fn connection_details(resource: &Secrets, status: &SecretsStatus) -> Result<ConnectionDetails, ControllerError> {
    let Some(client) = &status.client_configuration else {
        return Ok(ConnectionDetails::new());
    };
    let endpoints: Vec<String> = resource.spec.node.iter().cloned().collect();
    let talosconfig = talosconfig(&resource.name_any(), &endpoints, client)?;
    Ok(BTreeMap::from([
        ("ca_certificate".to_string(), client.ca_certificate.clone().into_bytes()),
        ("client_certificate".to_string(), client.client_certificate.clone().into_bytes()),
        ("client_key".to_string(), client.client_key.clone().into_bytes()),
        ("talos_config".to_string(), talosconfig.into_bytes()),
    ]))
}

#[derive(Serialize)]
struct TalosConfig<'a> {
    context: &'a str,
    contexts: BTreeMap<&'a str, TalosContext<'a>>,
}

#[derive(Serialize)]
struct TalosContext<'a> {
    endpoints: &'a [String],
    nodes: &'a [String],
    ca: String,
    crt: String,
    key: String,
}

/// A talosctl client configuration for `client`
pub fn talosconfig(context: &str, endpoints: &[String], client: &ClientConfiguration) -> Result<String, ControllerError> {
    let config = TalosConfig {
        context,
        contexts: BTreeMap::from([(
            context,
            TalosContext {
                endpoints,
                nodes: endpoints,
                ca: STANDARD.encode(&client.ca_certificate),
                crt: STANDARD.encode(&client.client_certificate),
                key: STANDARD.encode(&client.client_key),
            },
        )]),
    };
    Ok(serde_yaml::to_string(&config)?)
}
