//! Credential resolution for stages that talk to a machine
//!
//! Sources, in precedence order: an inline client configuration, the client
//! configuration generated by a referenced Secrets record, then a JSON
//! bundle stored in a Kubernetes Secret key. The `insecure` sentinel selects
//! a maintenance-mode channel.

use std::sync::Arc;

use crds::{ClientConfiguration, CredentialSource, Secrets};
use serde::Deserialize;
use talos_client::ClientBundle;
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::store::{CredentialResolver, ResourceLookup};

/// The JSON shape of a credentials Secret value
#[derive(Deserialize)]
struct CredentialsDocument {
    ca_certificate: String,
    client_certificate: String,
    client_key: String,
}

/// Turns a `CredentialSource` into a client bundle
#[derive(Clone)]
pub struct CredentialContext {
    secrets: Arc<dyn ResourceLookup<Secrets>>,
    resolver: Arc<dyn CredentialResolver>,
}

impl std::fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialContext").finish_non_exhaustive()
    }
}

impl CredentialContext {
    pub fn new(secrets: Arc<dyn ResourceLookup<Secrets>>, resolver: Arc<dyn CredentialResolver>) -> Self {
        Self { secrets, resolver }
    }

    /// Resolve `source` to a bundle
    pub async fn bundle(&self, source: &CredentialSource) -> Result<ClientBundle, ControllerError> {
        let configured = [
            source.client_configuration.is_some(),
            source.secrets_ref.is_some(),
            source.credentials_secret_ref.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if configured > 1 {
            warn!("Several credential sources set; using the first of clientConfiguration, secretsRef, credentialsSecretRef");
        }

        if let Some(inline) = &source.client_configuration {
            return to_bundle(inline);
        }

        if let Some(reference) = &source.secrets_ref {
            let record = self.secrets.get(&reference.name).await?.ok_or_else(|| {
                ControllerError::DependencyNotReady(format!("secrets {} not found", reference.name))
            })?;
            let client = record
                .status
                .and_then(|status| status.client_configuration)
                .ok_or_else(|| {
                    ControllerError::DependencyNotReady(format!(
                        "secrets {} have not generated a client configuration yet",
                        reference.name
                    ))
                })?;
            debug!("Using client configuration of secrets {}", reference.name);
            return to_bundle(&client);
        }

        if let Some(selector) = &source.credentials_secret_ref {
            let raw = self.resolver.resolve(selector).await?;
            let document: CredentialsDocument = serde_json::from_slice(&raw).map_err(|e| {
                ControllerError::Credential(format!(
                    "secret {}/{} key {} is not a credential bundle: {e}",
                    selector.namespace, selector.name, selector.key
                ))
            })?;
            return to_bundle(&ClientConfiguration {
                ca_certificate: document.ca_certificate,
                client_certificate: document.client_certificate,
                client_key: document.client_key,
            });
        }

        Err(ControllerError::Credential(
            "no credential source: set clientConfiguration, secretsRef or credentialsSecretRef".to_string(),
        ))
    }
}

fn to_bundle(client: &ClientConfiguration) -> Result<ClientBundle, ControllerError> {
    if client.is_insecure() {
        return Ok(ClientBundle::insecure());
    }
    if client.ca_certificate.trim().is_empty()
        || client.client_certificate.trim().is_empty()
        || client.client_key.trim().is_empty()
    {
        return Err(ControllerError::Credential(
            "client configuration needs a CA certificate, client certificate and client key".to_string(),
        ));
    }
    Ok(ClientBundle::new(
        client.ca_certificate.as_str(),
        client.client_certificate.as_str(),
        client.client_key.as_str(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machinery::MachineSecrets;
    use crate::test_utils::{MemoryCredentials, MemoryStore, create_test_secrets, insecure_credentials, secrets_credentials};
    use crds::{SecretKeySelector, SecretsStatus};

    fn context() -> (Arc<MemoryStore<Secrets>>, Arc<MemoryCredentials>, CredentialContext) {
        let secrets = MemoryStore::<Secrets>::new();
        let credentials = Arc::new(MemoryCredentials::default());
        let context = CredentialContext::new(secrets.clone(), credentials.clone());
        (secrets, credentials, context)
    }

    #[tokio::test]
    async fn test_inline_insecure() {
        let (_, _, context) = context();
        let bundle = context.bundle(&insecure_credentials()).await.unwrap();
        assert!(bundle.is_insecure());
    }

    #[tokio::test]
    async fn test_secrets_ref_waits_for_generation() {
        let (secrets, _, context) = context();
        let source = secrets_credentials("cluster");

        let err = context.bundle(&source).await.unwrap_err();
        assert!(err.is_dependency_wait());

        secrets.insert(create_test_secrets("cluster"));
        assert!(context.bundle(&source).await.unwrap_err().is_dependency_wait());

        let admin = MachineSecrets::generate().unwrap().admin_client().unwrap();
        let mut record = create_test_secrets("cluster");
        record.status = Some(SecretsStatus {
            client_configuration: Some(admin.clone()),
            ..Default::default()
        });
        secrets.insert(record);

        let bundle = context.bundle(&source).await.unwrap();
        assert!(!bundle.is_insecure());
        assert_eq!(bundle.client_certificate, admin.client_certificate);
    }

    #[tokio::test]
    async fn test_credentials_secret() {
        let (_, credentials, context) = context();
        let source = CredentialSource {
            credentials_secret_ref: Some(SecretKeySelector {
                name: "talos-creds".to_string(),
                namespace: "talos-system".to_string(),
                key: "credentials".to_string(),
            }),
            ..Default::default()
        };

        credentials.insert("talos-system", "talos-creds", "credentials", b"not json");
        assert!(matches!(
            context.bundle(&source).await,
            Err(ControllerError::Credential(_))
        ));

        credentials.insert(
            "talos-system",
            "talos-creds",
            "credentials",
            br#"{"ca_certificate":"insecure","client_certificate":"insecure","client_key":"insecure"}"#,
        );
        assert!(context.bundle(&source).await.unwrap().is_insecure());
    }

    #[tokio::test]
    async fn test_no_source_and_empty_fields() {
        let (_, _, context) = context();
        let err = context.bundle(&CredentialSource::default()).await.unwrap_err();
        assert!(err.is_fatal());

        let source = CredentialSource {
            client_configuration: Some(ClientConfiguration {
                ca_certificate: "-----BEGIN CERTIFICATE-----".to_string(),
                client_certificate: String::new(),
                client_key: String::new(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            context.bundle(&source).await,
            Err(ControllerError::Credential(_))
        ));
    }
}
