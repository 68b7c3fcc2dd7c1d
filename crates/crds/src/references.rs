//! Object references used between Talos provisioning CRDs
//!
//! All provisioning kinds are cluster-scoped, so a reference to another record
//! is just its name. References to core Kubernetes Secrets carry a namespace.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another cluster-scoped provisioning record by name
///
/// Used for `machineSecretsRef`, `secretsRef`, `configurationRef` and
/// `bootstrapRef`. The kind is implied by the field that holds the reference.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    /// Name of the referenced record
    pub name: String,
}

impl ResourceReference {
    /// Create a reference to the named record
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Location of a Kubernetes Secret the controller writes to
///
/// Mirrors `writeConnectionSecretToRef`: generated credentials are published
/// into this Secret so that other tooling can consume them without reading
/// the provisioning record itself.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,

    /// Namespace of the Secret (defaults to the controller's connection secret namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A single key inside a Kubernetes Secret
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Name of the Secret
    pub name: String,

    /// Namespace of the Secret
    pub namespace: String,

    /// Key within the Secret's data
    #[serde(default = "default_credentials_key")]
    pub key: String,
}

fn default_credentials_key() -> String {
    "credentials".to_string()
}
