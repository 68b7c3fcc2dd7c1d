//! Configuration CRD
//!
//! Renders a Talos machine configuration document from cluster parameters and
//! the secrets generated by a referenced Secrets record.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{ManagedResourceSpec, ManagedSpec, ManagedStatus, ResourceStatus};
use crate::references::ResourceReference;

/// ConfigurationSpec defines the inputs of a rendered machine configuration
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "talos.microscaler.io",
    version = "v1alpha1",
    kind = "Configuration",
    status = "ConfigurationStatus",
    category = "talos",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"ROLE","type":"string","jsonPath":".spec.machineType"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    /// Node the document is rendered for; added to the API certificate SANs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Kubernetes cluster name (controller default when empty)
    #[serde(default)]
    pub cluster_name: String,

    /// Control plane endpoint, e.g. `https://10.0.0.5:6443` (controller default when empty)
    #[serde(default)]
    pub cluster_endpoint: String,

    /// Machine role
    pub machine_type: MachineType,

    /// Secrets record supplying the cluster PKI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_secrets_ref: Option<ResourceReference>,

    /// Talos version, selects the installer image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talos_version: Option<String>,

    /// Kubernetes version, selects the kubelet image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Install disk (controller default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_disk: Option<String>,

    /// YAML patches merged onto the rendered document, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<String>,

    /// Deletion policy and connection secret target
    #[serde(flatten)]
    pub managed: ManagedResourceSpec,
}

/// Machine role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Control plane node: carries CA keys, etcd and the service account key
    #[default]
    Controlplane,
    /// Worker node: certificates only, no CA keys
    Worker,
}

impl MachineType {
    /// Role name as used in the machine configuration document
    pub fn as_str(self) -> &'static str {
        match self {
            MachineType::Controlplane => "controlplane",
            MachineType::Worker => "worker",
        }
    }
}

/// Whether a configuration document is usable
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum DocumentState {
    /// Nothing usable yet
    #[default]
    #[serde(alias = "unset")]
    Unset,
    /// A complete document has been rendered
    #[serde(alias = "rendered")]
    Rendered,
}

/// ConfigurationStatus defines the rendered document
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStatus {
    /// Rendered machine configuration (YAML)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_configuration: Option<String>,

    /// State of `machineConfiguration`
    #[serde(default)]
    pub document_state: DocumentState,

    /// When the document was rendered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_time: Option<DateTime<Utc>>,

    /// Digest of the inputs the document was rendered from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,

    /// Conditions and observed generation
    #[serde(flatten)]
    pub resource: ResourceStatus,
}

impl ConfigurationStatus {
    /// The rendered document, only when it is in the `Rendered` state
    pub fn rendered_document(&self) -> Option<&str> {
        match self.document_state {
            DocumentState::Rendered => self.machine_configuration.as_deref(),
            DocumentState::Unset => None,
        }
    }
}

impl ManagedSpec for ConfigurationSpec {
    fn managed(&self) -> &ManagedResourceSpec {
        &self.managed
    }
}

impl ManagedStatus for ConfigurationStatus {
    fn resource(&self) -> &ResourceStatus {
        &self.resource
    }
    fn resource_mut(&mut self) -> &mut ResourceStatus {
        &mut self.resource
    }
}
