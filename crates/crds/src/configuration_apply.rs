//! ConfigurationApply CRD
//!
//! Pushes a machine configuration document to a Talos node over the machine
//! API and re-applies it when the desired document changes.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{CredentialSource, ManagedResourceSpec, ManagedSpec, ManagedStatus, ResourceStatus};
use crate::references::ResourceReference;

/// ConfigurationApplySpec defines which document goes to which node
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "talos.microscaler.io",
    version = "v1alpha1",
    kind = "ConfigurationApply",
    status = "ConfigurationApplyStatus",
    category = "talos",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"NODE","type":"string","jsonPath":".spec.node"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationApplySpec {
    /// Target node address
    pub node: String,

    /// Endpoint to dial instead of the node (the node is then addressed via metadata)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// How the machine applies the document (default `no_reboot`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_mode: Option<ApplyMode>,

    /// Configuration record whose rendered document is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_ref: Option<ResourceReference>,

    /// Raw machine configuration document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_configuration_input: Option<String>,

    /// Structured machine configuration, serialized to YAML before applying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_configuration: Option<MachineConfigurationSpec>,

    /// YAML patches merged onto the document before applying
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<String>,

    /// Remote reset issued when the record is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_destroy: Option<OnDestroy>,

    /// Credentials for the machine API
    #[serde(flatten)]
    pub credentials: CredentialSource,

    /// Deletion policy and connection secret target
    #[serde(flatten)]
    pub managed: ManagedResourceSpec,
}

/// Apply mode understood by the machine API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Let the machine decide whether a reboot is required
    Auto,
    /// Apply and reboot
    Reboot,
    /// Apply without rebooting
    #[default]
    NoReboot,
    /// Stage for the next reboot
    Staged,
    /// Apply and roll back automatically after a timeout
    Try,
}

/// Reset behaviour on delete
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnDestroy {
    /// Issue a reset at all
    #[serde(default)]
    pub reset: bool,

    /// Leave etcd gracefully before resetting
    #[serde(default = "default_true")]
    pub graceful: bool,

    /// Reboot instead of powering off
    #[serde(default)]
    pub reboot: bool,
}

fn default_true() -> bool {
    true
}

/// Structured Talos machine configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigurationSpec {
    /// Document version, e.g. `v1alpha1`
    pub version: String,

    /// Machine section
    pub machine: MachineSpec,

    /// Cluster section
    pub cluster: ClusterSpec,
}

/// Machine section of a structured configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Machine role (`controlplane` or `worker`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Machine token
    pub token: String,

    /// Install target
    pub install: InstallSpec,

    /// Kubelet settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletSpec>,

    /// Feature flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturesSpec>,

    /// OS certificate authority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaSpec>,
}

/// Cluster section of a structured configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster identifier
    pub id: String,

    /// Cluster shared secret
    pub secret: String,

    /// Cluster name
    pub cluster_name: String,

    /// Control plane settings
    pub control_plane: ControlPlaneSpec,

    /// Cluster networking
    #[serde(default)]
    pub network: ClusterNetworkSpec,

    /// Bootstrap token
    pub token: String,
}

/// Install target
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallSpec {
    /// Disk to install onto
    pub disk: String,

    /// Installer image
    pub image: String,

    /// Wipe the disk first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipe: Option<bool>,
}

/// Control plane settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Control plane endpoint URL
    pub endpoint: String,
}

/// Cluster networking
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkSpec {
    /// Cluster DNS domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,

    /// Pod CIDRs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_subnets: Vec<String>,

    /// Service CIDRs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_subnets: Vec<String>,
}

/// Kubelet settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletSpec {
    /// Kubelet image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Feature flags
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesSpec {
    /// Enable RBAC on the machine API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<bool>,
}

/// PEM certificate and key pair
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaSpec {
    /// PEM certificate
    pub crt: String,

    /// PEM private key
    pub key: String,
}

/// ConfigurationApplyStatus records the last successful apply
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationApplyStatus {
    /// A document has been applied to the node
    #[serde(default)]
    pub applied: bool,

    /// When the last apply succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_time: Option<DateTime<Utc>>,

    /// SHA-256 of the last applied document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_configuration_hash: Option<String>,

    /// Conditions and observed generation
    #[serde(flatten)]
    pub resource: ResourceStatus,
}

impl ManagedSpec for ConfigurationApplySpec {
    fn managed(&self) -> &ManagedResourceSpec {
        &self.managed
    }
}

impl ManagedStatus for ConfigurationApplyStatus {
    fn resource(&self) -> &ResourceStatus {
        &self.resource
    }
    fn resource_mut(&mut self) -> &mut ResourceStatus {
        &mut self.resource
    }
}
