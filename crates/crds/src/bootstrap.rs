//! Bootstrap CRD
//!
//! Triggers etcd bootstrap on exactly one control plane node. The bootstrap
//! call is issued at most once per record.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{CredentialSource, ManagedResourceSpec, ManagedSpec, ManagedStatus, ResourceStatus};

/// BootstrapSpec names the node to bootstrap
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "talos.microscaler.io",
    version = "v1alpha1",
    kind = "Bootstrap",
    status = "BootstrapStatus",
    category = "talos",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"BOOTSTRAPPED","type":"boolean","jsonPath":".status.bootstrapped"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    /// Control plane node to bootstrap
    pub node: String,

    /// Endpoint to dial instead of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Credentials for the machine API
    #[serde(flatten)]
    pub credentials: CredentialSource,

    /// Deletion policy and connection secret target
    #[serde(flatten)]
    pub managed: ManagedResourceSpec,
}

/// BootstrapStatus records whether bootstrap happened
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapStatus {
    /// The node was bootstrapped
    #[serde(default)]
    pub bootstrapped: bool,

    /// When bootstrap completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_time: Option<DateTime<Utc>>,

    /// When the bootstrap call was about to be issued
    ///
    /// Set before the call goes out. An intent without `bootstrapped` means
    /// the outcome of that call is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_issued_time: Option<DateTime<Utc>>,

    /// Conditions and observed generation
    #[serde(flatten)]
    pub resource: ResourceStatus,
}

impl BootstrapStatus {
    /// Bootstrapped with a recorded completion time
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped && self.bootstrap_time.is_some()
    }

    /// A bootstrap call may have gone out without its result being recorded
    pub fn is_ambiguous(&self) -> bool {
        self.intent_issued_time.is_some() && !self.is_bootstrapped()
    }
}

impl ManagedSpec for BootstrapSpec {
    fn managed(&self) -> &ManagedResourceSpec {
        &self.managed
    }
}

impl ManagedStatus for BootstrapStatus {
    fn resource(&self) -> &ResourceStatus {
        &self.resource
    }
    fn resource_mut(&mut self) -> &mut ResourceStatus {
        &mut self.resource
    }
}
