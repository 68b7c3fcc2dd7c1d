//! Types shared by every Talos provisioning kind
//!
//! Every record carries the same managed-resource envelope: a deletion policy,
//! an optional connection secret target, and a status with `Ready`/`Synced`
//! conditions owned exclusively by the controller.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::{ResourceReference, SecretKeySelector, SecretReference};

/// Sentinel value selecting an unauthenticated maintenance-mode channel
pub const INSECURE: &str = "insecure";

/// What happens to the remote side when a record is deleted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Run the stage's delete operation
    #[default]
    #[serde(alias = "delete")]
    Delete,

    /// Leave the remote side untouched
    #[serde(alias = "orphan")]
    Orphan,
}

/// Fields every provisioning spec embeds
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Deletion policy (Delete or Orphan)
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// Secret to publish generated connection details into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<SecretReference>,
}

/// Credential bundle for the Talos machine API
///
/// Each field is PEM text or the literal `insecure`. A bundle with either
/// the CA or the client certificate set to `insecure` talks to a machine in
/// maintenance mode.
#[derive(Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfiguration {
    /// CA certificate used to verify the machine
    pub ca_certificate: String,

    /// Client certificate presented to the machine
    pub client_certificate: String,

    /// Private key for the client certificate
    pub client_key: String,
}

impl ClientConfiguration {
    /// Bundle that selects maintenance mode
    pub fn insecure() -> Self {
        Self {
            ca_certificate: INSECURE.to_string(),
            client_certificate: INSECURE.to_string(),
            client_key: INSECURE.to_string(),
        }
    }

    /// True when this bundle selects maintenance mode
    pub fn is_insecure(&self) -> bool {
        self.client_certificate == INSECURE || self.ca_certificate == INSECURE
    }
}

// Keys never end up in logs.
impl std::fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("insecure", &self.is_insecure())
            .field("ca_certificate_len", &self.ca_certificate.len())
            .field("client_certificate_len", &self.client_certificate.len())
            .finish_non_exhaustive()
    }
}

/// Where a stage that talks to a machine gets its credentials from
///
/// Exactly one source should be set. When several are set the inline
/// configuration wins, then the Secrets record, then the Kubernetes Secret.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSource {
    /// Inline credential bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_configuration: Option<ClientConfiguration>,

    /// Use the client configuration generated by a Secrets record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_ref: Option<ResourceReference>,

    /// Kubernetes Secret key holding a JSON credential bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<SecretKeySelector>,
}

/// Condition types reported on every record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// The remote resource is available for use
    Ready,
    /// The last reconciliation succeeded
    Synced,
}

/// Tri-state condition status, serialized the Kubernetes way
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    Unknown,
}

/// Machine-readable reason attached to a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionReason {
    /// Ready: resource exists and is up to date
    Available,
    /// Ready: resource is not usable
    Unavailable,
    /// Ready: create was issued this pass
    Creating,
    /// Ready: deletion in progress
    Deleting,
    /// Synced: reconciliation succeeded
    ReconcileSuccess,
    /// Synced: reconciliation failed
    ReconcileError,
}

/// A status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Condition status
    pub status: ConditionStatus,

    /// Reason for the current status
    pub reason: ConditionReason,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Ready=True, Available
    pub fn available() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::True, ConditionReason::Available, None)
    }

    /// Ready=False, Unavailable
    pub fn unavailable(message: Option<String>) -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, ConditionReason::Unavailable, message)
    }

    /// Ready=False, Creating
    pub fn creating() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, ConditionReason::Creating, None)
    }

    /// Ready=False, Deleting
    pub fn deleting() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, ConditionReason::Deleting, None)
    }

    /// Synced=True, ReconcileSuccess
    pub fn reconcile_success() -> Self {
        Self::new(ConditionType::Synced, ConditionStatus::True, ConditionReason::ReconcileSuccess, None)
    }

    /// Synced=False, ReconcileError with the error text as message
    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self::new(
            ConditionType::Synced,
            ConditionStatus::False,
            ConditionReason::ReconcileError,
            Some(message.into()),
        )
    }

    fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: Option<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason,
            message,
            last_transition_time: None,
        }
    }

    /// Equal in everything but the transition timestamp
    pub fn same_state(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Status fields every provisioning status embeds
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// `Ready` and `Synced` conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ResourceStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition
    ///
    /// The transition time is stamped only when the condition actually
    /// changes; setting the same state twice is a no-op and returns false.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) if existing.same_state(&condition) => false,
            Some(existing) => {
                condition.last_transition_time = Some(now);
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
                true
            }
        }
    }
}

/// Access to the managed-resource envelope of a spec
pub trait ManagedSpec {
    /// The embedded envelope
    fn managed(&self) -> &ManagedResourceSpec;
}

/// Access to the managed-resource envelope of a status
pub trait ManagedStatus: Default + Clone + PartialEq {
    /// The embedded envelope
    fn resource(&self) -> &ResourceStatus;
    /// Mutable access to the embedded envelope
    fn resource_mut(&mut self) -> &mut ResourceStatus;
}
