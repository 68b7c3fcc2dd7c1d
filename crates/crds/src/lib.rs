//! Talos Provisioning CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Talos provisioning
//! controller. Every kind is cluster-scoped and lives in the
//! `talos.microscaler.io/v1alpha1` API group:
//!
//! - `Secrets`: generated cluster PKI and admin client bundle
//! - `Configuration`: rendered machine configuration document
//! - `ConfigurationApply`: a document pushed to a node
//! - `Bootstrap`: one-time etcd bootstrap on a control plane node
//! - `Kubeconfig`: Kubernetes admin credentials read back from the cluster

pub mod bootstrap;
pub mod common;
pub mod configuration;
pub mod configuration_apply;
pub mod kubeconfig;
pub mod references;
pub mod secrets;

pub use bootstrap::*;
pub use common::*;
pub use configuration::*;
pub use configuration_apply::*;
pub use kubeconfig::*;
pub use references::*;
pub use secrets::*;

/// API group shared by all provisioning kinds
pub const API_GROUP: &str = "talos.microscaler.io";
