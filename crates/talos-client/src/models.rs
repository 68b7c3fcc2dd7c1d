//! Talos machine API data models
//!
//! Wire messages for the subset of `machine.MachineService` the controller
//! uses, written as prost messages so no protoc step is needed. Field tags
//! follow the upstream `machine.proto` and `common.proto`; fields the
//! controller never reads are omitted and skipped by the decoder.

use std::net::{IpAddr, SocketAddr};
use zeroize::Zeroizing;

/// Default port of the Talos machine API
pub const DEFAULT_PORT: u16 = 50000;

/// Credential bundle used to build a connection
///
/// Each field is PEM text or the literal `insecure`.
#[derive(Clone)]
pub struct ClientBundle {
    /// CA certificate(s) the server must chain to
    pub ca_certificate: String,
    /// Client certificate chain
    pub client_certificate: String,
    /// Client private key
    pub client_key: Zeroizing<String>,
}

impl ClientBundle {
    /// Sentinel selecting maintenance mode
    pub const INSECURE: &'static str = "insecure";

    /// Build a bundle from its three PEM strings
    pub fn new(ca_certificate: impl Into<String>, client_certificate: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            ca_certificate: ca_certificate.into(),
            client_certificate: client_certificate.into(),
            client_key: Zeroizing::new(client_key.into()),
        }
    }

    /// Maintenance-mode bundle
    pub fn insecure() -> Self {
        Self::new(Self::INSECURE, Self::INSECURE, Self::INSECURE)
    }

    /// True when either certificate is the `insecure` sentinel
    pub fn is_insecure(&self) -> bool {
        self.client_certificate == Self::INSECURE || self.ca_certificate == Self::INSECURE
    }
}

impl std::fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBundle")
            .field("insecure", &self.is_insecure())
            .finish_non_exhaustive()
    }
}

/// Where a call goes
///
/// `endpoint` is what gets dialed. When it differs from `node`, the node is
/// selected through the `nodes` metadata header and the endpoint proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Machine the call is about
    pub node: String,
    /// `host:port` to dial
    pub endpoint: String,
}

impl Target {
    /// Target `node`, dialing `endpoint` when given, else `<node>:50000`
    pub fn new(node: &str, endpoint: Option<&str>) -> Self {
        let dial = endpoint.filter(|e| !e.trim().is_empty()).unwrap_or(node);
        Self {
            node: node.to_string(),
            endpoint: with_default_port(dial.trim()),
        }
    }

    /// Host part of the endpoint, without brackets or port
    pub fn endpoint_host(&self) -> &str {
        split_host(&self.endpoint)
    }

    /// The dialed machine is not the target node
    pub fn is_proxied(&self) -> bool {
        self.endpoint_host() != split_host(&self.node)
    }
}

fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{DEFAULT_PORT}"),
    }
}

fn split_host(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if address.parse::<IpAddr>().is_ok() {
        return address;
    }
    address.rsplit_once(':').map_or(address, |(host, _)| host)
}

/// How the machine should apply a configuration document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ApplyMode {
    /// Apply and reboot
    Reboot = 0,
    /// Let the machine decide
    Auto = 1,
    /// Apply without rebooting
    NoReboot = 2,
    /// Stage for next boot
    Staged = 3,
    /// Apply with automatic rollback
    Try = 4,
}

/// Per-node response metadata (`common.Metadata`)
#[derive(Clone, PartialEq, prost::Message)]
pub struct Metadata {
    /// Node hostname
    #[prost(string, tag = "1")]
    pub hostname: String,
    /// Error text when the node failed the call
    #[prost(string, tag = "2")]
    pub error: String,
}

/// `machine.ApplyConfigurationRequest`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfigurationRequest {
    /// Configuration document
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    /// Apply mode
    #[prost(enumeration = "ApplyMode", tag = "4")]
    pub mode: i32,
    /// Validate only
    #[prost(bool, tag = "5")]
    pub dry_run: bool,
}

/// One node's answer to an apply
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfiguration {
    /// Response metadata
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    /// Validation warnings
    #[prost(string, repeated, tag = "2")]
    pub warnings: Vec<String>,
    /// Mode the node actually used
    #[prost(enumeration = "ApplyMode", tag = "3")]
    pub mode: i32,
    /// Human readable mode details
    #[prost(string, tag = "4")]
    pub mode_details: String,
}

/// `machine.ApplyConfigurationResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfigurationResponse {
    /// Per-node results
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<ApplyConfiguration>,
}

/// `machine.BootstrapRequest`
#[derive(Clone, PartialEq, prost::Message)]
pub struct BootstrapRequest {
    /// Recover etcd from a snapshot
    #[prost(bool, tag = "1")]
    pub recover_etcd: bool,
    /// Skip snapshot hash check during recovery
    #[prost(bool, tag = "2")]
    pub recover_skip_hash_check: bool,
}

/// One node's answer to a bootstrap
#[derive(Clone, PartialEq, prost::Message)]
pub struct Bootstrap {
    /// Response metadata
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
}

/// `machine.BootstrapResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct BootstrapResponse {
    /// Per-node results
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Bootstrap>,
}

/// `machine.ResetRequest`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResetRequest {
    /// Leave etcd before wiping
    #[prost(bool, tag = "1")]
    pub graceful: bool,
    /// Reboot afterwards instead of powering off
    #[prost(bool, tag = "2")]
    pub reboot: bool,
}

/// One node's answer to a reset
#[derive(Clone, PartialEq, prost::Message)]
pub struct Reset {
    /// Response metadata
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
}

/// `machine.ResetResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResetResponse {
    /// Per-node results
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Reset>,
}

/// `machine.ServiceInfo`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceInfo {
    /// Service id, e.g. `etcd`
    #[prost(string, tag = "1")]
    pub id: String,
    /// Service state, e.g. `Running`
    #[prost(string, tag = "2")]
    pub state: String,
}

/// One node's service list
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceList {
    /// Response metadata
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    /// Services on the node
    #[prost(message, repeated, tag = "2")]
    pub services: Vec<ServiceInfo>,
}

/// `machine.ServiceListResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceListResponse {
    /// Per-node results
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<ServiceList>,
}

/// `common.Data`, a chunk of a streamed payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    /// Response metadata
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    /// Payload bytes
    #[prost(bytes = "vec", tag = "2")]
    pub bytes: Vec<u8>,
}

/// Result of a successful apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Warnings the node reported
    pub warnings: Vec<String>,
    /// Mode details the node reported
    pub mode_details: String,
}

/// Kubernetes admin credentials read from a kubeconfig
#[derive(Clone, PartialEq, Eq)]
pub struct KubeconfigBundle {
    /// API server URL
    pub host: String,
    /// Cluster CA (PEM)
    pub ca_certificate: String,
    /// Client certificate (PEM)
    pub client_certificate: String,
    /// Client key (PEM)
    pub client_key: String,
    /// The kubeconfig document as retrieved
    pub raw: String,
}

impl std::fmt::Debug for KubeconfigBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigBundle")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults_to_node_port() {
        let target = Target::new("10.0.0.9", None);
        assert_eq!(target.endpoint, "10.0.0.9:50000");
        assert!(!target.is_proxied());
    }

    #[test]
    fn test_target_endpoint_override() {
        let target = Target::new("10.0.0.9", Some("10.0.0.5"));
        assert_eq!(target.endpoint, "10.0.0.5:50000");
        assert_eq!(target.endpoint_host(), "10.0.0.5");
        assert!(target.is_proxied());

        let target = Target::new("10.0.0.9", Some("lb.example.com:443"));
        assert_eq!(target.endpoint, "lb.example.com:443");
        assert_eq!(target.endpoint_host(), "lb.example.com");

        let target = Target::new("10.0.0.9", Some("  "));
        assert_eq!(target.endpoint, "10.0.0.9:50000");
    }

    #[test]
    fn test_target_ipv6() {
        let target = Target::new("fd00::9", None);
        assert_eq!(target.endpoint, "[fd00::9]:50000");
        assert_eq!(target.endpoint_host(), "fd00::9");
        assert!(!target.is_proxied());
    }

    #[test]
    fn test_hostname_without_port() {
        let target = Target::new("node-1.lan", None);
        assert_eq!(target.endpoint, "node-1.lan:50000");
    }
}
