//! Machine configuration rendering
//!
//! Turns a Configuration spec plus the cluster's generated secrets into a
//! Talos `v1alpha1` machine configuration document. Rendering is a pure
//! function of its inputs: identical spec, secrets and defaults always give
//! byte-identical output.
//!
//! Workers receive only the CA certificates they need to trust; keys, the
//! aggregator CA, the service account key, etcd and the secretbox secret
//! stay on control plane nodes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::{ConfigurationSpec, MachineType};
use serde::Serialize;

use crate::config::RenderDefaults;
use crate::error::ControllerError;
use crate::machinery::patch::apply_patches;
use crate::machinery::pki::{CertificateAndKey, MachineSecrets};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document<'a> {
    version: &'static str,
    debug: bool,
    persist: bool,
    machine: Machine<'a>,
    cluster: Cluster<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Machine<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    token: &'a str,
    ca: Pem,
    #[serde(rename = "certSANs")]
    cert_sans: Vec<&'a str>,
    kubelet: Kubelet,
    network: Empty,
    install: Install,
    features: Features,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Kubelet {
    image: String,
    default_runtime_seccomp_profile_enabled: bool,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Install {
    disk: String,
    image: String,
    wipe: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Features {
    rbac: bool,
    stable_hostname: bool,
    apid_check_extended_key_usage: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Cluster<'a> {
    id: &'a str,
    secret: &'a str,
    control_plane: ControlPlane,
    cluster_name: String,
    network: Network,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secretbox_encryption_secret: Option<&'a str>,
    ca: Pem,
    #[serde(rename = "aggregatorCA", skip_serializing_if = "Option::is_none")]
    aggregator_ca: Option<Pem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_account: Option<ServiceAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etcd: Option<Etcd>,
}

#[derive(Serialize)]
struct ControlPlane {
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Network {
    dns_domain: String,
    pod_subnets: Vec<String>,
    service_subnets: Vec<String>,
}

#[derive(Serialize)]
struct Pem {
    crt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

impl Pem {
    fn full(pair: &CertificateAndKey) -> Self {
        Self {
            crt: STANDARD.encode(&pair.crt),
            key: Some(STANDARD.encode(&pair.key)),
        }
    }

    fn certificate_only(pair: &CertificateAndKey) -> Self {
        Self {
            crt: STANDARD.encode(&pair.crt),
            key: None,
        }
    }
}

#[derive(Serialize)]
struct ServiceAccount {
    key: String,
}

#[derive(Serialize)]
struct Etcd {
    ca: Pem,
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() { default } else { value }
}

fn versioned(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

/// Render the machine configuration for `spec`
///
/// Empty cluster name, endpoint, versions and install disk fall back to
/// `defaults`. `configPatches` are merged in order onto the result.
pub fn render(spec: &ConfigurationSpec, secrets: &MachineSecrets, defaults: &RenderDefaults) -> Result<String, ControllerError> {
    let cluster_name = or_default(&spec.cluster_name, &defaults.cluster_name);
    let endpoint = or_default(&spec.cluster_endpoint, &defaults.cluster_endpoint);
    if !endpoint.starts_with("https://") {
        return Err(ControllerError::Render(format!(
            "cluster endpoint must be an https URL, got {endpoint}"
        )));
    }
    let talos_version = versioned(or_default(spec.talos_version.as_deref().unwrap_or(""), &defaults.talos_version));
    let kubernetes_version = versioned(or_default(
        spec.kubernetes_version.as_deref().unwrap_or(""),
        &defaults.kubernetes_version,
    ));
    let install_disk = or_default(spec.install_disk.as_deref().unwrap_or(""), &defaults.install_disk);

    let controlplane = spec.machine_type == MachineType::Controlplane;
    let kubernetes = &secrets.kubernetes;
    let os_ca = &secrets.trustd.os;

    let document = Document {
        version: "v1alpha1",
        debug: false,
        persist: true,
        machine: Machine {
            type_: spec.machine_type.as_str(),
            token: &secrets.trustd.token,
            ca: if controlplane { Pem::full(os_ca) } else { Pem::certificate_only(os_ca) },
            cert_sans: spec.node.as_deref().into_iter().collect(),
            kubelet: Kubelet {
                image: format!("{}:{kubernetes_version}", defaults.kubelet_image),
                default_runtime_seccomp_profile_enabled: true,
            },
            network: Empty {},
            install: Install {
                disk: install_disk.to_string(),
                image: format!("{}:{talos_version}", defaults.installer_image),
                wipe: false,
            },
            features: Features {
                rbac: true,
                stable_hostname: true,
                apid_check_extended_key_usage: true,
            },
        },
        cluster: Cluster {
            id: &secrets.cluster.id,
            secret: &secrets.cluster.secret,
            control_plane: ControlPlane {
                endpoint: endpoint.to_string(),
            },
            cluster_name: cluster_name.to_string(),
            network: Network {
                dns_domain: defaults.dns_domain.clone(),
                pod_subnets: defaults.pod_subnets.clone(),
                service_subnets: defaults.service_subnets.clone(),
            },
            token: &secrets.cluster.bootstrap_token,
            secretbox_encryption_secret: controlplane.then_some(secrets.cluster.secretbox_encryption_secret.as_str()),
            ca: if controlplane {
                Pem::full(&kubernetes.k8s)
            } else {
                Pem::certificate_only(&kubernetes.k8s)
            },
            aggregator_ca: controlplane.then(|| Pem::full(&kubernetes.k8s_aggregator)),
            service_account: controlplane.then(|| ServiceAccount {
                key: STANDARD.encode(&kubernetes.k8s_service_account_key),
            }),
            etcd: controlplane.then(|| Etcd {
                ca: Pem::full(&kubernetes.etcd),
            }),
        },
    };

    let rendered = serde_yaml::to_string(&document)?;
    apply_patches(&rendered, &spec.config_patches)
}
