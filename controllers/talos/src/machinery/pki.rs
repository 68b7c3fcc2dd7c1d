//! Cluster PKI generation
//!
//! Generates everything a Talos cluster needs once per lifetime: the OS,
//! Kubernetes, aggregator and etcd certificate authorities, the service
//! account signing key, cluster id/secret, bootstrap and trustd tokens, and
//! an admin client certificate signed by the OS CA.
//!
//! All randomness comes from the operating system CSPRNG. Material is stored
//! as PEM inside three JSON documents on the Secrets status.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::{ClientConfiguration, MachineSecretsData};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PKCS_ED25519,
};
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Validity of the generated certificate authorities (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity of the admin client certificate (1 year)
pub const ADMIN_VALIDITY_YEARS: i64 = 1;

/// Organization carried by the admin client certificate; grants the admin role
const ADMIN_ORGANIZATION: &str = "os:admin";

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn compute_validity(years: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (now, now + time::Duration::days(years * 365))
}

/// A PEM certificate and its PEM private key
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateAndKey {
    /// PEM certificate
    pub crt: String,
    /// PEM private key
    pub key: String,
}

impl std::fmt::Debug for CertificateAndKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAndKey").field("crt_len", &self.crt.len()).finish_non_exhaustive()
    }
}

/// Cluster identity and shared secrets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecrets {
    /// Cluster id
    pub id: String,
    /// Cluster shared secret
    pub secret: String,
    /// Kubernetes bootstrap token (`[a-z0-9]{6}.[a-z0-9]{16}`)
    pub bootstrap_token: String,
    /// Key for encrypting Kubernetes secrets at rest
    pub secretbox_encryption_secret: String,
}

/// Kubernetes PKI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSecrets {
    /// Kubernetes CA
    pub k8s: CertificateAndKey,
    /// Front proxy (aggregation layer) CA
    pub k8s_aggregator: CertificateAndKey,
    /// Service account token signing key (PEM)
    pub k8s_service_account_key: String,
    /// etcd CA
    pub etcd: CertificateAndKey,
}

/// OS-level trust material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrustdInfo {
    /// Machine join token
    pub token: String,
    /// OS (machine API) CA
    pub os: CertificateAndKey,
}

/// The full secrets bundle of one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSecrets {
    /// Cluster identity and shared secrets
    pub cluster: ClusterSecrets,
    /// Kubernetes PKI
    pub kubernetes: KubernetesSecrets,
    /// OS-level trust material
    pub trustd: TrustdInfo,
}

impl MachineSecrets {
    /// Generate a fresh bundle
    pub fn generate() -> Result<Self, ControllerError> {
        Ok(Self {
            cluster: ClusterSecrets {
                id: random_base64(32),
                secret: random_base64(32),
                bootstrap_token: random_token(),
                secretbox_encryption_secret: random_base64(32),
            },
            kubernetes: KubernetesSecrets {
                k8s: certificate_authority("kubernetes", "kubernetes", false)?,
                k8s_aggregator: certificate_authority("kubernetes-aggregator", "", false)?,
                k8s_service_account_key: KeyPair::generate()
                    .map_err(|e| ControllerError::Pki(format!("service account key: {e}")))?
                    .serialize_pem(),
                etcd: certificate_authority("etcd", "etcd", false)?,
            },
            trustd: TrustdInfo {
                token: random_token(),
                os: certificate_authority("talos", "talos", true)?,
            },
        })
    }

    /// Serialize into the three JSON documents stored on the Secrets status
    pub fn to_data(&self) -> Result<MachineSecretsData, ControllerError> {
        Ok(MachineSecretsData {
            cluster_secrets: serde_json::to_string(&self.cluster)?,
            kubernetes_secrets: serde_json::to_string(&self.kubernetes)?,
            trustd_info: serde_json::to_string(&self.trustd)?,
        })
    }

    /// Parse the three JSON documents stored on the Secrets status
    pub fn from_data(data: &MachineSecretsData) -> Result<Self, ControllerError> {
        Ok(Self {
            cluster: serde_json::from_str(&data.cluster_secrets)?,
            kubernetes: serde_json::from_str(&data.kubernetes_secrets)?,
            trustd: serde_json::from_str(&data.trustd_info)?,
        })
    }

    /// Issue an admin client certificate for the machine API
    pub fn admin_client(&self) -> Result<ClientConfiguration, ControllerError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String("admin".to_string()));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(ADMIN_ORGANIZATION.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = compute_validity(ADMIN_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate_for(&PKCS_ED25519)
            .map_err(|e| ControllerError::Pki(format!("admin key: {e}")))?;
        let ca_key = KeyPair::from_pem(&self.trustd.os.key)
            .map_err(|e| ControllerError::Pki(format!("OS CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.trustd.os.crt, &ca_key)
            .map_err(|e| ControllerError::Pki(format!("OS CA certificate: {e}")))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| ControllerError::Pki(format!("admin certificate: {e}")))?;

        Ok(ClientConfiguration {
            ca_certificate: self.trustd.os.crt.clone(),
            client_certificate: cert.pem(),
            client_key: key.serialize_pem(),
        })
    }
}

fn certificate_authority(common_name: &str, organization: &str, ed25519: bool) -> Result<CertificateAndKey, ControllerError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    if !common_name.is_empty() {
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    }
    if !organization.is_empty() {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(organization.to_string()));
    }
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let key = if ed25519 {
        KeyPair::generate_for(&PKCS_ED25519)
    } else {
        KeyPair::generate()
    }
    .map_err(|e| ControllerError::Pki(format!("{common_name} CA key: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| ControllerError::Pki(format!("{common_name} CA certificate: {e}")))?;

    Ok(CertificateAndKey {
        crt: cert.pem(),
        key: key.serialize_pem(),
    })
}

fn random_base64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn random_string(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
        .collect()
}

/// A token in the `[a-z0-9]{6}.[a-z0-9]{16}` format
pub fn random_token() -> String {
    format!("{}.{}", random_string(6), random_string(16))
}
