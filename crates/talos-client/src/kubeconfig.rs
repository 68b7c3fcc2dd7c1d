//! Kubeconfig extraction
//!
//! The machine API streams the admin kubeconfig as a gzipped tarball holding
//! a single `kubeconfig` file.

use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::error::TalosError;
use crate::models::KubeconfigBundle;

const KUBECONFIG_ENTRY: &str = "kubeconfig";

/// Pull the `kubeconfig` file out of a gzipped tarball
pub fn extract_kubeconfig(archive: &[u8]) -> Result<Vec<u8>, TalosError> {
    if archive.is_empty() {
        return Err(TalosError::Kubeconfig("empty kubeconfig stream".to_string()));
    }

    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let is_kubeconfig = entry
            .path()?
            .file_name()
            .is_some_and(|name| name == KUBECONFIG_ENTRY);
        if is_kubeconfig {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(TalosError::Kubeconfig("archive has no kubeconfig entry".to_string()))
}

#[derive(Deserialize)]
struct RawKubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    current_context: String,
}

#[derive(Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: String,
}

#[derive(Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Deserialize)]
struct UserEntry {
    #[serde(rename = "client-certificate-data", default)]
    client_certificate_data: String,
    #[serde(rename = "client-key-data", default)]
    client_key_data: String,
}

#[derive(Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

/// Parse a kubeconfig into host and PEM credentials
///
/// Follows `current-context` when it resolves, otherwise takes the first
/// cluster and user.
pub fn parse_kubeconfig(raw: &[u8]) -> Result<KubeconfigBundle, TalosError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| TalosError::Kubeconfig(format!("kubeconfig is not UTF-8: {e}")))?;
    let doc: RawKubeconfig = serde_yaml::from_str(text)
        .map_err(|e| TalosError::Kubeconfig(format!("invalid kubeconfig: {e}")))?;

    let context = doc.contexts.iter().find(|c| c.name == doc.current_context);
    let cluster = context
        .and_then(|ctx| doc.clusters.iter().find(|c| c.name == ctx.context.cluster))
        .or_else(|| doc.clusters.first())
        .ok_or_else(|| TalosError::Kubeconfig("kubeconfig has no clusters".to_string()))?;
    let user = context
        .and_then(|ctx| doc.users.iter().find(|u| u.name == ctx.context.user))
        .or_else(|| doc.users.first())
        .ok_or_else(|| TalosError::Kubeconfig("kubeconfig has no users".to_string()))?;

    Ok(KubeconfigBundle {
        host: cluster.cluster.server.clone(),
        ca_certificate: decode_field("certificate-authority-data", &cluster.cluster.certificate_authority_data)?,
        client_certificate: decode_field("client-certificate-data", &user.user.client_certificate_data)?,
        client_key: decode_field("client-key-data", &user.user.client_key_data)?,
        raw: text.to_string(),
    })
}

fn decode_field(field: &str, value: &str) -> Result<String, TalosError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| TalosError::Kubeconfig(format!("{field} is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| TalosError::Kubeconfig(format!("{field} is not UTF-8: {e}")))
}
