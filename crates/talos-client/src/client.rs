//! Talos machine API client
//!
//! gRPC over HTTP/2 on top of a rustls stream we establish ourselves, so the
//! server identity can be pinned to the dialed IP address and maintenance
//! mode can skip verification entirely.

use std::time::Duration;

use hyper_util::rt::TokioIo;
use prost::Message;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use crate::error::TalosError;
use crate::kubeconfig::extract_kubeconfig;
use crate::models::{
    ApplyConfigurationRequest, ApplyConfigurationResponse, ApplyMode, ApplyOutcome, BootstrapRequest,
    BootstrapResponse, ClientBundle, Data, Metadata, ResetRequest, ResetResponse, ServiceListResponse, Target,
};
use crate::talos_trait::{MachineClientTrait, MachineConnector};
use crate::tls::{SecurityMode, client_tls_config, server_name};

const APPLY_CONFIGURATION: &str = "/machine.MachineService/ApplyConfiguration";
const BOOTSTRAP: &str = "/machine.MachineService/Bootstrap";
const KUBECONFIG: &str = "/machine.MachineService/Kubeconfig";
const RESET: &str = "/machine.MachineService/Reset";
const SERVICE_LIST: &str = "/machine.MachineService/ServiceList";

/// A connection to one Talos machine
#[derive(Debug)]
pub struct TalosClient {
    channel: Channel,
    target: Target,
    mode: SecurityMode,
    timeout: Duration,
}

impl TalosClient {
    /// Connect to `target` using `bundle`
    ///
    /// `timeout` bounds the connection attempt and every call made through
    /// the returned client.
    pub async fn connect(target: &Target, bundle: &ClientBundle, timeout: Duration) -> Result<Self, TalosError> {
        let tls = client_tls_config(bundle)?;
        let name = server_name(target.endpoint_host())?;
        let connector = TlsConnector::from(tls.config);
        let address = target.endpoint.clone();

        let endpoint = Endpoint::from_shared(format!("http://{}", target.endpoint))
            .map_err(|e| TalosError::InvalidEndpoint(format!("{}: {e}", target.endpoint)))?
            .connect_timeout(timeout)
            .timeout(timeout);

        let channel = endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let connector = connector.clone();
                let address = address.clone();
                let name = name.clone();
                async move {
                    let tcp = TcpStream::connect(&address).await?;
                    let stream = connector.connect(name, tcp).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        debug!(
            "Connected to {} via {} ({:?})",
            target.node, target.endpoint, tls.mode
        );

        Ok(Self {
            channel,
            target: target.clone(),
            mode: tls.mode,
            timeout,
        })
    }

    /// Mode the connection was established in
    pub fn security_mode(&self) -> SecurityMode {
        self.mode
    }

    fn request<T>(&self, message: T) -> Result<tonic::Request<T>, TalosError> {
        let mut request = tonic::Request::new(message);
        if self.target.is_proxied() {
            let node = MetadataValue::try_from(self.target.node.as_str())
                .map_err(|e| TalosError::InvalidEndpoint(format!("{}: {e}", self.target.node)))?;
            request.metadata_mut().insert("nodes", node);
        }
        Ok(request)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp, TalosError>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let request = self.request(message)?;
        let call = async {
            let mut grpc = Grpc::new(self.channel.clone());
            grpc.ready()
                .await
                .map_err(|e| TalosError::Transport(e.to_string()))?;
            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            let response = grpc.unary(request, PathAndQuery::from_static(path), codec).await?;
            Ok::<_, TalosError>(response.into_inner())
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_elapsed| TalosError::Timeout(self.timeout))?
    }

    async fn download(&self, path: &'static str) -> Result<Vec<u8>, TalosError> {
        let request = self.request(())?;
        let call = async {
            let mut grpc = Grpc::new(self.channel.clone());
            grpc.ready()
                .await
                .map_err(|e| TalosError::Transport(e.to_string()))?;
            let codec: ProstCodec<(), Data> = ProstCodec::default();
            let mut stream = grpc
                .server_streaming(request, PathAndQuery::from_static(path), codec)
                .await?
                .into_inner();
            let mut payload = Vec::new();
            while let Some(chunk) = stream.message().await? {
                check_metadata(chunk.metadata.as_ref())?;
                payload.extend_from_slice(&chunk.bytes);
            }
            Ok::<_, TalosError>(payload)
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_elapsed| TalosError::Timeout(self.timeout))?
    }
}

/// Nodes report per-node failures in response metadata instead of the status
fn check_metadata(metadata: Option<&Metadata>) -> Result<(), TalosError> {
    match metadata {
        Some(meta) if !meta.error.is_empty() => Err(TalosError::Node {
            node: meta.hostname.clone(),
            message: meta.error.clone(),
        }),
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl MachineClientTrait for TalosClient {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn apply_configuration(&self, data: &[u8], mode: ApplyMode) -> Result<ApplyOutcome, TalosError> {
        let request = ApplyConfigurationRequest {
            data: data.to_vec(),
            mode: mode as i32,
            dry_run: false,
        };
        let response: ApplyConfigurationResponse = self.unary(APPLY_CONFIGURATION, request).await?;

        let mut outcome = ApplyOutcome::default();
        for message in response.messages {
            check_metadata(message.metadata.as_ref())?;
            outcome.warnings.extend(message.warnings);
            if outcome.mode_details.is_empty() {
                outcome.mode_details = message.mode_details;
            }
        }
        info!("Applied configuration to {} ({:?})", self.target.node, mode);
        Ok(outcome)
    }

    async fn bootstrap(&self) -> Result<(), TalosError> {
        let response: BootstrapResponse = self.unary(BOOTSTRAP, BootstrapRequest::default()).await?;
        for message in &response.messages {
            check_metadata(message.metadata.as_ref())?;
        }
        info!("Bootstrapped {}", self.target.node);
        Ok(())
    }

    async fn kubeconfig(&self) -> Result<Vec<u8>, TalosError> {
        let archive = self.download(KUBECONFIG).await?;
        extract_kubeconfig(&archive)
    }

    async fn reset(&self, graceful: bool, reboot: bool) -> Result<(), TalosError> {
        let response: ResetResponse = self.unary(RESET, ResetRequest { graceful, reboot }).await?;
        for message in &response.messages {
            check_metadata(message.metadata.as_ref())?;
        }
        info!("Reset {} (graceful: {}, reboot: {})", self.target.node, graceful, reboot);
        Ok(())
    }

    async fn service_state(&self, service: &str) -> Result<Option<String>, TalosError> {
        let response: ServiceListResponse = self.unary(SERVICE_LIST, ()).await?;
        for list in response.messages {
            check_metadata(list.metadata.as_ref())?;
            if let Some(info) = list.services.into_iter().find(|s| s.id == service) {
                return Ok(Some(info.state));
            }
        }
        Ok(None)
    }
}

/// Opens real connections with a fixed call timeout
#[derive(Debug, Clone)]
pub struct TalosConnector {
    timeout: Duration,
}

impl TalosConnector {
    /// Connector whose clients time out calls after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl MachineConnector for TalosConnector {
    async fn connect(
        &self,
        target: &Target,
        bundle: &ClientBundle,
    ) -> Result<Box<dyn MachineClientTrait>, TalosError> {
        let client = TalosClient::connect(target, bundle, self.timeout).await?;
        Ok(Box::new(client))
    }
}
