//! Kubeconfig stage
//!
//! Reads the Kubernetes admin kubeconfig back from a bootstrapped node. When
//! `bootstrapRef` is set the node is not contacted until that Bootstrap
//! record reports completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crds::{Bootstrap, Kubeconfig, KubeconfigStatus, KubernetesClientConfiguration};
use kube::ResourceExt;
use talos_client::{MachineConnector, TalosError, Target, parse_kubeconfig};
use tracing::info;

use crate::error::ControllerError;
use crate::managed::{Observation, Stage, StageKind};
use crate::reconciler::credentials::CredentialContext;
use crate::reconciler::session::{MachineSession, remote_error};
use crate::store::{ConnectionDetails, ResourceLookup};

/// Retrieves admin kubeconfigs
pub struct KubeconfigStage {
    bootstraps: Arc<dyn ResourceLookup<Bootstrap>>,
    credentials: CredentialContext,
    connector: Arc<dyn MachineConnector>,
}

impl std::fmt::Debug for KubeconfigStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigStage").finish_non_exhaustive()
    }
}

impl KubeconfigStage {
    pub fn new(
        bootstraps: Arc<dyn ResourceLookup<Bootstrap>>,
        credentials: CredentialContext,
        connector: Arc<dyn MachineConnector>,
    ) -> Self {
        Self {
            bootstraps,
            credentials,
            connector,
        }
    }

    async fn retrieve(
        &self,
        session: &MachineSession,
        resource: &Kubeconfig,
        status: &mut KubeconfigStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        let node = session.node();
        let remote = |source: TalosError| ControllerError::RemoteKubeconfig {
            node: node.to_string(),
            source,
        };
        let client = session.client().await.map_err(|e| remote_error(e, remote))?;
        let raw = client.kubeconfig().await.map_err(|e| remote_error(e, remote))?;
        let bundle = parse_kubeconfig(&raw).map_err(remote)?;

        let details = BTreeMap::from([
            ("kubeconfig".to_string(), bundle.raw.clone().into_bytes()),
            ("host".to_string(), bundle.host.clone().into_bytes()),
            ("ca_certificate".to_string(), bundle.ca_certificate.clone().into_bytes()),
            ("client_certificate".to_string(), bundle.client_certificate.clone().into_bytes()),
            ("client_key".to_string(), bundle.client_key.clone().into_bytes()),
        ]);
        info!(
            "Retrieved kubeconfig for {} from node {} (API server {})",
            resource.name_any(),
            node,
            bundle.host
        );
        status.kubernetes_client_configuration = Some(KubernetesClientConfiguration {
            host: bundle.host,
            ca_certificate: bundle.ca_certificate,
            client_certificate: bundle.client_certificate,
            client_key: bundle.client_key,
        });
        status.retrieved_time = Some(Utc::now());
        Ok(Some(details))
    }
}

#[async_trait]
impl Stage for KubeconfigStage {
    type Resource = Kubeconfig;
    type Status = KubeconfigStatus;
    type Connection = MachineSession;

    const KIND: StageKind = StageKind::Kubeconfig;

    async fn connect(&self, resource: &Kubeconfig) -> Result<MachineSession, ControllerError> {
        let spec = &resource.spec;
        if let Some(reference) = &spec.bootstrap_ref {
            let bootstrapped = self
                .bootstraps
                .get(&reference.name)
                .await?
                .and_then(|record| record.status)
                .is_some_and(|status| status.is_bootstrapped());
            if !bootstrapped {
                return Err(ControllerError::DependencyNotReady(format!(
                    "bootstrap {} has not completed",
                    reference.name
                )));
            }
        }
        let bundle = self.credentials.bundle(&spec.credentials).await?;
        let target = Target::new(&spec.node, spec.endpoint.as_deref());
        Ok(MachineSession::new(target, bundle, Arc::clone(&self.connector)))
    }

    async fn observe(
        &self,
        _session: &MachineSession,
        _resource: &Kubeconfig,
        status: &mut KubeconfigStatus,
    ) -> Result<Observation, ControllerError> {
        if status.kubernetes_client_configuration.is_some() {
            Ok(Observation::up_to_date())
        } else {
            Ok(Observation::absent())
        }
    }

    async fn create(
        &self,
        session: &MachineSession,
        resource: &Kubeconfig,
        status: &mut KubeconfigStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        self.retrieve(session, resource, status).await
    }

    async fn update(
        &self,
        session: &MachineSession,
        resource: &Kubeconfig,
        status: &mut KubeconfigStatus,
    ) -> Result<Option<ConnectionDetails>, ControllerError> {
        self.retrieve(session, resource, status).await
    }

    async fn delete(
        &self,
        _session: &MachineSession,
        _resource: &Kubeconfig,
        status: &mut KubeconfigStatus,
    ) -> Result<(), ControllerError> {
        status.kubernetes_client_configuration = None;
        status.retrieved_time = None;
        Ok(())
    }
}
