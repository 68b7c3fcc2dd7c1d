//! Full provisioning flow across all five stages

#[cfg(test)]
mod tests {
    use crate::machinery::PLACEHOLDER_MARKER;
    use crate::test_utils::*;
    use crds::{ApplyMode as RecordApplyMode, MachineType};
    use talos_client::{ApplyMode, SecurityMode};

    const NODE: &str = "10.0.0.9";
    const HOST: &str = "https://10.0.0.5:6443";

    #[tokio::test]
    async fn test_single_node_cluster_comes_up() {
        let harness = Harness::new();
        let node = harness.connector.node(NODE);
        node.set_kubeconfig(test_kubeconfig(HOST).as_bytes());

        // Cluster PKI
        harness.secrets.insert(create_test_secrets("demo"));
        reconcile(&harness.secrets_driver, &harness.secrets, "demo").await.unwrap();
        let bundle = harness.secrets.status("demo").client_configuration.unwrap();
        assert!(bundle.ca_certificate.contains("BEGIN CERTIFICATE"));
        assert!(bundle.client_certificate.contains("BEGIN CERTIFICATE"));
        assert!(!bundle.client_key.is_empty());

        // Control-plane document
        harness
            .configurations
            .insert(create_test_configuration("demo-cp", MachineType::Controlplane, "demo"));
        reconcile(&harness.configuration_driver, &harness.configurations, "demo-cp").await.unwrap();
        let document = harness
            .configurations
            .status("demo-cp")
            .rendered_document()
            .unwrap()
            .to_string();
        assert!(document.contains("clusterName: demo"));
        assert!(document.contains(HOST));
        assert!(!document.contains(PLACEHOLDER_MARKER));

        // Push it to the node in maintenance mode
        let mut apply = create_test_apply("demo-cp-apply", NODE, "demo-cp");
        apply.spec.apply_mode = Some(RecordApplyMode::NoReboot);
        harness.applies.insert(apply);
        reconcile(&harness.apply_driver, &harness.applies, "demo-cp-apply").await.unwrap();
        reconcile(&harness.apply_driver, &harness.applies, "demo-cp-apply").await.unwrap();
        assert!(harness.applies.status("demo-cp-apply").applied);
        assert_eq!(node.applied(), vec![(document.into_bytes(), ApplyMode::NoReboot)]);

        // Bootstrap with the generated client identity
        harness
            .bootstraps
            .insert(create_test_bootstrap("demo-bootstrap", NODE, secrets_credentials("demo")));
        for _ in 0..10 {
            reconcile(&harness.bootstrap_driver, &harness.bootstraps, "demo-bootstrap").await.unwrap();
        }
        assert!(harness.bootstraps.status("demo-bootstrap").is_bootstrapped());
        assert_eq!(node.bootstrap_calls(), 1);

        // Resubmitting the same record does not bootstrap again
        let resubmitted = harness.bootstraps.object("demo-bootstrap");
        harness.bootstraps.insert(resubmitted);
        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "demo-bootstrap").await.unwrap();
        assert_eq!(node.bootstrap_calls(), 1);

        // Admin kubeconfig once etcd is up
        let mut kubeconfig = create_test_kubeconfig("demo-admin", NODE, Some("demo-bootstrap"), secrets_credentials("demo"));
        kubeconfig.spec.managed = connection_secret("demo-admin-kubeconfig");
        harness.kubeconfigs.insert(kubeconfig);
        reconcile(&harness.kubeconfig_driver, &harness.kubeconfigs, "demo-admin").await.unwrap();
        assert_eq!(
            harness.publisher.value("demo-admin-kubeconfig", "host").as_deref(),
            Some(HOST)
        );

        let modes: Vec<SecurityMode> = harness.connector.connections().iter().map(|c| c.mode).collect();
        assert_eq!(modes.first(), Some(&SecurityMode::Maintenance));
        assert!(modes[1..].iter().all(|mode| *mode == SecurityMode::Authenticated));
    }
}
