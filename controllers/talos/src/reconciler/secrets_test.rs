//! Unit tests for the Secrets stage

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::machinery::MachineSecrets;
    use crate::reconciler::secrets::talosconfig;
    use crate::test_utils::*;
    use crds::{ConditionReason, ConditionStatus, ConditionType, DeletionPolicy, ManagedStatus};
    use kube_runtime::controller::Action;

    fn reason(status: &crds::SecretsStatus, type_: ConditionType) -> Option<ConditionReason> {
        status.resource().condition(type_).map(|c| c.reason)
    }

    #[tokio::test]
    async fn test_generates_once_and_publishes() {
        let harness = Harness::new();
        let mut record = create_test_secrets("cluster");
        record.spec.managed = connection_secret("cluster-talosconfig");
        record.spec.node = Some("10.0.0.9".to_string());
        harness.secrets.insert(record);

        let action = reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        assert_eq!(action, Action::requeue(SHORT_REQUEUE));

        let first = harness.secrets.status("cluster");
        assert!(first.is_generated());
        assert!(first.generated_time.is_some());
        assert_eq!(reason(&first, ConditionType::Ready), Some(ConditionReason::Creating));
        assert_eq!(reason(&first, ConditionType::Synced), Some(ConditionReason::ReconcileSuccess));

        let secrets = MachineSecrets::from_data(first.machine_secrets.as_ref().unwrap()).unwrap();
        assert_eq!(
            first.client_configuration.as_ref().unwrap().ca_certificate,
            secrets.trustd.os.crt
        );
        assert_eq!(
            harness.publisher.value("cluster-talosconfig", "ca_certificate").unwrap(),
            secrets.trustd.os.crt
        );
        assert!(
            harness
                .publisher
                .value("cluster-talosconfig", "talos_config")
                .unwrap()
                .contains("10.0.0.9")
        );

        let action = reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        assert_eq!(action, Action::requeue(POLL_INTERVAL));
        let second = harness.secrets.status("cluster");
        assert_eq!(second.machine_secrets, first.machine_secrets);
        assert_eq!(second.client_configuration, first.client_configuration);
        assert_eq!(reason(&second, ConditionType::Ready), Some(ConditionReason::Available));
    }

    #[tokio::test]
    async fn test_converged_record_is_not_rewritten() {
        let harness = Harness::new();
        harness.secrets.insert(create_test_secrets("cluster"));

        for _ in 0..5 {
            reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        }

        // create, then Ready flips to Available; nothing after that
        assert_eq!(harness.secrets.status_writes(), 2);
    }

    #[tokio::test]
    async fn test_spec_change_after_generation_conflicts() {
        let harness = Harness::new();
        harness.secrets.insert(create_test_secrets("cluster"));
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        let generated = harness.secrets.status("cluster").machine_secrets;

        let mut changed = harness.secrets.object("cluster");
        changed.spec.talos_version = Some("v1.10.0".to_string());
        changed.metadata.generation = Some(2);
        harness.secrets.insert(changed);

        let err = reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap_err();
        assert!(matches!(err, ControllerError::Conflict(_)));
        assert!(err.is_fatal());

        let status = harness.secrets.status("cluster");
        assert_eq!(status.machine_secrets, generated);
        let synced = status.resource().condition(ConditionType::Synced).unwrap();
        assert_eq!(synced.status, ConditionStatus::False);
        assert!(synced.message.as_deref().unwrap().contains("immutable"));

        // Still conflicting on the next pass
        assert!(reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.is_err());

        // Reverting the version clears the conflict without regenerating
        let mut reverted = harness.secrets.object("cluster");
        reverted.spec.talos_version = None;
        reverted.metadata.generation = Some(3);
        harness.secrets.insert(reverted);
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();

        let status = harness.secrets.status("cluster");
        assert_eq!(status.machine_secrets, generated);
        assert_eq!(reason(&status, ConditionType::Synced), Some(ConditionReason::ReconcileSuccess));
        assert_eq!(status.resource().observed_generation, Some(3));
    }

    #[tokio::test]
    async fn test_envelope_change_does_not_conflict() {
        let harness = Harness::new();
        let mut record = create_test_secrets("cluster");
        record.spec.managed = connection_secret("cluster-talosconfig");
        harness.secrets.insert(record);
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        let generated = harness.secrets.status("cluster").machine_secrets;
        assert_eq!(harness.publisher.publishes(), 1);

        let mut changed = harness.secrets.object("cluster");
        changed.spec.managed = connection_secret("cluster-admin");
        changed.spec.managed.deletion_policy = DeletionPolicy::Orphan;
        changed.metadata.generation = Some(2);
        harness.secrets.insert(changed);

        let action = reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        assert_eq!(action, Action::requeue(POLL_INTERVAL));
        assert_eq!(harness.secrets.status("cluster").machine_secrets, generated);
        assert_eq!(harness.publisher.publishes(), 2);
        assert!(harness.publisher.secret("cluster-admin").is_some());
    }

    #[tokio::test]
    async fn test_delete_discards_material() {
        let harness = Harness::new();
        let mut record = create_test_secrets("cluster");
        record.spec.managed = connection_secret("cluster-talosconfig");
        harness.secrets.insert(record);
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        assert!(harness.publisher.secret("cluster-talosconfig").is_some());

        let action = cleanup(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        assert_eq!(action, Action::await_change());
        let status = harness.secrets.status("cluster");
        assert!(!status.is_generated());
        assert_eq!(reason(&status, ConditionType::Ready), Some(ConditionReason::Deleting));
        assert!(harness.publisher.secret("cluster-talosconfig").is_none());
    }

    #[tokio::test]
    async fn test_orphan_keeps_material() {
        let harness = Harness::new();
        let mut record = create_test_secrets("cluster");
        record.spec.managed.deletion_policy = DeletionPolicy::Orphan;
        harness.secrets.insert(record);
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();

        cleanup(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        assert!(harness.secrets.status("cluster").is_generated());
    }

    #[test]
    fn test_talosconfig_shape() {
        let admin = crds::ClientConfiguration {
            ca_certificate: "ca".to_string(),
            client_certificate: "crt".to_string(),
            client_key: "key".to_string(),
        };
        let doc = talosconfig("cluster", &["10.0.0.9".to_string()], &admin).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&doc).unwrap();

        assert_eq!(value["context"].as_str(), Some("cluster"));
        let context = &value["contexts"]["cluster"];
        assert_eq!(context["endpoints"][0].as_str(), Some("10.0.0.9"));
        assert_eq!(context["ca"].as_str(), Some("Y2E="));
        assert_eq!(context["key"].as_str(), Some("a2V5"));
    }
}
