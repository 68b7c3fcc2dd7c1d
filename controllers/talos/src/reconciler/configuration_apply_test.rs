//! Unit tests for the ConfigurationApply stage

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::machinery::PLACEHOLDER_MARKER;
    use crate::machinery::document::digest;
    use crate::reconciler::configuration_apply::wire_mode;
    use crate::test_utils::*;
    use crds::{
        ConditionReason, ConditionType, ConfigurationApply, DeletionPolicy, MachineType, ManagedStatus, OnDestroy,
    };
    use talos_client::{ApplyMode, SecurityMode};

    const NODE: &str = "10.0.0.9";

    async fn rendered_configuration(harness: &Harness) -> String {
        harness.secrets.insert(create_test_secrets("cluster"));
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        harness
            .configurations
            .insert(create_test_configuration("cp", MachineType::Controlplane, "cluster"));
        reconcile(&harness.configuration_driver, &harness.configurations, "cp").await.unwrap();
        harness
            .configurations
            .status("cp")
            .rendered_document()
            .unwrap()
            .to_string()
    }

    fn inline_apply(name: &str, input: &str) -> ConfigurationApply {
        let mut record = create_test_apply(name, NODE, "unused");
        record.spec.configuration_ref = None;
        record.spec.machine_configuration_input = Some(input.to_string());
        record
    }

    #[tokio::test]
    async fn test_applies_rendered_configuration_once() {
        let harness = Harness::new();
        let document = rendered_configuration(&harness).await;
        harness.applies.insert(create_test_apply("apply", NODE, "cp"));

        for _ in 0..4 {
            reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();
        }

        let node = harness.connector.node(NODE);
        let applied = node.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, document.as_bytes());
        assert_eq!(applied[0].1, ApplyMode::NoReboot);

        let status = harness.applies.status("apply");
        assert!(status.applied);
        assert!(status.last_applied_time.is_some());
        assert_eq!(status.applied_configuration_hash, Some(digest(&document)));
        assert_eq!(
            status.resource().condition(ConditionType::Ready).map(|c| c.reason),
            Some(ConditionReason::Available)
        );
        assert_eq!(harness.connector.connections()[0].mode, SecurityMode::Maintenance);
    }

    #[tokio::test]
    async fn test_placeholder_is_never_sent() {
        let harness = Harness::new();
        let template = format!("version: v1alpha1\n{PLACEHOLDER_MARKER}\nmachine: {{}}\n");
        harness.applies.insert(inline_apply("apply", &template));

        let err = reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap_err();
        assert!(matches!(err, ControllerError::PlaceholderInput(_)));
        assert!(err.is_dependency_wait());
        assert!(harness.connector.node(NODE).applied().is_empty());
        assert!(harness.connector.connections().is_empty());

        let status = harness.applies.status("apply");
        assert!(!status.applied);
        assert!(status.applied_configuration_hash.is_none());
    }

    #[tokio::test]
    async fn test_waits_for_unrendered_configuration() {
        let harness = Harness::new();
        harness.applies.insert(create_test_apply("apply", NODE, "cp"));

        let err = reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap_err();
        assert!(err.is_dependency_wait());

        rendered_configuration(&harness).await;
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();
        assert_eq!(harness.connector.node(NODE).applied().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_document_is_reapplied() {
        let harness = Harness::new();
        harness
            .applies
            .insert(inline_apply("apply", "version: v1alpha1\nmachine:\n  type: worker\n"));
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();

        let mut changed = harness.applies.object("apply");
        changed.spec.config_patches = vec!["machine:\n  install:\n    disk: /dev/vda\n".to_string()];
        changed.spec.apply_mode = Some(crds::ApplyMode::Staged);
        harness.applies.insert(changed);
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();

        let applied = harness.connector.node(NODE).applied();
        assert_eq!(applied.len(), 2);
        assert!(String::from_utf8_lossy(&applied[1].0).contains("/dev/vda"));
        assert_eq!(applied[1].1, ApplyMode::Staged);
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_status() {
        let harness = Harness::new();
        harness
            .applies
            .insert(inline_apply("apply", "version: v1alpha1\nmachine:\n  type: worker\n"));
        harness.connector.node(NODE).set_apply_failure(Some("connection reset"));

        let err = reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap_err();
        assert!(matches!(err, ControllerError::RemoteApply { ref node, .. } if node == NODE));
        assert!(!err.is_fatal());

        let status = harness.applies.status("apply");
        assert!(!status.applied);
        let synced = status.resource().condition(ConditionType::Synced).unwrap();
        assert!(synced.message.as_deref().unwrap().contains(NODE));
    }

    #[tokio::test]
    async fn test_credential_switch_to_generated_bundle() {
        let harness = Harness::new();
        harness.secrets.insert(create_test_secrets("cluster"));
        reconcile(&harness.secrets_driver, &harness.secrets, "cluster").await.unwrap();
        harness
            .applies
            .insert(inline_apply("apply", "version: v1alpha1\nmachine:\n  type: worker\n"));
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();

        let mut secured = harness.applies.object("apply");
        secured.spec.credentials = secrets_credentials("cluster");
        secured.spec.machine_configuration_input = Some("version: v1alpha1\nmachine:\n  type: worker\ndebug: true\n".to_string());
        harness.applies.insert(secured);
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();

        let modes: Vec<SecurityMode> = harness.connector.connections().iter().map(|c| c.mode).collect();
        assert_eq!(modes, vec![SecurityMode::Maintenance, SecurityMode::Authenticated]);
    }

    #[tokio::test]
    async fn test_delete_resets_when_asked() {
        let harness = Harness::new();
        let mut record = inline_apply("apply", "version: v1alpha1\nmachine:\n  type: worker\n");
        record.spec.on_destroy = Some(OnDestroy {
            reset: true,
            graceful: false,
            reboot: true,
        });
        harness.applies.insert(record);
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();

        cleanup(&harness.apply_driver, &harness.applies, "apply").await.unwrap();
        assert_eq!(harness.connector.node(NODE).resets(), vec![(false, true)]);
        assert!(!harness.applies.status("apply").applied);
    }

    #[tokio::test]
    async fn test_orphan_skips_reset() {
        let harness = Harness::new();
        let mut record = inline_apply("apply", "version: v1alpha1\nmachine:\n  type: worker\n");
        record.spec.on_destroy = Some(OnDestroy {
            reset: true,
            graceful: true,
            reboot: false,
        });
        record.spec.managed.deletion_policy = DeletionPolicy::Orphan;
        harness.applies.insert(record);
        reconcile(&harness.apply_driver, &harness.applies, "apply").await.unwrap();

        cleanup(&harness.apply_driver, &harness.applies, "apply").await.unwrap();
        assert!(harness.connector.node(NODE).resets().is_empty());
    }

    #[test]
    fn test_default_mode_is_no_reboot() {
        assert_eq!(wire_mode(None), ApplyMode::NoReboot);
        assert_eq!(wire_mode(Some(crds::ApplyMode::Try)), ApplyMode::Try);
    }
}
