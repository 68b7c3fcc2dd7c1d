//! Unit tests for the Bootstrap stage

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::test_utils::*;
    use crds::{ConditionReason, ConditionType, ManagedStatus};
    use kube_runtime::controller::Action;

    const NODE: &str = "10.0.0.2";

    fn harness_with_bootstrap() -> Harness {
        let harness = Harness::new();
        harness
            .bootstraps
            .insert(create_test_bootstrap("cp-0", NODE, insecure_credentials()));
        harness
    }

    #[tokio::test]
    async fn test_bootstraps_exactly_once() {
        let harness = harness_with_bootstrap();

        let action = reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        assert_eq!(action, Action::requeue(SHORT_REQUEUE));
        for _ in 0..20 {
            let action = reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
            assert_eq!(action, Action::requeue(POLL_INTERVAL));
        }

        let node = harness.connector.node(NODE);
        assert_eq!(node.bootstrap_calls(), 1);
        assert!(node.is_bootstrapped());

        let status = harness.bootstraps.status("cp-0");
        assert!(status.is_bootstrapped());
        assert!(status.intent_issued_time.is_some());
        assert_eq!(
            status.resource().condition(ConditionType::Ready).map(|c| c.reason),
            Some(ConditionReason::Available)
        );
    }

    #[tokio::test]
    async fn test_stale_copy_does_not_bootstrap_again() {
        let harness = harness_with_bootstrap();
        let stale = harness.bootstraps.object("cp-0");
        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        assert!(harness.bootstraps.status("cp-0").is_bootstrapped());

        // A pass handed the record as it looked before the first write
        let action = harness.bootstrap_driver.reconcile(&stale).await.unwrap();
        assert_eq!(action, Action::requeue(POLL_INTERVAL));
        assert_eq!(harness.connector.node(NODE).bootstrap_calls(), 1);
        assert!(harness.bootstraps.status("cp-0").is_bootstrapped());
    }

    #[tokio::test]
    async fn test_intent_is_durable_before_the_call() {
        let harness = harness_with_bootstrap();
        harness.bootstraps.script_writes(&[false]);

        let err = reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap_err();
        assert!(matches!(err, ControllerError::Timeout(_)));
        assert_eq!(harness.connector.node(NODE).bootstrap_calls(), 0);
    }

    #[tokio::test]
    async fn test_lost_outcome_is_not_reissued() {
        let harness = harness_with_bootstrap();
        // Intent lands, the outcome write after a successful call does not
        harness.bootstraps.script_writes(&[true, false]);

        assert!(reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.is_err());
        let status = harness.bootstraps.status("cp-0");
        assert!(status.is_ambiguous());
        assert_eq!(harness.connector.node(NODE).bootstrap_calls(), 1);

        for _ in 0..10 {
            reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        }
        assert_eq!(harness.connector.node(NODE).bootstrap_calls(), 1);
        assert!(harness.bootstraps.status("cp-0").is_bootstrapped());
    }

    #[tokio::test]
    async fn test_failed_call_is_retried_after_checking_etcd() {
        let harness = harness_with_bootstrap();
        let node = harness.connector.node(NODE);
        node.set_bootstrap_failure(Some("connection reset by peer"));

        let err = reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap_err();
        assert!(matches!(err, ControllerError::RemoteBootstrap { ref node, .. } if node == NODE));
        assert!(!err.is_fatal());
        assert!(harness.bootstraps.status("cp-0").is_ambiguous());

        node.set_bootstrap_failure(None);
        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();

        assert_eq!(node.bootstrap_calls(), 2);
        assert!(node.is_bootstrapped());
        assert!(harness.bootstraps.status("cp-0").is_bootstrapped());
    }

    #[tokio::test]
    async fn test_already_bootstrapped_node_counts_as_success() {
        let harness = harness_with_bootstrap();
        let node = harness.connector.node(NODE);
        node.mark_bootstrapped();

        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        assert!(harness.bootstraps.status("cp-0").is_bootstrapped());
        assert_eq!(node.bootstrap_calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_node_while_ambiguous() {
        let harness = harness_with_bootstrap();
        harness.bootstraps.script_writes(&[true, false]);
        assert!(reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.is_err());

        harness.connector.set_unreachable(Some("no route to host"));
        let err = reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap_err();
        assert!(matches!(err, ControllerError::RemoteBootstrap { .. }));
        assert_eq!(harness.connector.node(NODE).bootstrap_calls(), 1);

        harness.connector.set_unreachable(None);
        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        assert_eq!(harness.connector.node(NODE).bootstrap_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_leaves_node_alone() {
        let harness = harness_with_bootstrap();
        reconcile(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();

        cleanup(&harness.bootstrap_driver, &harness.bootstraps, "cp-0").await.unwrap();
        let node = harness.connector.node(NODE);
        assert!(node.is_bootstrapped());
        assert!(node.resets().is_empty());
    }
}
