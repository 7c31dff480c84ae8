//! End-to-end reconciliation scenarios against in-memory collaborators

use std::sync::atomic::Ordering;

use rds_operator::controller::{Delivery, Notification, ReconcileOutcome};
use rds_operator::crd::DatabaseState;
use rds_operator::resources::config_map::{HOST_KEY, PORT_KEY};

use crate::common::*;

use DatabaseState::*;

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_walks_every_state() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(
            h.databases.history("db1"),
            vec![Creating, CreatingService, CreatingConfigMap, Completed]
        );

        let status = h.databases.current(TEST_NAMESPACE, "db1").unwrap().status.unwrap();
        assert_eq!(status.db_connection_config, "db1");
        assert_eq!(status.db_credentials, "db-credentials");
        assert_eq!(status.observed_generation, Some(1));

        let config = h.config_maps.current(TEST_NAMESPACE, "db1").unwrap();
        let data = config.data.unwrap();
        assert_eq!(data[HOST_KEY], fake_hostname("db1"));
        assert_eq!(data[PORT_KEY], FAKE_PORT.to_string());

        let service = h.services.current(TEST_NAMESPACE, "db1").unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
        assert_eq!(spec.external_name, Some(fake_hostname("db1")));
    }

    #[tokio::test]
    async fn test_side_effects_follow_persisted_state() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));

        h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert_eq!(
            h.provider.calls(),
            vec!["create_database:db1", "create_service:db1"]
        );
    }

    #[tokio::test]
    async fn test_allocation_failure_leaves_nothing_behind() {
        let h = Harness::new();
        h.provider.fail_allocation("db2", "quota exceeded");
        let db = h.apply(create_test_database("db2"));

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        match outcome {
            ReconcileOutcome::Failed(message) => assert!(message.contains("quota exceeded")),
            other => panic!("Expected failure, got {other:?}"),
        }
        assert_eq!(h.databases.history("db2"), vec![Creating, Failed]);

        let status = h.databases.current(TEST_NAMESPACE, "db2").unwrap().status.unwrap();
        assert!(status.message.contains("quota exceeded"));
        assert!(h.services.current(TEST_NAMESPACE, "db2").is_none());
        assert!(h.config_maps.current(TEST_NAMESPACE, "db2").is_none());
        assert_eq!(h.provider.count("create_service"), 0);
    }

    #[tokio::test]
    async fn test_service_publish_failure_is_recorded() {
        let h = Harness::new();
        h.services.fail_writes("service quota exhausted");
        let db = h.apply(create_test_database("db1"));

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        match outcome {
            ReconcileOutcome::Failed(message) => {
                assert!(message.contains("service quota exhausted"))
            }
            other => panic!("Expected failure, got {other:?}"),
        }
        assert_eq!(
            h.databases.history("db1"),
            vec![Creating, CreatingService, Failed]
        );
        let status = h.databases.current(TEST_NAMESPACE, "db1").unwrap().status.unwrap();
        assert!(status.message.contains("service quota exhausted"));
        assert!(h.services.current(TEST_NAMESPACE, "db1").is_none());
        assert!(h.config_maps.current(TEST_NAMESPACE, "db1").is_none());
    }

    #[tokio::test]
    async fn test_config_publish_failure_is_recorded() {
        let h = Harness::new();
        h.config_maps.fail_writes("etcd unavailable");
        let db = h.apply(create_test_database("db1"));

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Failed(_)));
        assert_eq!(
            h.databases.history("db1"),
            vec![Creating, CreatingService, CreatingConfigMap, Failed]
        );
        let status = h.databases.current(TEST_NAMESPACE, "db1").unwrap().status.unwrap();
        assert!(status.message.contains("etcd unavailable"));
        assert!(h.services.current(TEST_NAMESPACE, "db1").is_some());
        assert!(h.config_maps.current(TEST_NAMESPACE, "db1").is_none());
    }

    #[tokio::test]
    async fn test_invalid_spec_fails_without_provider_call() {
        let h = Harness::new();
        let db = h.apply(
            DatabaseBuilder::new("db3", TEST_NAMESPACE)
                .with_engine("oracle")
                .build(),
        );

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Failed(_)));
        assert_eq!(h.databases.history("db3"), vec![Creating, Failed]);
        let status = h.databases.current(TEST_NAMESPACE, "db3").unwrap().status.unwrap();
        assert!(status.message.contains("oracle"));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_status_conflict_is_retried() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));
        h.databases.inject_conflicts(2);

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(h.databases.history("db1").last(), Some(&Completed));
    }

    #[tokio::test]
    async fn test_deleted_before_handling_is_skipped() {
        let h = Harness::new();
        let db = create_test_database("gone");

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
        assert!(h.provider.calls().is_empty());
    }
}

mod redelivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_completed_is_never_provisioned_again() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));
        h.engine.handle_create(&db, Delivery::Added).await.unwrap();
        let writes = h.databases.status_writes();

        for delivery in [Delivery::Added, Delivery::Updated] {
            let outcome = h.engine.handle_create(&db, delivery).await.unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
        }

        assert_eq!(h.provider.count("create_database"), 1);
        assert_eq!(h.databases.status_writes(), writes);
    }

    #[tokio::test]
    async fn test_update_echo_of_in_progress_state_is_skipped() {
        let h = Harness::new();
        let db = h.apply(
            DatabaseBuilder::new("db1", TEST_NAMESPACE)
                .with_state(CreatingService, None)
                .build(),
        );

        let outcome = h.engine.handle_create(&db, Delivery::Updated).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_on_relist() {
        let h = Harness::new();
        let db = h.apply(
            DatabaseBuilder::new("db1", TEST_NAMESPACE)
                .with_state(CreatingService, None)
                .build(),
        );

        let outcome = h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(
            h.databases.history("db1"),
            vec![CreatingService, CreatingConfigMap, Completed]
        );
        assert_eq!(h.provider.count("create_database"), 1);
        assert!(h.config_maps.current(TEST_NAMESPACE, "db1").is_some());
    }

    #[tokio::test]
    async fn test_failed_waits_for_an_edit() {
        let h = Harness::new();
        h.provider.fail_allocation("db2", "quota exceeded");
        let db = h.apply(create_test_database("db2"));
        h.engine.handle_create(&db, Delivery::Added).await.unwrap();

        h.provider.clear_failures();
        let outcome = h.engine.handle_create(&db, Delivery::Updated).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
        assert_eq!(h.provider.count("create_database"), 1);

        let edited = h.databases.edit(TEST_NAMESPACE, "db2", |spec| {
            spec.class = "db.t3.small".to_string();
        });
        let outcome = h
            .engine
            .handle_create(&edited, Delivery::Updated)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(
            h.databases.history("db2"),
            vec![Creating, Failed, Creating, CreatingService, CreatingConfigMap, Completed]
        );
        let status = h.databases.current(TEST_NAMESPACE, "db2").unwrap().status.unwrap();
        assert_eq!(status.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_handle_routes_notifications() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));

        h.engine.handle(Notification::Added(db.clone())).await;
        assert_eq!(h.databases.history("db1").last(), Some(&Completed));

        h.engine.handle(Notification::Deleted(db)).await;
        assert_eq!(h.provider.count("delete_database"), 1);
        assert!(h.services.current(TEST_NAMESPACE, "db1").is_none());
    }

    #[tokio::test]
    async fn test_only_successful_reconciles_are_timestamped() {
        let h = Harness::new();
        h.provider.fail_allocation("db2", "quota exceeded");
        let failing = h.apply(create_test_database("db2"));

        h.engine.handle(Notification::Added(failing)).await;
        assert_eq!(h.health.last_reconcile.load(Ordering::Relaxed), 0);

        let db = h.apply(create_test_database("db1"));
        h.engine.handle(Notification::Added(db)).await;
        assert!(h.health.last_reconcile.load(Ordering::Relaxed) > 0);
    }
}

mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_releases_database_and_service() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));
        h.engine.handle_create(&db, Delivery::Added).await.unwrap();
        h.databases.remove(TEST_NAMESPACE, "db1");

        let report = h.engine.handle_delete(&db).await;

        assert!(report.is_clean());
        assert_eq!(h.provider.count("delete_database"), 1);
        assert!(h.services.current(TEST_NAMESPACE, "db1").is_none());
        // Left to garbage collection
        assert!(h.config_maps.current(TEST_NAMESPACE, "db1").is_some());
    }

    #[tokio::test]
    async fn test_delete_continues_after_deallocation_failure() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));
        h.engine.handle_create(&db, Delivery::Added).await.unwrap();
        h.provider.fail_deallocation("instance is protected");

        let report = h.engine.handle_delete(&db).await;

        assert!(!report.is_clean());
        assert!(report.database.is_err());
        assert!(report.service.is_ok());
        assert!(h.services.current(TEST_NAMESPACE, "db1").is_none());
    }

    #[tokio::test]
    async fn test_delete_attempts_deallocation_when_service_removal_fails() {
        let h = Harness::new();
        let db = h.apply(create_test_database("db1"));
        h.engine.handle_create(&db, Delivery::Added).await.unwrap();
        h.services.fail_deletes("etcd unavailable");

        let report = h.engine.handle_delete(&db).await;

        assert!(report.database.is_ok());
        assert!(report.service.is_err());
        assert_eq!(
            h.provider.calls()[2..],
            ["delete_database:db1", "delete_service:db1"]
        );
    }

    #[tokio::test]
    async fn test_delete_ignores_status() {
        let h = Harness::new();
        let db = DatabaseBuilder::new("never-provisioned", TEST_NAMESPACE)
            .with_state(Failed, Some(1))
            .build();

        let report = h.engine.handle_delete(&db).await;

        assert!(report.is_clean());
        assert_eq!(h.provider.count("delete_database"), 1);
        assert_eq!(h.provider.count("delete_service"), 1);
    }
}
