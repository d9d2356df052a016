use super::*;
use crate::storage;

pub struct TestHarness {
    pub db: Db,
    _tmp_dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage_path = tmp_dir.path().join("gofer_tests.db");

        let db = Db::new(storage_path.to_str().unwrap()).await.unwrap();

        Self {
            db,
            _tmp_dir: tmp_dir,
        }
    }

    /// Seeds the namespace -> pipeline -> config -> task chain most tables hang off of.
    pub async fn seed_pipeline(&self) {
        let mut conn = self.db.write_conn().await.unwrap();

        storage::namespaces::insert(
            &mut conn,
            &storage::namespaces::Namespace {
                id: "default".into(),
                name: "Default".into(),
                description: "The default namespace".into(),
                created: "0".into(),
                modified: "0".into(),
                deleted: "".into(),
            },
        )
        .await
        .unwrap();

        storage::pipeline_metadata::insert(
            &mut conn,
            &storage::pipeline_metadata::PipelineMetadata {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                state: "active".into(),
                created: "0".into(),
                modified: "0".into(),
            },
        )
        .await
        .unwrap();

        storage::pipeline_configs::insert(
            &mut conn,
            &storage::pipeline_configs::PipelineConfig {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                version: 1,
                parallelism: 0,
                state: "live".into(),
                registered: "0".into(),
                deprecated: "".into(),
            },
        )
        .await
        .unwrap();

        storage::tasks::insert(
            &mut conn,
            &storage::tasks::Task {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                pipeline_config_version: 1,
                task_id: "task-one".into(),
                description: "".into(),
                image: "ubuntu:latest".into(),
                registry_auth: "".into(),
                depends_on: "{}".into(),
                variables: "[]".into(),
                entrypoint: "".into(),
                command: "".into(),
                inject_api_token: false,
                retries: 0,
            },
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn crud_namespaces() {
    let harness = TestHarness::new().await;
    let mut conn = harness.db.write_conn().await.unwrap();

    let namespace = storage::namespaces::Namespace {
        id: "default".into(),
        name: "Default".into(),
        description: "The default namespace".into(),
        created: "100".into(),
        modified: "100".into(),
        deleted: "".into(),
    };

    storage::namespaces::insert(&mut conn, &namespace)
        .await
        .unwrap();

    let result = storage::namespaces::insert(&mut conn, &namespace)
        .await
        .unwrap_err();
    assert_eq!(result, StorageError::Exists);

    let fetched = storage::namespaces::get(&mut conn, "default").await.unwrap();
    assert_eq!(fetched, namespace);

    storage::namespaces::update(
        &mut conn,
        "default",
        storage::namespaces::UpdatableFields {
            description: Some("updated".into()),
            modified: "200".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let fetched = storage::namespaces::get(&mut conn, "default").await.unwrap();
    assert_eq!(fetched.description, "updated");
    assert_eq!(fetched.modified, "200");

    storage::namespaces::delete(&mut conn, "default", "300")
        .await
        .unwrap();

    let result = storage::namespaces::get(&mut conn, "default")
        .await
        .unwrap_err();
    assert_eq!(result, StorageError::NotFound);

    let namespaces = storage::namespaces::list(&mut conn).await.unwrap();
    assert!(namespaces.is_empty());
}

#[tokio::test]
async fn run_ids_are_monotonic_per_pipeline() {
    let harness = TestHarness::new().await;
    harness.seed_pipeline().await;

    let mut conn = harness.db.write_conn().await.unwrap();

    let run = storage::runs::Run {
        namespace_id: "default".into(),
        pipeline_id: "simple".into(),
        run_id: 0,
        pipeline_config_version: 1,
        started: "100".into(),
        ended: "".into(),
        state: "pending".into(),
        status: "unknown".into(),
        status_reason: "".into(),
        initiator: r#"{"initiator_type":"human","name":"tester","reason":""}"#.into(),
        variables: "[]".into(),
        store_objects_expired: false,
        event_id: None,
    };

    let first_id = storage::runs::insert(&mut conn, &run).await.unwrap();
    let second_id = storage::runs::insert(&mut conn, &run).await.unwrap();
    let third_id = storage::runs::insert(&mut conn, &run).await.unwrap();

    assert_eq!(first_id, 1);
    assert_eq!(second_id, 2);
    assert_eq!(third_id, 3);

    let latest = storage::runs::get_latest(&mut conn, "default", "simple")
        .await
        .unwrap();
    assert_eq!(latest.run_id, 3);

    let runs = storage::runs::list(&mut conn, "default", "simple", 0, 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].run_id, 3);
}

#[tokio::test]
async fn list_unfinished_runs() {
    let harness = TestHarness::new().await;
    harness.seed_pipeline().await;

    let mut conn = harness.db.write_conn().await.unwrap();

    let mut run = storage::runs::Run {
        namespace_id: "default".into(),
        pipeline_id: "simple".into(),
        run_id: 0,
        pipeline_config_version: 1,
        started: "100".into(),
        ended: "".into(),
        state: "running".into(),
        status: "unknown".into(),
        status_reason: "".into(),
        initiator: r#"{"initiator_type":"human","name":"tester","reason":""}"#.into(),
        variables: "[]".into(),
        store_objects_expired: false,
        event_id: None,
    };

    let unfinished_id = storage::runs::insert(&mut conn, &run).await.unwrap();

    run.state = "complete".into();
    storage::runs::insert(&mut conn, &run).await.unwrap();

    let unfinished = storage::runs::list_unfinished(&mut conn, 0, 100)
        .await
        .unwrap();

    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].run_id, unfinished_id);
}

#[tokio::test]
async fn crud_task_executions() {
    let harness = TestHarness::new().await;
    harness.seed_pipeline().await;

    let mut conn = harness.db.write_conn().await.unwrap();

    let run = storage::runs::Run {
        namespace_id: "default".into(),
        pipeline_id: "simple".into(),
        run_id: 0,
        pipeline_config_version: 1,
        started: "100".into(),
        ended: "".into(),
        state: "pending".into(),
        status: "unknown".into(),
        status_reason: "".into(),
        initiator: r#"{"initiator_type":"human","name":"tester","reason":""}"#.into(),
        variables: "[]".into(),
        store_objects_expired: false,
        event_id: None,
    };
    let run_id = storage::runs::insert(&mut conn, &run).await.unwrap();

    let execution = storage::task_executions::TaskExecution {
        namespace_id: "default".into(),
        pipeline_id: "simple".into(),
        run_id,
        task_id: "task-one".into(),
        task: "{}".into(),
        created: "100".into(),
        started: "".into(),
        ended: "".into(),
        attempt: 1,
        exit_code: None,
        scheduler_id: None,
        logs_expired: false,
        logs_removed: false,
        state: "processing".into(),
        status: "unknown".into(),
        status_reason: "".into(),
        variables: "[]".into(),
    };

    storage::task_executions::insert(&mut conn, &execution)
        .await
        .unwrap();

    storage::task_executions::update(
        &mut conn,
        "default",
        "simple",
        run_id,
        "task-one",
        storage::task_executions::UpdatableFields {
            state: Some("complete".into()),
            status: Some("successful".into()),
            exit_code: Some(0),
            scheduler_id: Some("container-abc".into()),
            ended: Some("200".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let fetched =
        storage::task_executions::get(&mut conn, "default", "simple", run_id, "task-one")
            .await
            .unwrap();

    assert_eq!(fetched.state, "complete");
    assert_eq!(fetched.status, "successful");
    assert_eq!(fetched.exit_code, Some(0));
    assert_eq!(fetched.scheduler_id, Some("container-abc".into()));
}

#[tokio::test]
async fn events_get_monotonic_ids() {
    let harness = TestHarness::new().await;
    let mut conn = harness.db.write_conn().await.unwrap();

    let event = storage::events::Event {
        id: 0,
        kind: r#"{"created_namespace":{"namespace_id":"default"}}"#.into(),
        emitted: "100".into(),
    };

    let first = storage::events::insert(&mut conn, &event).await.unwrap();
    let second = storage::events::insert(&mut conn, &event).await.unwrap();

    assert!(second > first);

    let events = storage::events::list(&mut conn, 0, 10, false).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].id, first);
    assert_eq!(events[1].id, second);

    let after = storage::events::list_after(&mut conn, first, 10).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, second);

    storage::events::delete(&mut conn, first).await.unwrap();
    let result = storage::events::get(&mut conn, first).await.unwrap_err();
    assert_eq!(result, StorageError::NotFound);
}

#[tokio::test]
async fn crud_extension_registrations_and_subscriptions() {
    let harness = TestHarness::new().await;
    harness.seed_pipeline().await;

    let mut conn = harness.db.write_conn().await.unwrap();

    let registration = storage::extension_registrations::ExtensionRegistration {
        extension_id: "interval".into(),
        image: "ghcr.io/gofer/extensions/interval:latest".into(),
        registry_auth: "".into(),
        settings: "[]".into(),
        created: "100".into(),
        modified: "100".into(),
        status: "enabled".into(),
    };

    storage::extension_registrations::insert(&mut conn, &registration)
        .await
        .unwrap();

    let result = storage::extension_registrations::insert(&mut conn, &registration)
        .await
        .unwrap_err();
    assert_eq!(result, StorageError::Exists);

    let subscription = storage::extension_subscriptions::ExtensionSubscription {
        namespace_id: "default".into(),
        pipeline_id: "simple".into(),
        extension_id: "interval".into(),
        subscription_id: "every-five".into(),
        settings: r#"{"every":"5s"}"#.into(),
        status: "active".into(),
        status_reason: "".into(),
    };

    storage::extension_subscriptions::insert(&mut conn, &subscription)
        .await
        .unwrap();

    let fetched = storage::extension_subscriptions::get(
        &mut conn,
        "default",
        "simple",
        "interval",
        "every-five",
    )
    .await
    .unwrap();
    assert_eq!(fetched, subscription);

    storage::extension_subscriptions::update(
        &mut conn,
        "default",
        "simple",
        "interval",
        "every-five",
        storage::extension_subscriptions::UpdatableFields {
            status: Some("error".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let listed = storage::extension_subscriptions::list_by_extension(&mut conn, "interval")
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, "error");

    // Deleting the registration should cascade to the subscription.
    storage::extension_registrations::delete(&mut conn, "interval")
        .await
        .unwrap();

    let result = storage::extension_subscriptions::get(
        &mut conn,
        "default",
        "simple",
        "interval",
        "every-five",
    )
    .await
    .unwrap_err();
    assert_eq!(result, StorageError::NotFound);
}

#[tokio::test]
async fn object_keys_keep_insertion_order() {
    let harness = TestHarness::new().await;
    harness.seed_pipeline().await;

    let mut conn = harness.db.write_conn().await.unwrap();

    for (key, created) in [("first", "100"), ("second", "200"), ("third", "300")] {
        storage::object_store_pipeline_keys::insert(
            &mut conn,
            &storage::object_store_pipeline_keys::ObjectStorePipelineKey {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                key: key.into(),
                created: created.into(),
            },
        )
        .await
        .unwrap();
    }

    let keys = storage::object_store_pipeline_keys::list(&mut conn, "default", "simple")
        .await
        .unwrap();

    let keys: Vec<String> = keys.into_iter().map(|k| k.key).collect();
    assert_eq!(keys, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn system_parameters_round_trip() {
    let harness = TestHarness::new().await;
    let mut conn = harness.db.write_conn().await.unwrap();

    let parameters = storage::system::get_system_parameters(&mut conn)
        .await
        .unwrap();
    assert!(!parameters.ignore_pipeline_run_events);

    storage::system::update_system_parameters(
        &mut conn,
        &storage::system::SystemParameters {
            ignore_pipeline_run_events: true,
        },
    )
    .await
    .unwrap();

    let parameters = storage::system::get_system_parameters(&mut conn)
        .await
        .unwrap();
    assert!(parameters.ignore_pipeline_run_events);
}
