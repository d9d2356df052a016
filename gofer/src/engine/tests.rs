use super::*;
use crate::engine::{
    event_handlers, event_utils, namespaces, objects, pipeline_configs, recovery, run_utils, runs,
    secrets, subscriptions, task_executions, tasks,
};
use crate::scheduler::{
    AttachContainerRequest, AttachContainerResponse, ContainerState, GetLogsRequest,
    GetStateRequest, GetStateResponse, Log, Scheduler, SchedulerError, StartContainerRequest,
    StartContainerResponse, StopContainerRequest,
};
use crate::{conf, object_store, secret_store, storage};
use bytes::Bytes;
use futures::Stream;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

/// Scripted behavior for a single container launch on the mock scheduler.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Container starts, stays running for `polls` state queries, then exits with `exit_code`.
    Run { polls: u32, exit_code: u8 },

    /// start_container fails with a transient connection error.
    FailToStart,

    /// Container starts but the next state query fails with a transient connection error and
    /// the container disappears.
    FailPoll,

    /// Container runs until stop_container is called, then exits with code 137.
    RunUntilStopped,
}

#[derive(Debug)]
struct MockContainer {
    behavior: MockBehavior,
    polls_left: u32,
    exit_code: Option<u8>,
    stopped: bool,
}

/// An in-memory scheduler that runs no containers at all; tests script what each launch should
/// do and the run state machine drives against it exactly as it would against docker.
#[derive(Debug, Default)]
pub struct MockScheduler {
    plans: StdMutex<HashMap<String, VecDeque<MockBehavior>>>,
    containers: StdMutex<HashMap<String, MockContainer>>,
    current_running: AtomicI64,
    pub max_running: AtomicI64,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up behaviors for a container id; each start_container call consumes one. Containers
    /// without a plan run to an immediate successful exit.
    pub fn plan(&self, container_id: &str, behaviors: Vec<MockBehavior>) {
        self.plans
            .lock()
            .unwrap()
            .insert(container_id.into(), behaviors.into());
    }

    fn container_started(&self) {
        let running = self.current_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
    }

    fn container_finished(&self) {
        self.current_running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Scheduler for MockScheduler {
    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        let behavior = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&req.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(MockBehavior::Run {
                polls: 0,
                exit_code: 0,
            });

        if matches!(behavior, MockBehavior::FailToStart) {
            return Err(SchedulerError::Connection(
                "mock scheduler could not start container".into(),
            ));
        }

        let polls_left = match &behavior {
            MockBehavior::Run { polls, .. } => *polls,
            _ => 0,
        };

        self.container_started();

        self.containers.lock().unwrap().insert(
            req.id.clone(),
            MockContainer {
                behavior,
                polls_left,
                exit_code: None,
                stopped: false,
            },
        );

        Ok(StartContainerResponse {
            scheduler_id: Some(format!("mock_{}", req.id)),
            url: None,
        })
    }

    async fn stop_container(&self, req: StopContainerRequest) -> Result<(), SchedulerError> {
        let mut containers = self.containers.lock().unwrap();

        match containers.get_mut(&req.id) {
            Some(container) => {
                container.stopped = true;
                Ok(())
            }
            None => Err(SchedulerError::NoSuchContainer(req.id)),
        }
    }

    async fn get_state(&self, req: GetStateRequest) -> Result<GetStateResponse, SchedulerError> {
        let mut containers = self.containers.lock().unwrap();

        let container = containers
            .get_mut(&req.id)
            .ok_or_else(|| SchedulerError::NoSuchContainer(req.id.clone()))?;

        if let Some(exit_code) = container.exit_code {
            return Ok(GetStateResponse {
                exit_code: Some(exit_code),
                state: ContainerState::Exited,
            });
        }

        match container.behavior.clone() {
            MockBehavior::FailPoll => {
                self.container_finished();
                containers.remove(&req.id);
                Err(SchedulerError::Connection(
                    "mock scheduler lost track of container".into(),
                ))
            }
            MockBehavior::RunUntilStopped => {
                if container.stopped {
                    container.exit_code = Some(137);
                    self.container_finished();
                    Ok(GetStateResponse {
                        exit_code: Some(137),
                        state: ContainerState::Exited,
                    })
                } else {
                    Ok(GetStateResponse {
                        exit_code: None,
                        state: ContainerState::Running,
                    })
                }
            }
            MockBehavior::Run { exit_code, .. } => {
                if container.stopped || container.polls_left == 0 {
                    container.exit_code = Some(exit_code);
                    self.container_finished();
                    Ok(GetStateResponse {
                        exit_code: Some(exit_code),
                        state: ContainerState::Exited,
                    })
                } else {
                    container.polls_left -= 1;
                    Ok(GetStateResponse {
                        exit_code: None,
                        state: ContainerState::Running,
                    })
                }
            }
            MockBehavior::FailToStart => unreachable!("failed starts never become containers"),
        }
    }

    fn get_logs(
        &self,
        _req: GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>> {
        Box::pin(futures::stream::iter(vec![
            Ok(Log::Stdout(Bytes::from_static(b"hello from the mock\n"))),
            Ok(Log::Stderr(Bytes::from_static(b"and goodbye\n"))),
        ]))
    }

    async fn attach_container(
        &self,
        _req: AttachContainerRequest,
    ) -> Result<AttachContainerResponse, SchedulerError> {
        Err(SchedulerError::Unknown(
            "attach is not supported by the mock scheduler".into(),
        ))
    }
}

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<MockScheduler>,
    _tmp_dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let tmp_dir = tempfile::tempdir().unwrap();
        let root = tmp_dir.path();

        let config = conf::api::ApiConfig {
            api: conf::api::Api {
                event_log_retention: 604800,
                event_prune_interval: 3600,
                log_level: "debug".into(),
                task_execution_log_retention: 50,
                task_execution_logs_dir: root.join("logs").to_string_lossy().to_string(),
                task_execution_stop_timeout: 5,
            },
            object_store: conf::api::ObjectStore {
                engine: object_store::Engine::Filesystem,
                pipeline_object_limit: 3,
                run_object_limit: 3,
                run_object_expiry: 20,
                filesystem: None,
            },
            server: conf::api::Server {
                url: "http://localhost:8080".into(),
                extension_address: "http://localhost:8080".into(),
                storage_path: root.join("gofer.db").to_string_lossy().to_string(),
            },
            ..Default::default()
        };

        let db = storage::Db::new(&config.server.storage_path).await.unwrap();

        let object_store_engine = object_store::filesystem::Engine::new(
            &object_store::filesystem::Config {
                path: root.join("objects").to_string_lossy().to_string(),
            },
        )
        .unwrap();

        let secret_store_engine = secret_store::sqlite::Engine::new(&secret_store::sqlite::Config {
            path: root.join("secrets.db").to_string_lossy().to_string(),
            encryption_key: "testtesttesttesttesttesttesttest".into(),
        })
        .await
        .unwrap();

        let mock_scheduler = Arc::new(MockScheduler::new());

        #[derive(Debug)]
        struct SharedScheduler(Arc<MockScheduler>);

        #[async_trait::async_trait]
        impl Scheduler for SharedScheduler {
            async fn start_container(
                &self,
                req: StartContainerRequest,
            ) -> Result<StartContainerResponse, SchedulerError> {
                self.0.start_container(req).await
            }

            async fn stop_container(
                &self,
                req: StopContainerRequest,
            ) -> Result<(), SchedulerError> {
                self.0.stop_container(req).await
            }

            async fn get_state(
                &self,
                req: GetStateRequest,
            ) -> Result<GetStateResponse, SchedulerError> {
                self.0.get_state(req).await
            }

            fn get_logs(
                &self,
                req: GetLogsRequest,
            ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>> {
                self.0.get_logs(req)
            }

            async fn attach_container(
                &self,
                req: AttachContainerRequest,
            ) -> Result<AttachContainerResponse, SchedulerError> {
                self.0.attach_container(req).await
            }
        }

        let engine = Engine::from_parts(
            config,
            db,
            Box::new(SharedScheduler(mock_scheduler.clone())),
            Box::new(object_store_engine),
            Box::new(secret_store_engine),
        )
        .await
        .unwrap();

        namespaces::create_default_namespace(&engine).await.unwrap();

        Self {
            engine,
            scheduler: mock_scheduler,
            _tmp_dir: tmp_dir,
        }
    }

    /// Registers a live pipeline config inside the default namespace.
    pub async fn register_pipeline(
        &self,
        pipeline_id: &str,
        parallelism: u64,
        task_list: Vec<tasks::Task>,
    ) {
        pipeline_configs::register_config(
            &self.engine,
            namespaces::DEFAULT_NAMESPACE_ID,
            pipeline_id,
            pipeline_configs::RegisterConfigRequest {
                parallelism,
                tasks: task_list,
            },
        )
        .await
        .unwrap();
    }

    pub async fn start_run(&self, pipeline_id: &str) -> runs::Run {
        event_handlers::launch_new_run(
            self.engine.clone(),
            namespaces::DEFAULT_NAMESPACE_ID,
            pipeline_id,
            runs::Initiator {
                initiator_type: runs::InitiatorType::Human,
                name: "tester".into(),
                reason: "integration test".into(),
            },
            vec![],
        )
        .await
        .unwrap()
    }

    /// Polls storage until the run reaches the 'complete' state or the deadline passes.
    pub async fn wait_run_complete(&self, pipeline_id: &str, run_id: u64) -> runs::Run {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);

        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for run {run_id} to complete"
            );

            let run_raw = {
                let mut conn = self.engine.storage.read_conn().await.unwrap();
                storage::runs::get(
                    &mut conn,
                    namespaces::DEFAULT_NAMESPACE_ID,
                    pipeline_id,
                    run_id as i64,
                )
                .await
                .unwrap()
            };

            let run: runs::Run = run_raw.try_into().unwrap();

            if run.state == runs::State::Complete {
                return run;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn get_task_execution(
        &self,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
    ) -> task_executions::TaskExecution {
        let mut conn = self.engine.storage.read_conn().await.unwrap();

        storage::task_executions::get(
            &mut conn,
            namespaces::DEFAULT_NAMESPACE_ID,
            pipeline_id,
            run_id as i64,
            task_id,
        )
        .await
        .unwrap()
        .try_into()
        .unwrap()
    }

    pub async fn all_events(&self) -> Vec<event_utils::Event> {
        let mut conn = self.engine.storage.read_conn().await.unwrap();
        let mut all = vec![];
        let mut offset = 0;

        loop {
            let page = storage::events::list(&mut conn, offset, 50, false)
                .await
                .unwrap();
            let count = page.len();

            for event_raw in page {
                all.push(event_raw.try_into().unwrap());
            }

            if count != 50 {
                break;
            }
            offset += count as i64;
        }

        all
    }
}

fn simple_task(id: &str, depends_on: Vec<(&str, tasks::RequiredParentStatus)>) -> tasks::Task {
    tasks::Task {
        id: id.into(),
        description: None,
        image: "ubuntu:latest".into(),
        registry_auth: None,
        depends_on: depends_on
            .into_iter()
            .map(|(parent, status)| (parent.to_string(), status))
            .collect(),
        variables: vec![],
        entrypoint: None,
        command: None,
        inject_api_token: false,
        retries: 0,
    }
}

fn container_id(pipeline_id: &str, run_id: u64, task_id: &str) -> String {
    task_executions::task_execution_container_id(
        namespaces::DEFAULT_NAMESPACE_ID,
        pipeline_id,
        run_id,
        task_id,
    )
}

#[tokio::test]
/// A three task chain runs to completion in dependency order and the event log reflects that
/// order exactly.
async fn happy_dag_runs_to_completion() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline(
            "happy-dag",
            0,
            vec![
                simple_task("task-a", vec![]),
                simple_task("task-b", vec![("task-a", tasks::RequiredParentStatus::Success)]),
                simple_task(
                    "task-c",
                    vec![
                        ("task-a", tasks::RequiredParentStatus::Success),
                        ("task-b", tasks::RequiredParentStatus::Success),
                    ],
                ),
            ],
        )
        .await;

    let run = harness.start_run("happy-dag").await;
    let run = harness.wait_run_complete("happy-dag", run.run_id).await;

    assert_eq!(run.status, runs::Status::Successful);

    for task_id in ["task-a", "task-b", "task-c"] {
        let execution = harness
            .get_task_execution("happy-dag", run.run_id, task_id)
            .await;
        assert_eq!(execution.state, task_executions::State::Complete);
        assert_eq!(execution.status, task_executions::Status::Successful);
        assert_eq!(execution.exit_code, Some(0));
        assert!(execution.scheduler_id.is_some());
    }

    // The event log observes the dependency order: run started before any task started, parents
    // completed before children started, run completed last.
    let events = harness.all_events().await;

    let position = |target: &event_utils::Kind| {
        events
            .iter()
            .position(|event| &event.kind == target)
            .unwrap_or_else(|| panic!("missing event {target:?}"))
    };

    let started_run = position(&event_utils::Kind::StartedRun {
        namespace_id: "default".into(),
        pipeline_id: "happy-dag".into(),
        run_id: run.run_id,
    });
    let completed_run = position(&event_utils::Kind::CompletedRun {
        namespace_id: "default".into(),
        pipeline_id: "happy-dag".into(),
        run_id: run.run_id,
        status: runs::Status::Successful,
    });

    let started = |task_id: &str| {
        position(&event_utils::Kind::StartedTaskExecution {
            namespace_id: "default".into(),
            pipeline_id: "happy-dag".into(),
            run_id: run.run_id,
            task_execution_id: task_id.into(),
        })
    };
    let completed = |task_id: &str| {
        position(&event_utils::Kind::CompletedTaskExecution {
            namespace_id: "default".into(),
            pipeline_id: "happy-dag".into(),
            run_id: run.run_id,
            task_execution_id: task_id.into(),
            status: task_executions::Status::Successful,
        })
    };

    assert!(started_run < started("task-a"));
    assert!(started("task-a") < completed("task-a"));
    assert!(completed("task-a") < started("task-b"));
    assert!(completed("task-b") < started("task-c"));
    assert!(completed("task-c") < completed_run);

    // Event ids are strictly increasing in log order.
    for window in events.windows(2) {
        assert!(window[0].id < window[1].id);
    }
}

#[tokio::test]
/// A log file exists for a finished task and ends with the end-of-log sentinel.
async fn task_logs_end_with_sentinel() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("log-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    let run = harness.start_run("log-pipe").await;
    let run = harness.wait_run_complete("log-pipe", run.run_id).await;
    assert_eq!(run.status, runs::Status::Successful);

    let log_path = task_executions::task_execution_log_path(
        &harness.engine.config.api.task_execution_logs_dir,
        namespaces::DEFAULT_NAMESPACE_ID,
        "log-pipe",
        run.run_id,
        "task-a",
    );

    // The tailer finishes slightly after the run does; poll briefly for the sentinel.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(&log_path).await {
            if contents.trim_end().ends_with(GOFER_EOF) {
                assert!(contents.contains("hello from the mock"));
                break;
            }
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for log sentinel"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
/// When a parent fails, children that require its success are skipped and the run is failed.
async fn failed_parent_skips_children() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline(
            "skip-pipe",
            0,
            vec![
                simple_task("task-a", vec![]),
                simple_task("task-b", vec![("task-a", tasks::RequiredParentStatus::Success)]),
            ],
        )
        .await;

    harness.scheduler.plan(
        &container_id("skip-pipe", 1, "task-a"),
        vec![MockBehavior::Run {
            polls: 0,
            exit_code: 1,
        }],
    );

    let run = harness.start_run("skip-pipe").await;
    let run = harness.wait_run_complete("skip-pipe", run.run_id).await;

    assert_eq!(run.status, runs::Status::Failed);

    let task_a = harness.get_task_execution("skip-pipe", run.run_id, "task-a").await;
    assert_eq!(task_a.status, task_executions::Status::Failed);
    assert_eq!(task_a.exit_code, Some(1));

    let task_b = harness.get_task_execution("skip-pipe", run.run_id, "task-b").await;
    assert_eq!(task_b.state, task_executions::State::Complete);
    assert_eq!(task_b.status, task_executions::Status::Skipped);
    assert_eq!(
        task_b.status_reason.unwrap().reason,
        task_executions::StatusReasonType::FailedPrecondition
    );
}

#[tokio::test]
/// A failure-gated task runs only when its parent fails.
async fn failure_dependency_runs_on_parent_failure() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline(
            "cleanup-pipe",
            0,
            vec![
                simple_task("task-a", vec![]),
                simple_task(
                    "on-failure",
                    vec![("task-a", tasks::RequiredParentStatus::Failure)],
                ),
            ],
        )
        .await;

    harness.scheduler.plan(
        &container_id("cleanup-pipe", 1, "task-a"),
        vec![MockBehavior::Run {
            polls: 0,
            exit_code: 1,
        }],
    );

    let run = harness.start_run("cleanup-pipe").await;
    let run = harness.wait_run_complete("cleanup-pipe", run.run_id).await;

    // The failure handler itself succeeded but the run still reflects the failed parent.
    assert_eq!(run.status, runs::Status::Failed);

    let handler = harness
        .get_task_execution("cleanup-pipe", run.run_id, "on-failure")
        .await;
    assert_eq!(handler.status, task_executions::Status::Successful);
}

#[tokio::test]
/// With parallelism set to 2, five independent tasks never exceed two concurrent containers.
async fn run_parallelism_is_enforced() {
    let harness = TestHarness::new().await;

    let task_list: Vec<tasks::Task> = (0..5)
        .map(|i| simple_task(&format!("task-{i}"), vec![]))
        .collect();

    harness.register_pipeline("para-pipe", 2, task_list).await;

    for i in 0..5 {
        harness.scheduler.plan(
            &container_id("para-pipe", 1, &format!("task-{i}")),
            vec![MockBehavior::Run {
                polls: 2,
                exit_code: 0,
            }],
        );
    }

    let run = harness.start_run("para-pipe").await;
    let run = harness.wait_run_complete("para-pipe", run.run_id).await;

    assert_eq!(run.status, runs::Status::Successful);
    assert!(
        harness.scheduler.max_running.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent containers with parallelism 2",
        harness.scheduler.max_running.load(Ordering::SeqCst)
    );
}

#[tokio::test]
/// Transient scheduler failures are retried against the task's retry budget with an incrementing
/// attempt counter; the task starts exactly retries + 1 times.
async fn transient_failures_consume_retry_budget() {
    let harness = TestHarness::new().await;

    let mut task = simple_task("task-a", vec![]);
    task.retries = 2;

    harness.register_pipeline("retry-pipe", 0, vec![task]).await;

    harness.scheduler.plan(
        &container_id("retry-pipe", 1, "task-a"),
        vec![
            MockBehavior::FailPoll,
            MockBehavior::FailPoll,
            MockBehavior::Run {
                polls: 0,
                exit_code: 0,
            },
        ],
    );

    let run = harness.start_run("retry-pipe").await;
    let run = harness.wait_run_complete("retry-pipe", run.run_id).await;

    assert_eq!(run.status, runs::Status::Successful);

    let execution = harness
        .get_task_execution("retry-pipe", run.run_id, "task-a")
        .await;
    assert_eq!(execution.status, task_executions::Status::Successful);
    assert_eq!(execution.attempt, 3);

    let events = harness.all_events().await;
    let started_count = events
        .iter()
        .filter(|event| {
            matches!(
                &event.kind,
                event_utils::Kind::StartedTaskExecution { task_execution_id, .. }
                    if task_execution_id == "task-a"
            )
        })
        .count();

    assert_eq!(started_count, 3);
}

#[tokio::test]
/// A container that can't even be handed to the scheduler is retried too; failed launch
/// attempts consume the retry budget without emitting started events.
async fn failed_launches_consume_retry_budget() {
    let harness = TestHarness::new().await;

    let mut task = simple_task("task-a", vec![]);
    task.retries = 1;

    harness
        .register_pipeline("relaunch-pipe", 0, vec![task])
        .await;

    harness.scheduler.plan(
        &container_id("relaunch-pipe", 1, "task-a"),
        vec![
            MockBehavior::FailToStart,
            MockBehavior::Run {
                polls: 0,
                exit_code: 0,
            },
        ],
    );

    let run = harness.start_run("relaunch-pipe").await;
    let run = harness.wait_run_complete("relaunch-pipe", run.run_id).await;

    assert_eq!(run.status, runs::Status::Successful);

    let execution = harness
        .get_task_execution("relaunch-pipe", run.run_id, "task-a")
        .await;
    assert_eq!(execution.attempt, 2);

    let events = harness.all_events().await;
    let started_count = events
        .iter()
        .filter(|event| {
            matches!(
                &event.kind,
                event_utils::Kind::StartedTaskExecution { task_execution_id, .. }
                    if task_execution_id == "task-a"
            )
        })
        .count();

    // Only the successful launch made it far enough to announce itself.
    assert_eq!(started_count, 1);
}

#[tokio::test]
/// Cancelling an in-flight run stops its containers within the grace period and finalizes the
/// run as cancelled, after which no further task events are emitted.
async fn cancellation_stops_running_tasks() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("cancel-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    harness.scheduler.plan(
        &container_id("cancel-pipe", 1, "task-a"),
        vec![MockBehavior::RunUntilStopped],
    );

    let run = harness.start_run("cancel-pipe").await;

    // Wait for the task to actually be running before cancelling.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "task never started");

        let execution = harness
            .get_task_execution("cancel-pipe", run.run_id, "task-a")
            .await;
        if execution.state == task_executions::State::Running {
            break;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    run_utils::cancel_run(
        &harness.engine,
        namespaces::DEFAULT_NAMESPACE_ID,
        "cancel-pipe",
        run.run_id,
        false,
    )
    .await
    .unwrap();

    let run = harness.wait_run_complete("cancel-pipe", run.run_id).await;
    assert_eq!(run.status, runs::Status::Cancelled);

    let execution = harness
        .get_task_execution("cancel-pipe", run.run_id, "task-a")
        .await;
    assert_eq!(execution.status, task_executions::Status::Cancelled);

    // The completed-run event is the last word for this run; nothing task related comes after.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let events = harness.all_events().await;

    let completed_run_position = events
        .iter()
        .position(|event| {
            matches!(&event.kind, event_utils::Kind::CompletedRun { run_id, .. } if *run_id == run.run_id)
        })
        .unwrap();

    for event in &events[completed_run_position + 1..] {
        assert!(!matches!(
            &event.kind,
            event_utils::Kind::StartedTaskExecution { .. }
                | event_utils::Kind::CompletedTaskExecution { .. }
        ));
    }
}

#[tokio::test]
/// A run interrupted between two tasks is picked up by recovery: finished work is left alone,
/// unfinished work launches, and the run completes.
async fn recovery_finishes_interrupted_run() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline(
            "recover-pipe",
            0,
            vec![
                simple_task("task-a", vec![]),
                simple_task("task-b", vec![("task-a", tasks::RequiredParentStatus::Success)]),
            ],
        )
        .await;

    // Simulate a run that crashed after task-a finished but before task-b launched: run row in
    // 'running', a started-run event with no completion, task-a complete, task-b still
    // processing.
    let mut run = runs::Run::new(
        namespaces::DEFAULT_NAMESPACE_ID,
        "recover-pipe",
        1,
        runs::Initiator {
            initiator_type: runs::InitiatorType::Human,
            name: "tester".into(),
            reason: "crash simulation".into(),
        },
        vec![],
    );
    run.state = runs::State::Running;

    let run_id = {
        let mut conn = harness.engine.storage.write_conn().await.unwrap();
        storage::runs::insert(&mut conn, &run.clone().try_into().unwrap())
            .await
            .unwrap()
    } as u64;

    harness
        .engine
        .event_bus
        .publish(event_utils::Kind::StartedRun {
            namespace_id: "default".into(),
            pipeline_id: "recover-pipe".into(),
            run_id,
        })
        .await
        .unwrap();

    let mut task_a = task_executions::TaskExecution::new(
        namespaces::DEFAULT_NAMESPACE_ID,
        "recover-pipe",
        run_id,
        simple_task("task-a", vec![]),
    );
    task_a.state = task_executions::State::Complete;
    task_a.status = task_executions::Status::Successful;
    task_a.exit_code = Some(0);
    task_a.scheduler_id = Some("mock_previous_life".into());

    let task_b = task_executions::TaskExecution::new(
        namespaces::DEFAULT_NAMESPACE_ID,
        "recover-pipe",
        run_id,
        simple_task("task-b", vec![("task-a", tasks::RequiredParentStatus::Success)]),
    );

    {
        let mut conn = harness.engine.storage.write_conn().await.unwrap();
        storage::task_executions::insert(&mut conn, &task_a.try_into().unwrap())
            .await
            .unwrap();
        storage::task_executions::insert(&mut conn, &task_b.try_into().unwrap())
            .await
            .unwrap();
    }

    // Sanity check: the scan sees exactly this run as orphaned.
    let orphans = recovery::find_orphaned_runs(&harness.engine).await.unwrap();
    assert_eq!(
        orphans,
        vec![("default".to_string(), "recover-pipe".to_string(), run_id)]
    );

    recovery::recover_runs(harness.engine.clone()).await.unwrap();

    let run = harness.wait_run_complete("recover-pipe", run_id).await;
    assert_eq!(run.status, runs::Status::Successful);

    let task_a = harness
        .get_task_execution("recover-pipe", run_id, "task-a")
        .await;
    assert_eq!(task_a.status, task_executions::Status::Successful);

    let task_b = harness
        .get_task_execution("recover-pipe", run_id, "task-b")
        .await;
    assert_eq!(task_b.status, task_executions::Status::Successful);

    // Once the completion event lands the scan comes back empty, which is what makes recovery
    // idempotent across repeated invocations.
    let orphans = recovery::find_orphaned_runs(&harness.engine).await.unwrap();
    assert!(orphans.is_empty());
}

#[tokio::test]
/// Events get monotonically increasing ids and live subscribers observe them in publish order.
async fn event_bus_delivers_in_order() {
    let harness = TestHarness::new().await;

    let mut subscriber = harness.engine.event_bus.subscribe_live();

    let first = harness
        .engine
        .event_bus
        .try_publish(event_utils::Kind::CreatedNamespace {
            namespace_id: "ns-one".into(),
        })
        .await
        .unwrap();

    let second = harness
        .engine
        .event_bus
        .try_publish(event_utils::Kind::CreatedNamespace {
            namespace_id: "ns-two".into(),
        })
        .await
        .unwrap();

    assert!(second.id > first.id);

    let received_first = subscriber.recv().await.unwrap();
    let received_second = subscriber.recv().await.unwrap();

    assert_eq!(received_first, first);
    assert_eq!(received_second, second);

    // Both events made it into the durable log as well.
    let mut conn = harness.engine.storage.read_conn().await.unwrap();
    let stored: event_utils::Event = storage::events::get(&mut conn, first.id as i64)
        .await
        .unwrap()
        .try_into()
        .unwrap();
    assert_eq!(stored, first);
}

#[test]
fn classify_task_executions_for_recovery() {
    let mut execution = task_executions::TaskExecution::new(
        "default",
        "pipe",
        1,
        simple_task("task-a", vec![]),
    );

    execution.state = task_executions::State::Complete;
    assert_eq!(
        recovery::classify_task_execution(&execution),
        recovery::RecoveryAction::AlreadyComplete
    );

    execution.state = task_executions::State::Processing;
    assert_eq!(
        recovery::classify_task_execution(&execution),
        recovery::RecoveryAction::Relaunch
    );

    execution.state = task_executions::State::Waiting;
    assert_eq!(
        recovery::classify_task_execution(&execution),
        recovery::RecoveryAction::Relaunch
    );

    execution.state = task_executions::State::Running;
    execution.scheduler_id = None;
    assert_eq!(
        recovery::classify_task_execution(&execution),
        recovery::RecoveryAction::MarkOrphaned
    );

    execution.scheduler_id = Some("container-abc".into());
    assert_eq!(
        recovery::classify_task_execution(&execution),
        recovery::RecoveryAction::Reattach
    );
}

#[tokio::test]
/// Pipeline object registries evict their oldest key once at the limit, strictly FIFO.
async fn pipeline_objects_evict_fifo() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("object-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    // Limit is 3 in the test config.
    for key in ["first", "second", "third", "fourth"] {
        objects::put_pipeline_object(
            &harness.engine,
            "default",
            "object-pipe",
            key,
            Bytes::from(key.to_string()),
            false,
        )
        .await
        .unwrap();
    }

    let keys = objects::list_pipeline_object_keys(&harness.engine, "default", "object-pipe")
        .await
        .unwrap();
    assert_eq!(keys, vec!["second", "third", "fourth"]);

    let result =
        objects::get_pipeline_object(&harness.engine, "default", "object-pipe", "first").await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    // Re-putting an existing key without force is rejected and does not evict anything.
    let result = objects::put_pipeline_object(
        &harness.engine,
        "default",
        "object-pipe",
        "third",
        Bytes::from_static(b"replacement"),
        false,
    )
    .await;
    assert!(matches!(result, Err(EngineError::Exists(_))));

    let keys = objects::list_pipeline_object_keys(&harness.engine, "default", "object-pipe")
        .await
        .unwrap();
    assert_eq!(keys, vec!["second", "third", "fourth"]);
}

#[tokio::test]
/// Secret references in variables resolve right before container launch; a missing secret fails
/// the task with a precondition failure and no retry.
async fn missing_secret_fails_task_without_retry() {
    let harness = TestHarness::new().await;

    let mut task = simple_task("task-a", vec![]);
    task.retries = 2;
    task.variables = vec![Variable {
        key: "SOME_SECRET".into(),
        value: "pipeline_secret{{ does-not-exist }}".into(),
        source: VariableSource::PipelineConfig,
    }];

    harness.register_pipeline("secret-pipe", 0, vec![task]).await;

    let run = harness.start_run("secret-pipe").await;
    let run = harness.wait_run_complete("secret-pipe", run.run_id).await;

    assert_eq!(run.status, runs::Status::Failed);

    let execution = harness
        .get_task_execution("secret-pipe", run.run_id, "task-a")
        .await;
    assert_eq!(execution.status, task_executions::Status::Failed);
    assert_eq!(
        execution.status_reason.unwrap().reason,
        task_executions::StatusReasonType::FailedPrecondition
    );
    // The failure happened before the scheduler was ever involved.
    assert_eq!(execution.attempt, 1);
    assert!(execution.scheduler_id.is_none());
}

#[tokio::test]
/// Secrets resolve into task variables when they exist.
async fn pipeline_secret_resolves_into_variables() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("secret-ok-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    secrets::put_pipeline_secret(
        &harness.engine,
        "default",
        "secret-ok-pipe",
        "api-token",
        b"hunter2".to_vec(),
        false,
    )
    .await
    .unwrap();

    let resolved = interpolate_vars(
        &harness.engine,
        "default",
        "secret-ok-pipe",
        None,
        &vec![Variable {
            key: "TOKEN".into(),
            value: "pipeline_secret{{ api-token }}".into(),
            source: VariableSource::PipelineConfig,
        }],
    )
    .await
    .unwrap();

    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].value, "hunter2");
}

#[tokio::test]
/// Global secrets honor their namespace allow-list.
async fn global_secrets_enforce_namespace_allow_list() {
    let harness = TestHarness::new().await;

    secrets::put_global_secret(
        &harness.engine,
        "deploy-key",
        b"ssh-key-material".to_vec(),
        vec!["prod-*".into()],
        false,
    )
    .await
    .unwrap();

    let result = secrets::get_global_secret(&harness.engine, "prod-east", "deploy-key").await;
    assert_eq!(result.unwrap(), b"ssh-key-material".to_vec());

    let result = secrets::get_global_secret(&harness.engine, "default", "deploy-key").await;
    assert!(matches!(result, Err(EngineError::FailedPrecondition(_))));
}

#[test]
fn glob_matching() {
    assert!(secrets::matches_glob("*", "anything"));
    assert!(secrets::matches_glob("default", "default"));
    assert!(!secrets::matches_glob("default", "default-2"));
    assert!(secrets::matches_glob("prod-*", "prod-east"));
    assert!(!secrets::matches_glob("prod-*", "dev-east"));
    assert!(secrets::matches_glob("*-east", "prod-east"));
    assert!(secrets::matches_glob("a*c", "abc"));
    assert!(!secrets::matches_glob("a*c", "abd"));
}

#[test]
fn interpolation_syntax_parsing() {
    let (kind, value) = parse_interpolation_syntax("pipeline_secret{{ some-key }}").unwrap();
    assert!(matches!(kind, InterpolationKind::PipelineSecret));
    assert_eq!(value, "some-key");

    let (kind, value) = parse_interpolation_syntax("global_secret{{other}}").unwrap();
    assert!(matches!(kind, InterpolationKind::GlobalSecret));
    assert_eq!(value, "other");

    let (kind, _) = parse_interpolation_syntax("run_object{{ obj }}").unwrap();
    assert!(matches!(kind, InterpolationKind::RunObject));

    let (kind, _) = parse_interpolation_syntax("pipeline_object{{ obj }}").unwrap();
    assert!(matches!(kind, InterpolationKind::PipelineObject));

    assert!(parse_interpolation_syntax("plain value").is_none());
    assert!(parse_interpolation_syntax("unknown_kind{{ value }}").is_none());
}

#[test]
fn variable_precedence_lowest_to_highest() {
    let task = tasks::Task {
        variables: vec![
            Variable {
                key: "SHARED".into(),
                value: "from-config".into(),
                source: VariableSource::PipelineConfig,
            },
            Variable {
                key: "CONFIG_ONLY".into(),
                value: "config".into(),
                source: VariableSource::PipelineConfig,
            },
        ],
        ..simple_task("task-a", vec![])
    };

    let mut run = runs::Run::new(
        "default",
        "pipe",
        1,
        runs::Initiator::default(),
        vec![
            Variable {
                key: "SHARED".into(),
                value: "from-extension".into(),
                source: VariableSource::Extension,
            },
            Variable {
                key: "SHARED".into(),
                value: "from-run-options".into(),
                source: VariableSource::RunOptions,
            },
            Variable {
                key: "EXTENSION_ONLY".into(),
                value: "extension".into(),
                source: VariableSource::Extension,
            },
        ],
    );
    run.run_id = 1;

    let combined = run_utils::combine_variables(&run, &task);
    let by_key: HashMap<String, Variable> = combined
        .into_iter()
        .map(|variable| (variable.key.clone(), variable))
        .collect();

    // Run options beat extension values which beat config values.
    assert_eq!(by_key["SHARED"].value, "from-run-options");
    assert_eq!(by_key["CONFIG_ONLY"].value, "config");
    assert_eq!(by_key["EXTENSION_ONLY"].value, "extension");

    // System injected values ride along.
    assert_eq!(by_key["GOFER_PIPELINE_ID"].value, "pipe");
    assert_eq!(by_key["GOFER_RUN_ID"].value, "1");
    assert_eq!(by_key["GOFER_TASK_ID"].value, "task-a");
}

#[test]
fn task_graph_validation() {
    // Unknown dependency.
    let result = pipeline_configs::validate_task_graph(&[simple_task(
        "task-a",
        vec![("ghost", tasks::RequiredParentStatus::Success)],
    )]);
    assert!(result.is_err());

    // Self dependency.
    let result = pipeline_configs::validate_task_graph(&[simple_task(
        "task-a",
        vec![("task-a", tasks::RequiredParentStatus::Success)],
    )]);
    assert!(result.is_err());

    // Cycle.
    let result = pipeline_configs::validate_task_graph(&[
        simple_task("task-a", vec![("task-b", tasks::RequiredParentStatus::Success)]),
        simple_task("task-b", vec![("task-a", tasks::RequiredParentStatus::Success)]),
    ]);
    assert!(result.is_err());

    // A valid diamond.
    let result = pipeline_configs::validate_task_graph(&[
        simple_task("task-a", vec![]),
        simple_task("task-b", vec![("task-a", tasks::RequiredParentStatus::Success)]),
        simple_task("task-c", vec![("task-a", tasks::RequiredParentStatus::Success)]),
        simple_task(
            "task-d",
            vec![
                ("task-b", tasks::RequiredParentStatus::Any),
                ("task-c", tasks::RequiredParentStatus::Any),
            ],
        ),
    ]);
    assert!(result.is_ok());
}

#[test]
fn identifier_validation() {
    assert!(is_valid_identifier("my-pipeline").is_ok());
    assert!(is_valid_identifier("abc123").is_ok());
    assert!(is_valid_identifier("ab").is_err());
    assert!(is_valid_identifier("with_underscore").is_err());
    assert!(is_valid_identifier("with space").is_err());
    assert!(is_valid_identifier(&"x".repeat(33)).is_err());

    // The reserved global secret keyspace can never collide with a namespace id.
    assert!(is_valid_identifier("global_secret").is_err());
}

#[tokio::test]
/// The latest and live config versions are protected from deletion.
async fn live_and_latest_configs_cannot_be_deleted() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("config-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;
    harness
        .register_pipeline("config-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    // Version 2 is both live and latest.
    let result =
        pipeline_configs::delete_config(&harness.engine, "default", "config-pipe", 2).await;
    assert!(matches!(result, Err(EngineError::FailedPrecondition(_))));

    // Version 1 is deprecated and not the latest, so deleting it is allowed.
    pipeline_configs::delete_config(&harness.engine, "default", "config-pipe", 1)
        .await
        .unwrap();

    let mut conn = harness.engine.storage.read_conn().await.unwrap();
    let live = storage::pipeline_configs::get_live(&mut conn, "default", "config-pipe")
        .await
        .unwrap();
    assert_eq!(live.version, 2);

    let configs = storage::pipeline_configs::list(&mut conn, "default", "config-pipe")
        .await
        .unwrap();
    assert_eq!(configs.len(), 1);
}

#[tokio::test]
/// Registering a new config version deprecates the old live version; only one config is ever
/// live.
async fn registering_config_rolls_live_version() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("roll-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;
    harness
        .register_pipeline("roll-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;
    harness
        .register_pipeline("roll-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    let mut conn = harness.engine.storage.read_conn().await.unwrap();

    let configs = storage::pipeline_configs::list(&mut conn, "default", "roll-pipe")
        .await
        .unwrap();
    assert_eq!(configs.len(), 3);

    let live_versions: Vec<i64> = configs
        .iter()
        .filter(|config| config.state == "live")
        .map(|config| config.version)
        .collect();
    assert_eq!(live_versions, vec![3]);

    for config in configs {
        if config.version != 3 {
            assert_eq!(config.state, "deprecated");
            assert!(!config.deprecated.is_empty());
        }
    }
}

#[tokio::test]
/// The global ignore switch drops run requests while still allowing the flag to round trip
/// through storage.
async fn ignore_pipeline_run_events_blocks_new_runs() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("ignored-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    harness.engine.toggle_event_ingress(true).await.unwrap();

    let result = event_handlers::launch_new_run(
        harness.engine.clone(),
        "default",
        "ignored-pipe",
        runs::Initiator {
            initiator_type: runs::InitiatorType::Human,
            name: "tester".into(),
            reason: "should be dropped".into(),
        },
        vec![],
    )
    .await;

    assert!(matches!(result, Err(EngineError::FailedPrecondition(_))));

    harness.engine.toggle_event_ingress(false).await.unwrap();

    let run = harness.start_run("ignored-pipe").await;
    let run = harness.wait_run_complete("ignored-pipe", run.run_id).await;
    assert_eq!(run.status, runs::Status::Successful);
}

#[tokio::test]
/// A persisted subscription whose extension isn't running gets marked errored during restore
/// instead of aborting startup.
async fn restoring_subscription_with_dead_extension_marks_it_errored() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("sub-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    {
        let mut conn = harness.engine.storage.write_conn().await.unwrap();

        storage::extension_registrations::insert(
            &mut conn,
            &storage::extension_registrations::ExtensionRegistration {
                extension_id: "interval".into(),
                image: "ghcr.io/gofer/extensions/interval:latest".into(),
                registry_auth: "".into(),
                settings: "[]".into(),
                created: "0".into(),
                modified: "0".into(),
                status: "enabled".into(),
            },
        )
        .await
        .unwrap();

        storage::extension_subscriptions::insert(
            &mut conn,
            &storage::extension_subscriptions::ExtensionSubscription {
                namespace_id: "default".into(),
                pipeline_id: "sub-pipe".into(),
                extension_id: "interval".into(),
                subscription_id: "every-five".into(),
                settings: "{}".into(),
                status: "active".into(),
                status_reason: "".into(),
            },
        )
        .await
        .unwrap();
    }

    // The extension cache is empty (nothing actually started), so the replay must fail softly.
    subscriptions::restore_extension_subscriptions(&harness.engine)
        .await
        .unwrap();

    let mut conn = harness.engine.storage.read_conn().await.unwrap();
    let subscription = storage::extension_subscriptions::get(
        &mut conn,
        "default",
        "sub-pipe",
        "interval",
        "every-five",
    )
    .await
    .unwrap();

    assert_eq!(subscription.status, "error");
    assert!(!subscription.status_reason.is_empty());

    // Unsubscribing afterwards leaves no residue even though the extension is unreachable.
    subscriptions::unsubscribe_extension(
        &harness.engine,
        "default",
        "sub-pipe",
        "interval",
        "every-five",
    )
    .await
    .unwrap();

    let result = storage::extension_subscriptions::get(
        &mut conn,
        "default",
        "sub-pipe",
        "interval",
        "every-five",
    )
    .await
    .unwrap_err();
    assert_eq!(result, storage::StorageError::NotFound);
}

#[tokio::test]
/// Run ids assigned through the run launch path are strictly increasing per pipeline.
async fn run_ids_increase_monotonically() {
    let harness = TestHarness::new().await;

    harness
        .register_pipeline("serial-pipe", 0, vec![simple_task("task-a", vec![])])
        .await;

    let first = harness.start_run("serial-pipe").await;
    harness.wait_run_complete("serial-pipe", first.run_id).await;

    let second = harness.start_run("serial-pipe").await;
    harness.wait_run_complete("serial-pipe", second.run_id).await;

    assert_eq!(first.run_id, 1);
    assert_eq!(second.run_id, 2);
}
