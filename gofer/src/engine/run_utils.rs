use crate::engine::{
    epoch_milli, event_utils, interpolate_vars, objects, pipelines, runs, task_executions, tasks,
    Engine, EngineError, Variable, VariableSource, GOFER_EOF,
};
use crate::{scheduler, storage};
use anyhow::{bail, Result};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{atomic, Arc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// The shepherd is a run specific object that guides Gofer runs and tasks through their execution.
/// It's a core construct within the Gofer execution model and contains most of the logic of how a
/// run operates, which mostly consists of state-machine like actions.
#[derive(Debug)]
pub struct Shepherd {
    pub engine: Arc<Engine>,
    pub pipeline: pipelines::Pipeline,
    pub run: runs::Run,

    /// Tracks the most up to date view of every task execution within the run, keyed by task id.
    /// Dependency waits resolve against this map.
    pub task_executions: DashMap<String, task_executions::TaskExecution>,

    /// Set when the run has been cancelled; watchers consult it to decide between a 'failed' and
    /// a 'cancelled' terminal status.
    pub stop_run: atomic::AtomicBool,

    /// Cancelled once the run reaches a terminal state so per-run helper tasks can wind down.
    finished: CancellationToken,

    /// Bounds how many of this run's tasks may be inside the scheduler at once. None when the
    /// pipeline config doesn't limit parallelism.
    parallelism_slots: Option<Arc<Semaphore>>,
}

impl Shepherd {
    pub fn new(engine: Arc<Engine>, pipeline: pipelines::Pipeline, run: runs::Run) -> Self {
        let parallelism_slots = match pipeline.config.parallelism {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit as usize))),
        };

        Self {
            engine,
            pipeline,
            run,
            task_executions: DashMap::new(),
            stop_run: false.into(),
            finished: CancellationToken::new(),
            parallelism_slots,
        }
    }

    /// Creates all child task executions for the run and then blocks until every one of them has
    /// reached a terminal state, at which point the run itself is finalized.
    pub async fn execute_task_tree(self: Arc<Self>) {
        trace!(
            namespace_id = self.pipeline.metadata.namespace_id,
            pipeline_id = self.pipeline.metadata.pipeline_id,
            run_id = self.run.run_id,
            "Starting run"
        );

        self.launch_helper_tasks();

        {
            let mut conn = match self.engine.storage.write_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Could not establish connection to database while attempting to start run");
                    return;
                }
            };

            if let Err(e) = storage::runs::update(
                &mut conn,
                &self.pipeline.metadata.namespace_id,
                &self.pipeline.metadata.pipeline_id,
                self.run.run_id as i64,
                storage::runs::UpdatableFields {
                    state: Some(runs::State::Running.to_string()),
                    ..Default::default()
                },
            )
            .await
            {
                error!(error = %e, "Could not update run while attempting to start run");
                return;
            };
        }

        for task in self.pipeline.config.tasks.values() {
            tokio::spawn(self.clone().launch_task_execution(task.clone(), false));
        }

        self.wait_run_finish().await;
    }

    /// Launch the per-run helper tasks: the cancellation watch plus the clean up jobs that keep
    /// resources from filling up. Called both on fresh runs and on recovered ones.
    pub fn launch_helper_tasks(self: &Arc<Self>) {
        tokio::spawn(self.clone().watch_for_cancellation());
        tokio::spawn(self.clone().handle_run_object_expiry());
        tokio::spawn(self.clone().handle_run_log_expiry());
    }

    /// Check the dependency tree of a task to see if all its parents have finished.
    fn parent_tasks_complete(
        &self,
        dependency_map: &HashMap<String, tasks::RequiredParentStatus>,
    ) -> bool {
        for parent_id in dependency_map.keys() {
            let parent = match self.task_executions.get(parent_id) {
                Some(parent) => parent,
                None => return false,
            };

            if parent.state != task_executions::State::Complete {
                return false;
            }
        }

        true
    }

    /// Check a dependency tree to see if all parent tasks are in the correct states.
    fn task_dependencies_satisfied(
        &self,
        dependency_map: &HashMap<String, tasks::RequiredParentStatus>,
    ) -> Result<()> {
        for (parent, required_status) in dependency_map {
            let parent_execution = match self.task_executions.get(parent) {
                Some(parent_execution) => parent_execution,
                None => bail!(
                    "Could not find parent dependency '{parent}' in task execution list while \
                    attempting to verify task dependency satisfaction"
                ),
            };

            match required_status {
                tasks::RequiredParentStatus::Unknown => {
                    bail!("Found a parent dependency in state 'Unknown'; Invalid state")
                }
                tasks::RequiredParentStatus::Any => {
                    if !parent_execution.status.is_terminal() {
                        bail!(
                            "Parent '{parent}' has incorrect status '{}' for required 'any' dependency",
                            parent_execution.status
                        );
                    }
                }
                tasks::RequiredParentStatus::Success => {
                    if parent_execution.status != task_executions::Status::Successful {
                        bail!(
                            "Parent '{parent}' has incorrect status '{}' for required 'successful' dependency",
                            parent_execution.status
                        );
                    }
                }
                tasks::RequiredParentStatus::Failure => {
                    if parent_execution.status != task_executions::Status::Failed {
                        bail!(
                            "Parent '{parent}' has incorrect status '{}' for required 'failed' dependency",
                            parent_execution.status
                        );
                    }
                }
            }
        }

        Ok(())
    }

    async fn set_task_execution_state(&self, task_id: &str, state: task_executions::State) {
        self.task_executions.alter(task_id, |_, mut value| {
            value.state = state.clone();
            value
        });

        let mut conn = match self.engine.storage.write_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, task_id = task_id, "Could not establish connection to database while updating task execution state");
                return;
            }
        };

        if let Err(e) = storage::task_executions::update(
            &mut conn,
            &self.pipeline.metadata.namespace_id,
            &self.pipeline.metadata.pipeline_id,
            self.run.run_id as i64,
            task_id,
            storage::task_executions::UpdatableFields {
                state: Some(state.to_string()),
                ..Default::default()
            },
        )
        .await
        {
            error!(error = %e, task_id = task_id, "Could not update task execution state in storage");
        }
    }

    /// Marks a task execution as having reached a terminal state in storage, announces the
    /// completion on the event bus, and only then flips the in-memory map that dependency waits
    /// resolve against. The map is last on purpose: a downstream task can't observe its parent
    /// as complete (and emit its own started event) until the parent's completed event already
    /// sits in the log, which keeps per-run event ordering strict.
    pub async fn set_task_execution_complete(
        &self,
        task_id: &str,
        exit_code: Option<u8>,
        status: task_executions::Status,
        reason: Option<task_executions::StatusReason>,
    ) {
        let status_reason = reason.and_then(|value| serde_json::to_string(&value).ok());

        match self.engine.storage.write_conn().await {
            Ok(mut conn) => {
                if let Err(e) = storage::task_executions::update(
                    &mut conn,
                    &self.pipeline.metadata.namespace_id,
                    &self.pipeline.metadata.pipeline_id,
                    self.run.run_id as i64,
                    task_id,
                    storage::task_executions::UpdatableFields {
                        ended: Some(epoch_milli().to_string()),
                        exit_code: exit_code.map(|code| code as i64),
                        state: Some(task_executions::State::Complete.to_string()),
                        status: Some(status.to_string()),
                        status_reason,
                        ..Default::default()
                    },
                )
                .await
                {
                    error!(error = %e, task_id = task_id, "Could not update task execution in storage while completing task execution");
                }
            }
            Err(e) => {
                error!(error = %e, task_id = task_id, "Could not establish connection to database while completing task execution");
            }
        }

        self.engine
            .event_bus
            .publish(event_utils::Kind::CompletedTaskExecution {
                namespace_id: self.pipeline.metadata.namespace_id.clone(),
                pipeline_id: self.pipeline.metadata.pipeline_id.clone(),
                run_id: self.run.run_id,
                task_execution_id: task_id.to_string(),
                status: status.clone(),
            })
            .await;

        self.task_executions.alter(task_id, |_, mut value| {
            value.state = task_executions::State::Complete;
            value.status = status;
            value.exit_code = exit_code;
            value.ended = epoch_milli();
            value
        });
    }

    async fn set_run_complete(&self, status: runs::Status, reason: Option<runs::StatusReason>) {
        let status_reason = reason.and_then(|value| serde_json::to_string(&value).ok());

        let mut conn = match self.engine.storage.write_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Could not establish connection to database while completing run");
                return;
            }
        };

        if let Err(e) = storage::runs::update(
            &mut conn,
            &self.pipeline.metadata.namespace_id,
            &self.pipeline.metadata.pipeline_id,
            self.run.run_id as i64,
            storage::runs::UpdatableFields {
                ended: Some(epoch_milli().to_string()),
                state: Some(runs::State::Complete.to_string()),
                status: Some(status.to_string()),
                status_reason,
                ..Default::default()
            },
        )
        .await
        {
            error!(error = %e, "Could not update run in storage while completing run");
        }

        drop(conn);

        self.engine
            .event_bus
            .publish(event_utils::Kind::CompletedRun {
                namespace_id: self.pipeline.metadata.namespace_id.clone(),
                pipeline_id: self.pipeline.metadata.pipeline_id.clone(),
                run_id: self.run.run_id,
                status,
            })
            .await;
    }

    /// Recovery uses this to seed the in-memory map with task executions that already reached a
    /// terminal state before a restart, so that downstream dependency waits resolve.
    pub fn register_existing_task_execution(&self, task_execution: task_executions::TaskExecution) {
        self.task_executions
            .insert(task_execution.task_id.clone(), task_execution);
    }

    /// Monitors all task execution statuses and determines the final run status based on all
    /// finished task executions. It will block until all task executions have finished.
    pub async fn wait_run_finish(self: Arc<Self>) {
        // If the task execution map hasn't had all the entries come in yet we wait until it does.
        loop {
            if self.task_executions.len() != self.pipeline.config.tasks.len() {
                tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
                continue;
            }

            break;
        }

        // Then we loop over the map until all executions are terminal.
        'outer: loop {
            for item in self.task_executions.iter() {
                if item.value().state != task_executions::State::Complete {
                    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
                    continue 'outer;
                }
            }

            break;
        }

        // When all are finished we tally up what the run's final status is.
        // Precedence, strongest first: cancelled, failed, successful. Skipped executions don't
        // count against the run.
        let mut any_cancelled = self.stop_run.load(atomic::Ordering::SeqCst);
        let mut any_failed = false;

        for item in self.task_executions.iter() {
            match item.value().status {
                task_executions::Status::Cancelled => any_cancelled = true,
                task_executions::Status::Failed | task_executions::Status::Unknown => {
                    any_failed = true
                }
                task_executions::Status::Successful | task_executions::Status::Skipped => {}
            }
        }

        if any_cancelled {
            self.set_run_complete(
                runs::Status::Cancelled,
                Some(runs::StatusReason {
                    reason: runs::StatusReasonType::Cancelled,
                    description: "One or more task executions were cancelled during execution"
                        .into(),
                }),
            )
            .await;
        } else if any_failed {
            self.set_run_complete(
                runs::Status::Failed,
                Some(runs::StatusReason {
                    reason: runs::StatusReasonType::AbnormalExit,
                    description: "One or more task executions failed during execution".into(),
                }),
            )
            .await;
        } else {
            self.set_run_complete(runs::Status::Successful, None).await;
        }

        self.finished.cancel();
    }

    /// Listens for run cancellation announcements on the event bus and, when one arrives for this
    /// run, flips the stop flag and asks the scheduler to stop every non-terminal container.
    async fn watch_for_cancellation(self: Arc<Self>) {
        let mut receiver = self.engine.event_bus.subscribe_live();

        loop {
            tokio::select! {
                _ = self.finished.cancelled() => return,
                _ = self.engine.shutdown.cancelled() => return,
                event = receiver.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    };

                    if let event_utils::Kind::StartedRunCancellation {
                        namespace_id,
                        pipeline_id,
                        run_id,
                        timeout,
                    } = event.kind
                    {
                        if namespace_id != self.pipeline.metadata.namespace_id
                            || pipeline_id != self.pipeline.metadata.pipeline_id
                            || run_id != self.run.run_id
                        {
                            continue;
                        }

                        self.stop_run.store(true, atomic::Ordering::SeqCst);
                        self.cancel_all_task_executions(timeout as i64).await;
                    }
                }
            }
        }
    }

    /// Delivers a stop to every task container that hasn't reached a terminal state yet. The
    /// exit watchers observe the container stopping and record the cancelled status.
    pub async fn cancel_all_task_executions(&self, timeout: i64) {
        let mut target_ids = vec![];

        for item in self.task_executions.iter() {
            let task_execution = item.value();

            match task_execution.state {
                task_executions::State::Waiting | task_executions::State::Running => {
                    target_ids.push(task_execution.task_id.clone());
                }
                _ => {}
            }
        }

        for task_id in target_ids {
            let container_id = task_executions::task_execution_container_id(
                &self.pipeline.metadata.namespace_id,
                &self.pipeline.metadata.pipeline_id,
                self.run.run_id,
                &task_id,
            );

            if let Err(e) = self
                .engine
                .scheduler
                .stop_container(scheduler::StopContainerRequest {
                    id: container_id,
                    timeout,
                })
                .await
            {
                debug!(error = %e, task_id = task_id, "Could not stop container while cancelling task executions");
            }
        }
    }

    /// Polls the scheduler for the container's state until the container has reached a terminal
    /// state, recording the result. Returns an error only for transient scheduler failures so the
    /// caller can apply the task's retry budget.
    async fn wait_task_execution_finish(
        &self,
        container_id: &str,
        task_id: &str,
    ) -> Result<(), scheduler::SchedulerError> {
        loop {
            let response = match self
                .engine
                .scheduler
                .get_state(scheduler::GetStateRequest {
                    id: container_id.into(),
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    if e.is_transient() {
                        return Err(e);
                    }

                    // The scheduler has no record of a container we launched; nothing is going
                    // to resolve this for us.
                    let reason = match e {
                        scheduler::SchedulerError::NoSuchContainer(_) => {
                            task_executions::StatusReason {
                                reason: task_executions::StatusReasonType::Orphaned,
                                description: "The scheduler has no record of the task execution's container".into(),
                            }
                        }
                        _ => task_executions::StatusReason {
                            reason: task_executions::StatusReasonType::SchedulerError,
                            description: format!(
                                "Could not query the scheduler for the task execution state; {e}"
                            ),
                        },
                    };

                    self.set_task_execution_complete(
                        task_id,
                        None,
                        task_executions::Status::Unknown,
                        Some(reason),
                    )
                    .await;
                    return Ok(());
                }
            };

            match response.state {
                scheduler::ContainerState::Unknown => {
                    self.set_task_execution_complete(
                        task_id,
                        response.exit_code,
                        task_executions::Status::Unknown,
                        Some(task_executions::StatusReason {
                            reason: task_executions::StatusReasonType::SchedulerError,
                            description: "An unknown error has occurred on the scheduler level; \
                                This should (ideally) never happen."
                                .into(),
                        }),
                    )
                    .await;
                    return Ok(());
                }
                scheduler::ContainerState::Running
                | scheduler::ContainerState::Paused
                | scheduler::ContainerState::Restarting => {
                    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
                    continue;
                }
                scheduler::ContainerState::Exited => {
                    if self.stop_run.load(atomic::Ordering::SeqCst) {
                        self.set_task_execution_complete(
                            task_id,
                            response.exit_code,
                            task_executions::Status::Cancelled,
                            Some(task_executions::StatusReason {
                                reason: task_executions::StatusReasonType::Cancelled,
                                description: "The task execution was cancelled".into(),
                            }),
                        )
                        .await;
                        return Ok(());
                    }

                    match response.exit_code {
                        Some(0) => {
                            self.set_task_execution_complete(
                                task_id,
                                Some(0),
                                task_executions::Status::Successful,
                                None,
                            )
                            .await;
                        }
                        Some(exit_code) => {
                            self.set_task_execution_complete(
                                task_id,
                                Some(exit_code),
                                task_executions::Status::Failed,
                                Some(task_executions::StatusReason {
                                    reason: task_executions::StatusReasonType::AbnormalExit,
                                    description:
                                        "Task execution exited with an abnormal exit code.".into(),
                                }),
                            )
                            .await;
                        }
                        None => {
                            self.set_task_execution_complete(
                                task_id,
                                None,
                                task_executions::Status::Unknown,
                                Some(task_executions::StatusReason {
                                    reason: task_executions::StatusReasonType::AbnormalExit,
                                    description: "Task execution exited without an exit code."
                                        .into(),
                                }),
                            )
                            .await;
                        }
                    }

                    return Ok(());
                }
            }
        }
    }

    /// Tails the scheduler's log stream for the container and appends it to the task execution's
    /// log file. A sentinel end-of-log line is written once the stream closes so that readers can
    /// reliably detect the end of a finalized log.
    pub async fn handle_log_updates(self: Arc<Self>, container_id: String, task_id: String) {
        let log_stream = self.engine.scheduler.get_logs(scheduler::GetLogsRequest {
            id: container_id.clone(),
        });

        let path = task_executions::task_execution_log_path(
            &self.engine.config.api.task_execution_logs_dir,
            &self.pipeline.metadata.namespace_id,
            &self.pipeline.metadata.pipeline_id,
            self.run.run_id,
            &task_id,
        );

        let file = match tokio::fs::File::create(path.clone()).await {
            Ok(file) => Arc::new(Mutex::new(file)),
            Err(e) => {
                error!(error = %e, path = %path.to_string_lossy(), task_id = task_id,
                    "Failed to open file for writing while attempting to write logs for container");
                return;
            }
        };

        log_stream
            .for_each(|item| {
                let file = Arc::clone(&file);
                let path = path.clone();
                let task_id = task_id.clone();

                async move {
                    let log_object = match item {
                        Ok(log_object) => log_object,
                        Err(e) => {
                            debug!(error = %e, task_id = task_id, "Log stream from scheduler ended with error");
                            return;
                        }
                    };

                    let mut file = file.lock().await;

                    match log_object {
                        scheduler::Log::Unknown => {
                            error!(task_id = task_id,
                                "Received malformed log from scheduler (Unknown Log type); skipping");
                        }
                        scheduler::Log::Stdout(log) | scheduler::Log::Stderr(log) => {
                            if let Err(e) = file.write_all(&log).await {
                                error!(error = %e, path = %path.to_string_lossy(), task_id = task_id,
                                    "Failed to write log line for container");
                            }
                        }
                    };
                }
            })
            .await;

        // When the stream is finished we place a special marker to signify that this file is
        // finished with. This allows other readers of the file to know the difference between a
        // file that is still being written to and a file that will not be written to any further.
        let mut file = file.lock().await;

        if let Err(e) = file.write_all(format!("\n{GOFER_EOF}").as_bytes()).await {
            error!(error = %e, path = %path.to_string_lossy(), task_id = task_id,
                "Failed to write end of file sentinel to container log");
        }
    }

    /// Attaches the log tailer and the exit watcher for an already running container. Used both
    /// for freshly started task executions and by recovery when it reattaches to containers that
    /// survived a restart. Blocks until the task execution reaches a terminal state.
    pub async fn monitor_task_execution(self: Arc<Self>, container_id: String, task_id: String) {
        tokio::spawn(
            self.clone()
                .handle_log_updates(container_id.clone(), task_id.clone()),
        );

        if let Err(e) = self
            .wait_task_execution_finish(&container_id, &task_id)
            .await
        {
            // Transient failures out of the recovery path have no retry budget attached; record
            // the execution as unresolvable.
            self.set_task_execution_complete(
                &task_id,
                None,
                task_executions::Status::Unknown,
                Some(task_executions::StatusReason {
                    reason: task_executions::StatusReasonType::SchedulerError,
                    description: format!(
                        "Could not query the scheduler for the task execution state; {e}"
                    ),
                }),
            )
            .await;
        }
    }

    async fn bump_attempt(&self, task_id: &str, attempt: u64) {
        self.task_executions.alter(task_id, |_, mut value| {
            value.attempt = attempt;
            value
        });

        let mut conn = match self.engine.storage.write_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, task_id = task_id, "Could not establish connection to database while recording retry attempt");
                return;
            }
        };

        if let Err(e) = storage::task_executions::update(
            &mut conn,
            &self.pipeline.metadata.namespace_id,
            &self.pipeline.metadata.pipeline_id,
            self.run.run_id as i64,
            task_id,
            storage::task_executions::UpdatableFields {
                attempt: Some(attempt as i64),
                ..Default::default()
            },
        )
        .await
        {
            error!(error = %e, task_id = task_id, "Could not record retry attempt in storage");
        }
    }

    /// Launches a brand new task execution as part of a larger run for a specific task.
    /// It blocks until the task execution has completed.
    ///
    /// The revive parameter controls whether the task execution is registered as brand new (saved
    /// to the database and announced via events) or treated as the continuation of a previously
    /// interrupted execution, in which case the existing row is reused and dependency re-checks
    /// run against the already known parents.
    pub async fn launch_task_execution(self: Arc<Self>, task: tasks::Task, revive: bool) {
        // Start by creating a new task execution and saving it to the state machine and disk.
        let new_task_execution = task_executions::TaskExecution::new(
            &self.pipeline.metadata.namespace_id,
            &self.pipeline.metadata.pipeline_id,
            self.run.run_id,
            task.clone(),
        );

        self.task_executions.insert(
            new_task_execution.task_id.clone(),
            new_task_execution.clone(),
        );

        let namespace_id = self.pipeline.metadata.namespace_id.clone();
        let pipeline_id = self.pipeline.metadata.pipeline_id.clone();
        let run_id = self.run.run_id;

        let storage_task_execution: storage::task_executions::TaskExecution =
            match new_task_execution.clone().try_into() {
                Ok(execution) => execution,
                Err(e) => {
                    error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                        "Could not serialize task execution to storage object");
                    return;
                }
            };

        {
            let mut conn = match self.engine.storage.write_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                        "Could not establish connection to database");
                    return;
                }
            };

            if let Err(e) =
                storage::task_executions::insert(&mut conn, &storage_task_execution).await
            {
                match e {
                    // If the task execution already exists we're reviving it after a restart.
                    storage::StorageError::Exists if revive => {}
                    _ => {
                        error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                            "Could not insert new task execution into storage");
                        return;
                    }
                }
            }

            // Determine the task execution's final variable set and persist it.
            let env_vars = combine_variables(&self.run, &task);

            let env_vars_json = match serde_json::to_string(&env_vars) {
                Ok(env_vars_json) => env_vars_json,
                Err(e) => {
                    error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                        "Could not serialize env vars into json");
                    return;
                }
            };

            if let Err(e) = storage::task_executions::update(
                &mut conn,
                &namespace_id,
                &pipeline_id,
                run_id as i64,
                &task.id,
                storage::task_executions::UpdatableFields {
                    variables: Some(env_vars_json),
                    ..Default::default()
                },
            )
            .await
            {
                error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                    "Could not update task execution with correct variables");
                return;
            };
        }

        if !revive {
            self.engine
                .event_bus
                .publish(event_utils::Kind::CreatedTaskExecution {
                    namespace_id: namespace_id.clone(),
                    pipeline_id: pipeline_id.clone(),
                    run_id,
                    task_execution_id: task.id.clone(),
                })
                .await;
        }

        let env_vars = combine_variables(&self.run, &task);

        // Now we examine the validity of the task execution to be started and wait for its
        // parents to finish running. If parents are already recorded (the revive path) the wait
        // resolves immediately.
        while !self.parent_tasks_complete(&task.depends_on) {
            if self.stop_run.load(atomic::Ordering::SeqCst) {
                self.set_task_execution_complete(
                    &task.id,
                    None,
                    task_executions::Status::Cancelled,
                    Some(task_executions::StatusReason {
                        reason: task_executions::StatusReasonType::Cancelled,
                        description: "The run was cancelled before the task execution could start"
                            .into(),
                    }),
                )
                .await;
                return;
            }

            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        }

        // Then check to make sure that the parents all finished in the required states. If not
        // we mark this task as skipped since its requirements for running weren't met.
        if let Err(e) = self.task_dependencies_satisfied(&task.depends_on) {
            self.set_task_execution_complete(
                &task.id,
                None,
                task_executions::Status::Skipped,
                Some(task_executions::StatusReason {
                    reason: task_executions::StatusReasonType::FailedPrecondition,
                    description: format!("Task could not be run due to unmet dependencies; {e}"),
                }),
            )
            .await;

            return;
        };

        // After this point we're sure the task is in a state to be run. So we attempt to resolve
        // secret and object store references into real values.
        //
        // At first glance this may seem like a step that can move upwards, but it's important this
        // runs only after a task's parents have already finished; it's what enables one task to
        // pass objects to other downstream tasks.
        let env_vars = match interpolate_vars(
            &self.engine,
            &namespace_id,
            &pipeline_id,
            Some(run_id),
            &env_vars,
        )
        .await
        {
            Ok(env_vars) => env_vars,
            Err(e) => {
                self.set_task_execution_complete(
                    &task.id,
                    None,
                    task_executions::Status::Failed,
                    Some(task_executions::StatusReason {
                        reason: task_executions::StatusReasonType::FailedPrecondition,
                        description: format!(
                            "Task could not be run due to inability to retrieve interpolated variables; {e}"
                        ),
                    }),
                )
                .await;
                return;
            }
        };

        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|variable| (variable.key, variable.value))
            .collect();

        // Enforce the run's task parallelism; the permit is held for as long as the container is
        // with the scheduler.
        let _permit = match &self.parallelism_slots {
            Some(slots) => match slots.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => None,
            },
            None => None,
        };

        if self.stop_run.load(atomic::Ordering::SeqCst) {
            self.set_task_execution_complete(
                &task.id,
                None,
                task_executions::Status::Cancelled,
                Some(task_executions::StatusReason {
                    reason: task_executions::StatusReasonType::Cancelled,
                    description: "The run was cancelled before the task execution could start"
                        .into(),
                }),
            )
            .await;
            return;
        }

        let container_id = task_executions::task_execution_container_id(
            &namespace_id,
            &pipeline_id,
            run_id,
            &task.id,
        );

        let mut attempt = new_task_execution.attempt;

        // Transient scheduler failures are retried with the same task identity until the task's
        // retry budget runs out; each attempt increments the attempt counter.
        loop {
            self.set_task_execution_state(&task.id, task_executions::State::Waiting)
                .await;

            let start_response = match self
                .engine
                .scheduler
                .start_container(scheduler::StartContainerRequest {
                    id: container_id.clone(),
                    image: task.image.clone(),
                    variables: env_vars.clone(),
                    registry_auth: task.registry_auth.clone().map(|auth| auth.into()),
                    always_pull: false,
                    networking: None,
                    entrypoint: task.entrypoint.clone(),
                    command: task.command.clone(),
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    if e.is_transient() && attempt <= task.retries {
                        debug!(namespace_id, pipeline_id, run_id, task_id = task.id,
                            attempt = attempt, error = %e, "Retrying task execution after transient scheduler error");
                        attempt += 1;
                        self.bump_attempt(&task.id, attempt).await;
                        continue;
                    }

                    self.set_task_execution_complete(
                        &task.id,
                        None,
                        task_executions::Status::Failed,
                        Some(task_executions::StatusReason {
                            reason: task_executions::StatusReasonType::SchedulerError,
                            description: format!(
                                "Task could not be run due to inability to be scheduled; {e}"
                            ),
                        }),
                    )
                    .await;
                    return;
                }
            };

            let scheduler_id = start_response.scheduler_id;

            self.task_executions.alter(&task.id, |_, mut value| {
                value.state = task_executions::State::Running;
                value.scheduler_id = scheduler_id.clone();
                value.started = epoch_milli();
                value
            });

            {
                let mut conn = match self.engine.storage.write_conn().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                            "Could not establish connection to database");
                        return;
                    }
                };

                if let Err(e) = storage::task_executions::update(
                    &mut conn,
                    &namespace_id,
                    &pipeline_id,
                    run_id as i64,
                    &task.id,
                    storage::task_executions::UpdatableFields {
                        state: Some(task_executions::State::Running.to_string()),
                        started: Some(epoch_milli().to_string()),
                        scheduler_id: scheduler_id.clone(),
                        ..Default::default()
                    },
                )
                .await
                {
                    error!(namespace_id, pipeline_id, run_id, task_id = task.id, error = %e,
                        "Could not update task execution while attempting to launch task");
                    return;
                }
            }

            self.engine
                .event_bus
                .publish(event_utils::Kind::StartedTaskExecution {
                    namespace_id: namespace_id.clone(),
                    pipeline_id: pipeline_id.clone(),
                    run_id,
                    task_execution_id: task.id.clone(),
                })
                .await;

            tokio::spawn(
                self.clone()
                    .handle_log_updates(container_id.clone(), task.id.clone()),
            );

            // Block until the task execution is finished.
            match self
                .wait_task_execution_finish(&container_id, &task.id)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    if attempt <= task.retries {
                        debug!(namespace_id, pipeline_id, run_id, task_id = task.id,
                            attempt = attempt, error = %e, "Retrying task execution after transient scheduler error");
                        attempt += 1;
                        self.bump_attempt(&task.id, attempt).await;
                        continue;
                    }

                    self.set_task_execution_complete(
                        &task.id,
                        None,
                        task_executions::Status::Unknown,
                        Some(task_executions::StatusReason {
                            reason: task_executions::StatusReasonType::SchedulerError,
                            description: format!(
                                "Could not query the scheduler for the task execution state; {e}"
                            ),
                        }),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// Removes run level objects from the object store once a run is past its expiry threshold.
    async fn handle_run_object_expiry(self: Arc<Self>) {
        let limit = self.engine.config.object_store.run_object_expiry;

        let namespace_id = self.pipeline.metadata.namespace_id.clone();
        let pipeline_id = self.pipeline.metadata.pipeline_id.clone();

        let runs = {
            let mut conn = match self.engine.storage.read_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Could not establish connection to database while processing run object expiry");
                    return;
                }
            };

            match storage::runs::list(&mut conn, &namespace_id, &pipeline_id, 0, limit as i64 + 1)
                .await
            {
                Ok(runs) => runs,
                Err(e) => {
                    error!(error = %e, "Could not retrieve runs while processing run object expiry");
                    return;
                }
            }
        };

        // If there aren't enough runs to reach the limit there is nothing to remove.
        if limit > runs.len() as u64 || runs.is_empty() {
            return;
        }

        let expired_run = runs.last().unwrap().to_owned();
        let expired_run_id = expired_run.run_id;

        // If the expired run is still in progress we wait for it to be done.
        loop {
            let state = {
                let mut conn = match self.engine.storage.read_conn().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Could not establish connection to database while processing run object expiry");
                        return;
                    }
                };

                match storage::runs::get(&mut conn, &namespace_id, &pipeline_id, expired_run_id)
                    .await
                {
                    Ok(run) => run.state,
                    Err(e) => {
                        error!(error = %e, "Could not get run while processing run object expiry");
                        return;
                    }
                }
            };

            if state == runs::State::Complete.to_string() {
                break;
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        }

        if expired_run.store_objects_expired {
            return;
        }

        let mut conn = match self.engine.storage.write_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Could not establish connection to database while processing run object expiry");
                return;
            }
        };

        let object_keys = match storage::object_store_run_keys::list(
            &mut conn,
            &namespace_id,
            &pipeline_id,
            expired_run_id,
        )
        .await
        {
            Ok(object_keys) => object_keys,
            Err(e) => {
                error!(error = %e, "Could not list run object keys while processing run object expiry");
                return;
            }
        };

        let mut removed_objects = vec![];

        for object_key in object_keys {
            if let Err(e) = self
                .engine
                .object_store
                .delete(&objects::run_object_store_key(
                    &namespace_id,
                    &pipeline_id,
                    expired_run_id as u64,
                    &object_key.key,
                ))
                .await
            {
                error!(error = %e, key = object_key.key, "Could not delete object while processing run object expiry");
                continue;
            };

            if let Err(e) = storage::object_store_run_keys::delete(
                &mut conn,
                &namespace_id,
                &pipeline_id,
                expired_run_id,
                &object_key.key,
            )
            .await
            {
                error!(error = %e, key = object_key.key, "Could not remove object reference while processing run object expiry");
                continue;
            };

            removed_objects.push(object_key.key);
        }

        if let Err(e) = storage::runs::update(
            &mut conn,
            &namespace_id,
            &pipeline_id,
            expired_run_id,
            storage::runs::UpdatableFields {
                store_objects_expired: Some(true),
                ..Default::default()
            },
        )
        .await
        {
            error!(error = %e, "Could not update run while processing run object expiry");
            return;
        }

        debug!(
            run_object_expiry = limit,
            run_id = expired_run_id,
            removed_objects = ?removed_objects,
            "Removed objects for expired run"
        );
    }

    /// Removes task execution log files once a run is past the log retention threshold.
    async fn handle_run_log_expiry(self: Arc<Self>) {
        let limit = self.engine.config.api.task_execution_log_retention;

        let namespace_id = self.pipeline.metadata.namespace_id.clone();
        let pipeline_id = self.pipeline.metadata.pipeline_id.clone();

        let runs = {
            let mut conn = match self.engine.storage.read_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Could not establish connection to database while processing run log expiry");
                    return;
                }
            };

            match storage::runs::list(&mut conn, &namespace_id, &pipeline_id, 0, limit as i64 + 1)
                .await
            {
                Ok(runs) => runs,
                Err(e) => {
                    error!(error = %e, "Could not retrieve runs while processing run log expiry");
                    return;
                }
            }
        };

        // If there aren't enough runs to reach the limit there is nothing to remove.
        if limit > runs.len() as u64 || runs.is_empty() {
            return;
        }

        let expired_run_id = runs.last().unwrap().run_id;

        // Wait for the expired run and all of its task executions to be finished.
        let task_executions_raw = loop {
            let mut conn = match self.engine.storage.read_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Could not establish connection to database while processing run log expiry");
                    return;
                }
            };

            let task_executions_raw = match storage::task_executions::list(
                &mut conn,
                &namespace_id,
                &pipeline_id,
                expired_run_id,
            )
            .await
            {
                Ok(executions) => executions,
                Err(e) => {
                    error!(error = %e, "Could not get task executions while processing run log expiry");
                    return;
                }
            };

            drop(conn);

            let all_complete = task_executions_raw.iter().all(|execution| {
                task_executions::State::from_str(&execution.state)
                    .map(|state| state == task_executions::State::Complete)
                    .unwrap_or(false)
            });

            if all_complete {
                break task_executions_raw;
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        };

        let mut removed_files = vec![];

        for execution in task_executions_raw {
            if execution.logs_expired || execution.logs_removed {
                continue;
            }

            let log_path = task_executions::task_execution_log_path(
                &self.engine.config.api.task_execution_logs_dir,
                &namespace_id,
                &pipeline_id,
                expired_run_id as u64,
                &execution.task_id,
            );

            if let Err(e) = tokio::fs::remove_file(log_path.clone()).await {
                debug!(error = %e, path = ?log_path, "Could not remove task execution log file");
            }

            removed_files.push(log_path.to_string_lossy().to_string());

            let mut conn = match self.engine.storage.write_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Could not establish connection to database while processing run log expiry");
                    return;
                }
            };

            if let Err(e) = storage::task_executions::update(
                &mut conn,
                &namespace_id,
                &pipeline_id,
                expired_run_id,
                &execution.task_id,
                storage::task_executions::UpdatableFields {
                    logs_expired: Some(true),
                    logs_removed: Some(true),
                    ..Default::default()
                },
            )
            .await
            {
                error!(error = %e, task_id = execution.task_id, "Could not update task execution while processing run log expiry");
                continue;
            };
        }

        debug!(
            log_retention = limit,
            run_id = expired_run_id,
            removed_files = ?removed_files,
            "Removed log files for expired run"
        );
    }
}

/// Publishes a cancellation announcement for the given run. The run's shepherd picks the
/// announcement up off of the event bus, delivers stops through the scheduler, and finalizes the
/// run as cancelled once every container has wound down.
///
/// With force the grace period is skipped and containers are killed immediately.
pub async fn cancel_run(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    force: bool,
) -> Result<(), EngineError> {
    let run = {
        let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

        storage::runs::get(&mut conn, namespace_id, pipeline_id, run_id as i64)
            .await
            .map_err(|e| match e {
                storage::StorageError::NotFound => {
                    EngineError::NotFound(format!("run '{run_id}' does not exist"))
                }
                _ => e.into(),
            })?
    };

    if run.state == runs::State::Complete.to_string() {
        return Err(EngineError::FailedPrecondition(
            "run has already reached a terminal state".into(),
        ));
    }

    let timeout = if force {
        0
    } else {
        engine.config.api.task_execution_stop_timeout
    };

    engine
        .event_bus
        .publish(event_utils::Kind::StartedRunCancellation {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            run_id,
            timeout,
        })
        .await;

    Ok(())
}

/// We need to combine the environment variables we get from multiple sources in order to pass
/// them finally to the task execution. The order in which they are combined is very important as
/// they can and should overwrite each other.
///
/// The order in which the env vars are stacked, least important first:
/// 1) Gofer system specific env vars as these are the most replaceable on the totem pole.
/// 2) Task specific env vars defined by the user in the pipeline config.
/// 3) Env vars provided by a subscribed extension at trigger time.
/// 4) Run specific env vars, usually provided by the user when they start a run manually. Since
///    these are the most likely to be edited adhoc they are treated as the most important.
pub fn combine_variables(run: &runs::Run, task: &tasks::Task) -> Vec<Variable> {
    let system_injected_vars = system_injected_vars(run, task);

    let task_vars: HashMap<String, Variable> = task
        .variables
        .iter()
        .map(|variable| (variable.key.clone(), variable.clone()))
        .collect();

    let extension_vars: HashMap<String, Variable> = run
        .variables
        .iter()
        .filter(|variable| variable.source == VariableSource::Extension)
        .map(|variable| (variable.key.clone(), variable.clone()))
        .collect();

    let run_vars: HashMap<String, Variable> = run
        .variables
        .iter()
        .filter(|variable| variable.source != VariableSource::Extension)
        .map(|variable| (variable.key.clone(), variable.clone()))
        .collect();

    let mut task_execution_vars = system_injected_vars;
    task_execution_vars.extend(task_vars);
    task_execution_vars.extend(extension_vars);
    task_execution_vars.extend(run_vars);

    // It is possible for the user to enter an empty key, but that would be an error when
    // attempting to pass it to the docker container.
    task_execution_vars
        .into_iter()
        .filter_map(|(key, value)| if key.is_empty() { None } else { Some(value) })
        .collect()
}

/// On every run Gofer injects some vars that are determined by the system.
/// These are usually meant to give the user some basic information that they can pull
/// into their program about the details of the run.
fn system_injected_vars(run: &runs::Run, task: &tasks::Task) -> HashMap<String, Variable> {
    HashMap::from([
        (
            "GOFER_PIPELINE_ID".to_string(),
            Variable {
                key: "GOFER_PIPELINE_ID".to_string(),
                value: run.pipeline_id.clone(),
                source: VariableSource::System,
            },
        ),
        (
            "GOFER_RUN_ID".to_string(),
            Variable {
                key: "GOFER_RUN_ID".to_string(),
                value: run.run_id.to_string(),
                source: VariableSource::System,
            },
        ),
        (
            "GOFER_TASK_ID".to_string(),
            Variable {
                key: "GOFER_TASK_ID".to_string(),
                value: task.id.clone(),
                source: VariableSource::System,
            },
        ),
        (
            "GOFER_TASK_IMAGE".to_string(),
            Variable {
                key: "GOFER_TASK_IMAGE".to_string(),
                value: task.image.clone(),
                source: VariableSource::System,
            },
        ),
    ])
}
