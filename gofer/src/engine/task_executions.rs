use crate::engine::{epoch_milli, tasks, Variable};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// Pre-scheduling validation and dependency resolution.
    Processing,

    /// Waiting on a parallelism slot or in the act of being sent to the scheduler.
    Waiting,

    /// Currently running as reported by the scheduler.
    Running,

    /// The task execution has reached a terminal state; no transition ever leaves this state.
    Complete,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,

    /// The container exited with a zero exit code.
    Successful,

    /// The container exited abnormally or could not be launched.
    Failed,

    /// The task execution was stopped before or during execution.
    Cancelled,

    /// The task execution was not run because its dependencies were not met.
    Skipped,
}

impl Status {
    /// Terminal statuses are anything that isn't [`Status::Unknown`] while in progress.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Unknown)
    }
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum StatusReasonType {
    #[default]
    Unknown,

    /// The container exited with a non-zero exit code.
    AbnormalExit,

    /// The scheduler could not run or track the container.
    SchedulerError,

    /// A precondition (dependencies, secrets, variables) could not be satisfied.
    FailedPrecondition,

    /// The task execution was cancelled.
    Cancelled,

    /// Recovery could not resolve the state of the task execution.
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    /// The specific type of task execution failure.
    pub reason: StatusReasonType,

    /// A description of why the task execution might have failed and what was going on at the time.
    pub description: String,
}

/// A task execution is a specific execution of a task/container.
/// It represents a 4th level unit in the hierarchy:
/// namespace -> pipeline -> run -> task execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskExecution {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: u64,

    /// Mirrors the id of the task it executes.
    pub task_id: String,

    /// The full task definition at the time this execution was created.
    pub task: tasks::Task,

    /// Time of creation in epoch milliseconds.
    pub created: u64,

    /// Time the container was sent to the scheduler, in epoch milliseconds; 0 until then.
    pub started: u64,

    /// Time of completion in epoch milliseconds; 0 until the execution reaches a terminal state.
    pub ended: u64,

    /// Which launch attempt this is; starts at 1 and increments on every transient-failure retry.
    pub attempt: u64,

    /// The exit code of the container, once it has exited.
    pub exit_code: Option<u8>,

    /// The identifier the scheduler assigned the container. Absent iff the task has never been
    /// sent to the scheduler.
    pub scheduler_id: Option<String>,

    /// Whether the logs have past their retention time.
    pub logs_expired: bool,

    /// If the logs for this execution have been removed. This can be due to user request or
    /// automatic action based on expiry time.
    pub logs_removed: bool,

    pub state: State,
    pub status: Status,
    pub status_reason: Option<StatusReason>,

    /// The environment variables injected during this task execution.
    pub variables: Vec<Variable>,
}

impl TaskExecution {
    pub fn new(namespace_id: &str, pipeline_id: &str, run_id: u64, task: tasks::Task) -> Self {
        TaskExecution {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            run_id,
            task_id: task.id.clone(),
            task,
            created: epoch_milli(),
            started: 0,
            ended: 0,
            attempt: 1,
            exit_code: None,
            scheduler_id: None,
            logs_expired: false,
            logs_removed: false,
            state: State::Processing,
            status: Status::Unknown,
            status_reason: None,
            variables: vec![],
        }
    }
}

impl TryFrom<storage::task_executions::TaskExecution> for TaskExecution {
    type Error = anyhow::Error;

    fn try_from(value: storage::task_executions::TaskExecution) -> Result<Self> {
        let task = serde_json::from_str(&value.task).with_context(|| {
            format!(
                "Could not parse field 'task' from storage value '{}'",
                value.task
            )
        })?;

        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let started = if value.started.is_empty() {
            0
        } else {
            value.started.parse::<u64>().with_context(|| {
                format!(
                    "Could not parse field 'started' from storage value '{}'",
                    value.started
                )
            })?
        };

        let ended = if value.ended.is_empty() {
            0
        } else {
            value.ended.parse::<u64>().with_context(|| {
                format!(
                    "Could not parse field 'ended' from storage value '{}'",
                    value.ended
                )
            })?
        };

        let state = State::from_str(&value.state).with_context(|| {
            format!(
                "Could not parse field 'state' from storage value '{}'",
                value.state
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let status_reason = if value.status_reason.is_empty() {
            None
        } else {
            serde_json::from_str(&value.status_reason).with_context(|| {
                format!(
                    "Could not parse field 'status_reason' from storage value '{}'",
                    value.status_reason
                )
            })?
        };

        let variables = serde_json::from_str(&value.variables).with_context(|| {
            format!(
                "Could not parse field 'variables' from storage value '{}'",
                value.variables
            )
        })?;

        Ok(TaskExecution {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as u64,
            task_id: value.task_id,
            task,
            created,
            started,
            ended,
            attempt: value.attempt as u64,
            exit_code: value.exit_code.map(|code| code as u8),
            scheduler_id: value.scheduler_id,
            logs_expired: value.logs_expired,
            logs_removed: value.logs_removed,
            state,
            status,
            status_reason,
            variables,
        })
    }
}

impl TryFrom<TaskExecution> for storage::task_executions::TaskExecution {
    type Error = anyhow::Error;

    fn try_from(value: TaskExecution) -> Result<Self> {
        let task = serde_json::to_string(&value.task)
            .context("Could not serialize field 'task' to storage value")?;

        let status_reason = match &value.status_reason {
            Some(reason) => serde_json::to_string(reason)
                .context("Could not serialize field 'status_reason' to storage value")?,
            None => String::new(),
        };

        let variables = serde_json::to_string(&value.variables)
            .context("Could not serialize field 'variables' to storage value")?;

        Ok(Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as i64,
            task_id: value.task_id,
            task,
            created: value.created.to_string(),
            started: if value.started == 0 {
                String::new()
            } else {
                value.started.to_string()
            },
            ended: if value.ended == 0 {
                String::new()
            } else {
                value.ended.to_string()
            },
            attempt: value.attempt as i64,
            exit_code: value.exit_code.map(|code| code as i64),
            scheduler_id: value.scheduler_id,
            logs_expired: value.logs_expired,
            logs_removed: value.logs_removed,
            state: value.state.to_string(),
            status: value.status.to_string(),
            status_reason,
            variables,
        })
    }
}

/// The name we use to identify a task execution's container to the scheduler. It needs to be
/// unique among all containers running on the system.
pub fn task_execution_container_id(
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    task_id: &str,
) -> String {
    format!("{namespace_id}_{pipeline_id}_{run_id}_{task_id}")
}

/// Log files are per task execution, named by the full identity of the execution.
pub fn task_execution_log_path(
    dir: &str,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    task_id: &str,
) -> PathBuf {
    PathBuf::from(dir).join(format!(
        "{namespace_id}_{pipeline_id}_{run_id}_{task_id}"
    ))
}
