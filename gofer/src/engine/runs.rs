use crate::engine::{epoch_milli, Variable};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
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

    /// Accepted, but waiting to be launched.
    Pending,

    /// The run is launching task executions.
    Running,

    /// All task executions have reached a terminal state.
    Complete,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    /// Run is in progress or state is otherwise unknowable.
    #[default]
    Unknown,

    /// All task executions in the run completed without failure.
    Successful,

    /// One or more task executions failed.
    Failed,

    /// The run was cancelled while in progress.
    Cancelled,
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

    /// One or more task executions exited abnormally.
    AbnormalExit,

    /// The scheduler returned an error the engine could not recover from.
    SchedulerError,

    /// A precondition for the run (live config, secrets, variables) could not be satisfied.
    FailedPrecondition,

    /// The run was cancelled by a user or by shutdown.
    Cancelled,

    /// Recovery found the run in a state that could not be resolved.
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    /// The specific type of failure.
    pub reason: StatusReasonType,

    /// A description of why the run might have failed and what was going on at the time.
    pub description: String,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum InitiatorType {
    #[default]
    Unknown,

    Human,

    Extension,

    Bot,
}

/// Information about which entity caused a run to be launched and why.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Initiator {
    pub initiator_type: InitiatorType,

    /// The name of the entity. For extensions this is `<extension_id>/<subscription_id>`.
    pub name: String,

    /// A short description of why the run was launched.
    pub reason: String,
}

/// A run is one or more tasks being executed on behalf of some initiator.
/// Run is a third level unit containing task executions and being contained in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub namespace_id: String,
    pub pipeline_id: String,

    /// Monotonically increasing identifier, unique per pipeline. Assigned by storage at insert.
    pub run_id: u64,

    /// Which config version this run was launched against. Runs pin their config at creation and
    /// never re-read it, so deleting config versions cannot affect an in-flight run.
    pub pipeline_config_version: u64,

    /// Time of run start in epoch milliseconds.
    pub started: u64,

    /// Time of run finish in epoch milliseconds; 0 until the run reaches a terminal state.
    pub ended: u64,

    pub state: State,
    pub status: Status,
    pub status_reason: Option<StatusReason>,

    pub initiator: Initiator,

    /// Variables that are passed to every task execution within the run.
    pub variables: Vec<Variable>,

    /// Whether the run-level objects for this run have been evicted yet.
    pub store_objects_expired: bool,

    /// The id of the 'started run' event published for this run; used as the run's marker in the
    /// event log when scanning for unfinished runs.
    pub event_id: Option<u64>,
}

impl Run {
    pub fn new(
        namespace_id: &str,
        pipeline_id: &str,
        pipeline_config_version: u64,
        initiator: Initiator,
        variables: Vec<Variable>,
    ) -> Self {
        Run {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            run_id: 0,
            pipeline_config_version,
            started: epoch_milli(),
            ended: 0,
            state: State::Pending,
            status: Status::Unknown,
            status_reason: None,
            initiator,
            variables,
            store_objects_expired: false,
            event_id: None,
        }
    }
}

impl TryFrom<storage::runs::Run> for Run {
    type Error = anyhow::Error;

    fn try_from(value: storage::runs::Run) -> Result<Self> {
        let started = value.started.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'started' from storage value '{}'",
                value.started
            )
        })?;

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

        let initiator = serde_json::from_str(&value.initiator).with_context(|| {
            format!(
                "Could not parse field 'initiator' from storage value '{}'",
                value.initiator
            )
        })?;

        let variables = serde_json::from_str(&value.variables).with_context(|| {
            format!(
                "Could not parse field 'variables' from storage value '{}'",
                value.variables
            )
        })?;

        Ok(Run {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as u64,
            pipeline_config_version: value.pipeline_config_version as u64,
            started,
            ended,
            state,
            status,
            status_reason,
            initiator,
            variables,
            store_objects_expired: value.store_objects_expired,
            event_id: value.event_id.map(|id| id as u64),
        })
    }
}

impl TryFrom<Run> for storage::runs::Run {
    type Error = anyhow::Error;

    fn try_from(value: Run) -> Result<Self> {
        let status_reason = match &value.status_reason {
            Some(reason) => serde_json::to_string(reason)
                .context("Could not serialize field 'status_reason' to storage value")?,
            None => String::new(),
        };

        let initiator = serde_json::to_string(&value.initiator)
            .context("Could not serialize field 'initiator' to storage value")?;

        let variables = serde_json::to_string(&value.variables)
            .context("Could not serialize field 'variables' to storage value")?;

        Ok(Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as i64,
            pipeline_config_version: value.pipeline_config_version as i64,
            started: value.started.to_string(),
            ended: if value.ended == 0 {
                String::new()
            } else {
                value.ended.to_string()
            },
            state: value.state.to_string(),
            status: value.status.to_string(),
            status_reason,
            initiator,
            variables,
            store_objects_expired: value.store_objects_expired,
            event_id: value.event_id.map(|id| id as i64),
        })
    }
}
