use crate::engine::Variable;
use crate::{scheduler, storage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RequiredParentStatus {
    #[default]
    Unknown,

    /// Any terminal status of the parent satisfies the dependency.
    Any,

    /// The parent must have finished successfully.
    Success,

    /// The parent must have finished with a failure.
    Failure,
}

/// Authentication credentials for a task's container registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

impl From<RegistryAuth> for scheduler::RegistryAuth {
    fn from(value: RegistryAuth) -> Self {
        Self {
            user: value.user,
            pass: value.pass,
        }
    }
}

/// A task is the smallest unit of execution for a pipeline. It describes a container to run,
/// which tasks must run before it, and how many times Gofer should retry it on transient failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub description: Option<String>,
    pub image: String,
    pub registry_auth: Option<RegistryAuth>,
    pub depends_on: HashMap<String, RequiredParentStatus>,
    pub variables: Vec<Variable>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,

    /// Whether to give the task an API token scoped to this run. Token minting belongs to the
    /// API layer; the engine only carries the flag through.
    pub inject_api_token: bool,

    /// How many times the task is restarted after a transient scheduler failure before it is
    /// marked failed for good.
    pub retries: u64,
}

impl Task {
    pub fn to_storage(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        version: i64,
    ) -> Result<storage::tasks::Task> {
        Ok(storage::tasks::Task {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            pipeline_config_version: version,
            task_id: self.id.clone(),
            description: self.description.clone().unwrap_or_default(),
            image: self.image.clone(),
            registry_auth: match &self.registry_auth {
                Some(auth) => serde_json::to_string(auth)
                    .context("Could not serialize field 'registry_auth' to storage value")?,
                None => String::new(),
            },
            depends_on: serde_json::to_string(&self.depends_on)
                .context("Could not serialize field 'depends_on' to storage value")?,
            variables: serde_json::to_string(&self.variables)
                .context("Could not serialize field 'variables' to storage value")?,
            entrypoint: match &self.entrypoint {
                Some(entrypoint) => serde_json::to_string(entrypoint)
                    .context("Could not serialize field 'entrypoint' to storage value")?,
                None => String::new(),
            },
            command: match &self.command {
                Some(command) => serde_json::to_string(command)
                    .context("Could not serialize field 'command' to storage value")?,
                None => String::new(),
            },
            inject_api_token: self.inject_api_token,
            retries: self.retries as i64,
        })
    }
}

impl TryFrom<storage::tasks::Task> for Task {
    type Error = anyhow::Error;

    fn try_from(value: storage::tasks::Task) -> Result<Self> {
        let registry_auth = if value.registry_auth.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&value.registry_auth).with_context(|| {
                format!(
                    "Could not parse field 'registry_auth' from storage value '{}'",
                    value.registry_auth
                )
            })?)
        };

        let depends_on = serde_json::from_str(&value.depends_on).with_context(|| {
            format!(
                "Could not parse field 'depends_on' from storage value '{}'",
                value.depends_on
            )
        })?;

        let variables = serde_json::from_str(&value.variables).with_context(|| {
            format!(
                "Could not parse field 'variables' from storage value '{}'",
                value.variables
            )
        })?;

        let entrypoint = if value.entrypoint.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&value.entrypoint).with_context(|| {
                format!(
                    "Could not parse field 'entrypoint' from storage value '{}'",
                    value.entrypoint
                )
            })?)
        };

        let command = if value.command.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&value.command).with_context(|| {
                format!(
                    "Could not parse field 'command' from storage value '{}'",
                    value.command
                )
            })?)
        };

        Ok(Task {
            id: value.task_id,
            description: if value.description.is_empty() {
                None
            } else {
                Some(value.description)
            },
            image: value.image,
            registry_auth,
            depends_on,
            variables,
            entrypoint,
            command,
            inject_api_token: value.inject_api_token,
            retries: value.retries as u64,
        })
    }
}
