use crate::engine::{
    epoch_milli, event_utils, is_valid_identifier, pipelines, tasks, Engine, EngineError,
};
use crate::storage;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum ConfigState {
    #[default]
    Unknown,

    /// Has never been run.
    Unreleased,

    /// Currently deployed; new runs use this version.
    Live,

    /// Has been replaced by a newer config version.
    Deprecated,
}

/// An immutable, versioned definition of a pipeline: the tasks it runs, its run-level task
/// parallelism, and which extensions it subscribes to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub namespace_id: String,
    pub pipeline_id: String,

    /// Monotonically increasing version number; assigned at registration.
    pub version: u64,

    /// How many tasks within a single run may be in the 'running' state at once. 0 is unlimited.
    pub parallelism: u64,

    pub state: ConfigState,

    /// Time of registration in epoch milliseconds.
    pub registered: u64,

    /// Time this config stopped being the live version, in epoch milliseconds.
    pub deprecated: Option<u64>,

    pub tasks: HashMap<String, tasks::Task>,
}

impl Config {
    pub fn from_storage(
        value: storage::pipeline_configs::PipelineConfig,
        tasks_raw: Vec<storage::tasks::Task>,
    ) -> Result<Self> {
        let state = ConfigState::from_str(&value.state).with_context(|| {
            format!(
                "Could not parse field 'state' from storage value '{}'",
                value.state
            )
        })?;

        let registered = value.registered.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'registered' from storage value '{}'",
                value.registered
            )
        })?;

        let deprecated = if value.deprecated.is_empty() {
            None
        } else {
            Some(value.deprecated.parse::<u64>().with_context(|| {
                format!(
                    "Could not parse field 'deprecated' from storage value '{}'",
                    value.deprecated
                )
            })?)
        };

        let mut tasks = HashMap::new();
        for task_raw in tasks_raw {
            let task: tasks::Task = task_raw.try_into()?;
            tasks.insert(task.id.clone(), task);
        }

        Ok(Config {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            version: value.version as u64,
            parallelism: value.parallelism as u64,
            state,
            registered,
            deprecated,
            tasks,
        })
    }
}

/// What a user hands us to register a new config version for a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterConfigRequest {
    pub parallelism: u64,
    pub tasks: Vec<tasks::Task>,
}

/// Every task's dependency must point at a task that actually exists within the same config, and
/// the dependency graph must not contain cycles. We check both up front so a bad graph can never
/// make it into storage.
pub fn validate_task_graph(task_list: &[tasks::Task]) -> Result<()> {
    let task_ids: HashSet<&str> = task_list.iter().map(|task| task.id.as_str()).collect();

    if task_ids.len() != task_list.len() {
        bail!("task ids must be unique within a single pipeline config");
    }

    for task in task_list {
        for parent in task.depends_on.keys() {
            if !task_ids.contains(parent.as_str()) {
                bail!(
                    "task '{}' depends on task '{}' which does not exist in this config",
                    task.id,
                    parent
                );
            }

            if parent == &task.id {
                bail!("task '{}' cannot depend on itself", task.id);
            }
        }
    }

    // Iterative depth-first search for back edges.
    let edges: HashMap<&str, Vec<&str>> = task_list
        .iter()
        .map(|task| {
            (
                task.id.as_str(),
                task.depends_on.keys().map(|k| k.as_str()).collect(),
            )
        })
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();

    for start in task_ids.iter().copied() {
        if visited.contains(start) {
            continue;
        }

        let mut in_path: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

        while let Some((node, next_child)) = stack.pop() {
            if next_child == 0 {
                in_path.insert(node);
            }

            let children = edges.get(node).cloned().unwrap_or_default();

            if next_child < children.len() {
                stack.push((node, next_child + 1));

                let child = children[next_child];
                if in_path.contains(child) {
                    bail!(
                        "task dependency cycle detected involving tasks '{}' and '{}'",
                        node,
                        child
                    );
                }

                if !visited.contains(child) {
                    stack.push((child, 0));
                }
            } else {
                in_path.remove(node);
                visited.insert(node);
            }
        }
    }

    Ok(())
}

/// Registers a new config version for a pipeline. Creates the pipeline metadata on first
/// registration. The new version immediately becomes the live version and the previously live
/// version (if any) is deprecated; all of that happens in a single transaction.
pub async fn register_config(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    request: RegisterConfigRequest,
) -> Result<Config, EngineError> {
    is_valid_identifier(pipeline_id)
        .map_err(|e| EngineError::FailedPrecondition(e.to_string()))?;

    for task in &request.tasks {
        is_valid_identifier(&task.id).map_err(|e| {
            EngineError::FailedPrecondition(format!("task id '{}' is invalid; {}", task.id, e))
        })?;
    }

    validate_task_graph(&request.tasks)
        .map_err(|e| EngineError::FailedPrecondition(e.to_string()))?;

    let mut tx = engine.storage.open_tx().await.map_err(EngineError::from)?;

    let mut newly_registered_pipeline = false;

    if let Err(e) = storage::pipeline_metadata::get(&mut tx, namespace_id, pipeline_id).await {
        match e {
            storage::StorageError::NotFound => {
                let metadata = pipelines::Metadata::new(namespace_id, pipeline_id);
                storage::pipeline_metadata::insert(&mut tx, &metadata.into()).await?;
                newly_registered_pipeline = true;
            }
            _ => return Err(e.into()),
        }
    }

    let latest_version =
        match storage::pipeline_configs::get_latest(&mut tx, namespace_id, pipeline_id).await {
            Ok(config) => config.version,
            Err(storage::StorageError::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };

    let new_version = latest_version + 1;

    // Deprecate the previously live version; there can only ever be one live config.
    match storage::pipeline_configs::get_live(&mut tx, namespace_id, pipeline_id).await {
        Ok(live_config) => {
            storage::pipeline_configs::update(
                &mut tx,
                namespace_id,
                pipeline_id,
                live_config.version,
                storage::pipeline_configs::UpdatableFields {
                    state: Some(ConfigState::Deprecated.to_string()),
                    deprecated: Some(epoch_milli().to_string()),
                },
            )
            .await?;
        }
        Err(storage::StorageError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let new_config = Config {
        namespace_id: namespace_id.into(),
        pipeline_id: pipeline_id.into(),
        version: new_version as u64,
        parallelism: request.parallelism,
        state: ConfigState::Live,
        registered: epoch_milli(),
        deprecated: None,
        tasks: request
            .tasks
            .iter()
            .map(|task| (task.id.clone(), task.clone()))
            .collect(),
    };

    storage::pipeline_configs::insert(
        &mut tx,
        &storage::pipeline_configs::PipelineConfig {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            version: new_version,
            parallelism: new_config.parallelism as i64,
            state: new_config.state.to_string(),
            registered: new_config.registered.to_string(),
            deprecated: String::new(),
        },
    )
    .await?;

    for task in &request.tasks {
        let task_storage = task
            .to_storage(namespace_id, pipeline_id, new_version)
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        storage::tasks::insert(&mut tx, &task_storage).await?;
    }

    tx.commit()
        .await
        .map_err(|e| EngineError::Storage(storage::StorageError::Connection(e.to_string())))?;

    if newly_registered_pipeline {
        engine
            .event_bus
            .publish(event_utils::Kind::CreatedPipeline {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            })
            .await;
    }

    engine
        .event_bus
        .publish(event_utils::Kind::RegisteredPipelineConfig {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            version: new_version as u64,
        })
        .await;

    Ok(new_config)
}

/// Deleting the live config or the latest config version is forbidden; both guard the pipeline
/// from being left in a state where it cannot run.
pub async fn delete_config(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    version: u64,
) -> Result<(), EngineError> {
    let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

    let config = storage::pipeline_configs::get(&mut conn, namespace_id, pipeline_id, version as i64)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => EngineError::NotFound(format!(
                "config version '{version}' for pipeline '{pipeline_id}' does not exist"
            )),
            _ => e.into(),
        })?;

    if config.state == ConfigState::Live.to_string() {
        return Err(EngineError::FailedPrecondition(
            "cannot delete the live config version".into(),
        ));
    }

    let latest = storage::pipeline_configs::get_latest(&mut conn, namespace_id, pipeline_id)
        .await
        .map_err(EngineError::from)?;

    if latest.version == version as i64 {
        return Err(EngineError::FailedPrecondition(
            "cannot delete the latest config version".into(),
        ));
    }

    storage::pipeline_configs::delete(&mut conn, namespace_id, pipeline_id, version as i64)
        .await
        .map_err(EngineError::from)?;

    drop(conn);

    engine
        .event_bus
        .publish(event_utils::Kind::DeletedPipelineConfig {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            version,
        })
        .await;

    Ok(())
}
