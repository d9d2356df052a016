use crate::engine::{pipeline_configs, Engine, EngineError};
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
pub enum PipelineState {
    #[default]
    Unknown,

    /// Pipeline can be run.
    Active,

    /// Pipeline cannot be run; new runs are rejected.
    Disabled,
}

/// Details about the pipeline itself, not including the configuration that the user can change.
/// All these values are changed by the system or the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// The namespace this pipeline belongs to.
    pub namespace_id: String,

    /// Unique user defined identifier for the pipeline.
    pub pipeline_id: String,

    /// Time in epoch milliseconds when the pipeline was registered.
    pub created: u64,

    /// Time in epoch milliseconds when the pipeline was last modified.
    pub modified: u64,

    /// The current running state of the pipeline. This is used to determine if the pipeline should
    /// continue to process runs or not and properly convey that to the user.
    pub state: PipelineState,
}

impl Metadata {
    pub fn new(namespace_id: &str, pipeline_id: &str) -> Self {
        Metadata {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            created: super::epoch_milli(),
            modified: super::epoch_milli(),
            state: PipelineState::Active,
        }
    }
}

impl TryFrom<storage::pipeline_metadata::PipelineMetadata> for Metadata {
    type Error = anyhow::Error;

    fn try_from(value: storage::pipeline_metadata::PipelineMetadata) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        let state = PipelineState::from_str(&value.state).with_context(|| {
            format!(
                "Could not parse field 'state' from storage value '{}'",
                value.state
            )
        })?;

        Ok(Metadata {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            created,
            modified,
            state,
        })
    }
}

impl From<Metadata> for storage::pipeline_metadata::PipelineMetadata {
    fn from(value: Metadata) -> Self {
        Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            state: value.state.to_string(),
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        }
    }
}

/// A collection of logically grouped tasks. A task is a unit of work wrapped in a docker container.
/// A pipeline is a logical grouping of tasks along with the settings and values needed to run those
/// tasks. This is the full representation: metadata plus one specific config version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub metadata: Metadata,
    pub config: pipeline_configs::Config,
}

/// Fetches the pipeline metadata along with the single config version currently marked live.
pub async fn get_live_pipeline(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Pipeline, EngineError> {
    let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

    let metadata_raw = storage::pipeline_metadata::get(&mut conn, namespace_id, pipeline_id)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => {
                EngineError::NotFound(format!("pipeline '{pipeline_id}' does not exist"))
            }
            _ => e.into(),
        })?;

    let metadata: Metadata = metadata_raw
        .try_into()
        .map_err(|e: anyhow::Error| EngineError::Unknown(e.to_string()))?;

    let config_raw = storage::pipeline_configs::get_live(&mut conn, namespace_id, pipeline_id)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => EngineError::FailedPrecondition(format!(
                "pipeline '{pipeline_id}' has no live config version"
            )),
            _ => e.into(),
        })?;

    let tasks_raw =
        storage::tasks::list(&mut conn, namespace_id, pipeline_id, config_raw.version).await?;

    let config = pipeline_configs::Config::from_storage(config_raw, tasks_raw)
        .map_err(|e| EngineError::Unknown(e.to_string()))?;

    Ok(Pipeline { metadata, config })
}
