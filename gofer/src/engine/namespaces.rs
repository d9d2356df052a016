use crate::engine::{epoch_milli, event_utils, is_valid_identifier, Engine, EngineError};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// The identifier for the namespace that is created on first boot and used when no other
/// namespace is specified.
pub const DEFAULT_NAMESPACE_ID: &str = "default";

/// A namespace represents a grouping of pipelines. Normally it is used to divide teams or
/// logically different sections of workloads. It is the highest level unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    /// Unique user defined identifier for the namespace.
    pub id: String,

    /// Humanized name for the namespace.
    pub name: String,

    /// Short description about what the namespace is used for.
    pub description: String,

    /// Time in epoch milliseconds when the namespace was created.
    pub created: u64,

    /// Time in epoch milliseconds when the namespace was last modified.
    pub modified: u64,

    /// Time in epoch milliseconds when the namespace was deleted, if it was.
    pub deleted: Option<u64>,
}

impl Namespace {
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Namespace {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            created: epoch_milli(),
            modified: epoch_milli(),
            deleted: None,
        }
    }
}

impl TryFrom<storage::namespaces::Namespace> for Namespace {
    type Error = anyhow::Error;

    fn try_from(value: storage::namespaces::Namespace) -> Result<Self> {
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

        let deleted = if value.deleted.is_empty() {
            None
        } else {
            Some(value.deleted.parse::<u64>().with_context(|| {
                format!(
                    "Could not parse field 'deleted' from storage value '{}'",
                    value.deleted
                )
            })?)
        };

        Ok(Namespace {
            id: value.id,
            name: value.name,
            description: value.description,
            created,
            modified,
            deleted,
        })
    }
}

impl From<Namespace> for storage::namespaces::Namespace {
    fn from(value: Namespace) -> Self {
        Self {
            id: value.id,
            name: value.name,
            description: value.description,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
            deleted: value.deleted.map(|d| d.to_string()).unwrap_or_default(),
        }
    }
}

pub async fn create_namespace(
    engine: &Engine,
    id: &str,
    name: &str,
    description: &str,
) -> Result<Namespace, EngineError> {
    is_valid_identifier(id).map_err(|e| EngineError::FailedPrecondition(e.to_string()))?;

    let new_namespace = Namespace::new(id, name, description);

    let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

    storage::namespaces::insert(&mut conn, &new_namespace.clone().into())
        .await
        .map_err(|e| match e {
            storage::StorageError::Exists => {
                EngineError::Exists(format!("namespace '{id}' already exists"))
            }
            _ => e.into(),
        })?;

    drop(conn);

    engine
        .event_bus
        .publish(event_utils::Kind::CreatedNamespace {
            namespace_id: id.into(),
        })
        .await;

    Ok(new_namespace)
}

pub async fn get_namespace(engine: &Engine, id: &str) -> Result<Namespace, EngineError> {
    let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

    let namespace = storage::namespaces::get(&mut conn, id)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => {
                EngineError::NotFound(format!("namespace '{id}' does not exist"))
            }
            _ => e.into(),
        })?;

    namespace
        .try_into()
        .map_err(|e: anyhow::Error| EngineError::Unknown(e.to_string()))
}

pub async fn delete_namespace(engine: &Engine, id: &str) -> Result<(), EngineError> {
    let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

    storage::namespaces::delete(&mut conn, id, &epoch_milli().to_string())
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => {
                EngineError::NotFound(format!("namespace '{id}' does not exist"))
            }
            _ => e.into(),
        })?;

    drop(conn);

    engine
        .event_bus
        .publish(event_utils::Kind::DeletedNamespace {
            namespace_id: id.into(),
        })
        .await;

    Ok(())
}

/// The default namespace is created on first boot so that operators can immediately register
/// pipelines without any setup.
pub async fn create_default_namespace(engine: &Engine) -> Result<()> {
    match create_namespace(
        engine,
        DEFAULT_NAMESPACE_ID,
        "Default",
        "The original namespace created automatically on first startup",
    )
    .await
    {
        Ok(_) => {
            info!(id = DEFAULT_NAMESPACE_ID, "Created default namespace");
            Ok(())
        }
        Err(EngineError::Exists(_)) => Ok(()),
        Err(e) => Err(anyhow::anyhow!(
            "Could not create default namespace; {:#?}",
            e
        )),
    }
}
