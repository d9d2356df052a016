//! Secret management across two disjoint keyspaces: global secrets (admin owned, shared across
//! namespaces via allow-lists) and pipeline secrets (scoped to a single pipeline). Secret
//! contents live in the secret store; key metadata lives in the relational store.

use crate::engine::{epoch_milli, Engine, EngineError};
use crate::{secret_store, storage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub fn global_secret_store_key(key: &str) -> String {
    format!("global_secret_{key}")
}

pub fn pipeline_secret_store_key(namespace_id: &str, pipeline_id: &str, key: &str) -> String {
    format!("{namespace_id}_{pipeline_id}_{key}")
}

/// Metadata for a global secret. The contents live in the secret store; this row records which
/// namespaces are allowed to dereference the secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalSecret {
    pub key: String,

    /// Namespace globs this secret may be used from. A lone `*` opens the secret up to every
    /// namespace.
    pub namespaces: Vec<String>,

    pub created: u64,
}

impl GlobalSecret {
    pub fn new(key: &str, namespaces: Vec<String>) -> Self {
        Self {
            key: key.into(),
            namespaces,
            created: epoch_milli(),
        }
    }

    pub fn is_allowed_namespace(&self, namespace_id: &str) -> bool {
        self.namespaces
            .iter()
            .any(|pattern| matches_glob(pattern, namespace_id))
    }
}

impl TryFrom<storage::secret_store_global_keys::SecretStoreGlobalKey> for GlobalSecret {
    type Error = anyhow::Error;

    fn try_from(value: storage::secret_store_global_keys::SecretStoreGlobalKey) -> Result<Self> {
        let namespaces = serde_json::from_str(&value.namespaces).with_context(|| {
            format!(
                "Could not parse field 'namespaces' from storage value '{}'",
                value.namespaces
            )
        })?;

        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        Ok(GlobalSecret {
            key: value.key,
            namespaces,
            created,
        })
    }
}

/// Wildcard matching for namespace allow-lists. Only `*` is special; it matches any amount of
/// any character.
pub fn matches_glob(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let mut parts = pattern.split('*').peekable();
    let mut remainder = value;
    let mut first = true;

    while let Some(part) = parts.next() {
        let is_last = parts.peek().is_none();

        if first {
            if !remainder.starts_with(part) {
                return false;
            }
            remainder = &remainder[part.len()..];
            first = false;
            continue;
        }

        if is_last {
            return part.is_empty() || remainder.ends_with(part);
        }

        match remainder.find(part) {
            Some(index) => remainder = &remainder[index + part.len()..],
            None => return false,
        }
    }

    remainder.is_empty()
}

pub async fn put_global_secret(
    engine: &Engine,
    key: &str,
    content: Vec<u8>,
    namespaces: Vec<String>,
    force: bool,
) -> Result<(), EngineError> {
    let new_secret = GlobalSecret::new(key, namespaces);

    let namespaces_json = serde_json::to_string(&new_secret.namespaces)
        .map_err(|e| EngineError::Unknown(e.to_string()))?;

    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        if let Err(e) = storage::secret_store_global_keys::insert(
            &mut conn,
            &storage::secret_store_global_keys::SecretStoreGlobalKey {
                key: key.into(),
                namespaces: namespaces_json,
                created: new_secret.created.to_string(),
            },
        )
        .await
        {
            match e {
                storage::StorageError::Exists if force => {}
                storage::StorageError::Exists => {
                    return Err(EngineError::Exists(format!(
                        "global secret '{key}' already exists"
                    )));
                }
                _ => return Err(e.into()),
            }
        }
    }

    engine
        .secret_store
        .put(&global_secret_store_key(key), content, force)
        .await
        .map_err(|e| match e {
            secret_store::SecretStoreError::Exists => {
                EngineError::Exists(format!("global secret '{key}' already exists"))
            }
            _ => EngineError::SecretStore(e),
        })?;

    Ok(())
}

/// Dereferences a global secret on behalf of a namespace. The caller's namespace must be on the
/// secret's allow-list.
pub async fn get_global_secret(
    engine: &Engine,
    namespace_id: &str,
    key: &str,
) -> Result<Vec<u8>, EngineError> {
    let metadata = {
        let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

        storage::secret_store_global_keys::get(&mut conn, key)
            .await
            .map_err(|e| match e {
                storage::StorageError::NotFound => {
                    EngineError::NotFound(format!("global secret '{key}' does not exist"))
                }
                _ => e.into(),
            })?
    };

    let metadata: GlobalSecret = metadata
        .try_into()
        .map_err(|e: anyhow::Error| EngineError::Unknown(e.to_string()))?;

    if !metadata.is_allowed_namespace(namespace_id) {
        return Err(EngineError::FailedPrecondition(format!(
            "global secret '{key}' cannot be used from namespace '{namespace_id}'"
        )));
    }

    let value = engine
        .secret_store
        .get(&global_secret_store_key(key))
        .await
        .map_err(|e| match e {
            secret_store::SecretStoreError::NotFound => {
                EngineError::NotFound(format!("global secret '{key}' does not exist"))
            }
            _ => EngineError::SecretStore(e),
        })?;

    Ok(value.0)
}

pub async fn delete_global_secret(engine: &Engine, key: &str) -> Result<(), EngineError> {
    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        storage::secret_store_global_keys::delete(&mut conn, key)
            .await
            .map_err(|e| match e {
                storage::StorageError::NotFound => {
                    EngineError::NotFound(format!("global secret '{key}' does not exist"))
                }
                _ => e.into(),
            })?;
    }

    engine
        .secret_store
        .delete(&global_secret_store_key(key))
        .await
        .map_err(EngineError::SecretStore)?;

    Ok(())
}

pub async fn put_pipeline_secret(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
    content: Vec<u8>,
    force: bool,
) -> Result<(), EngineError> {
    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        if let Err(e) = storage::secret_store_pipeline_keys::insert(
            &mut conn,
            &storage::secret_store_pipeline_keys::SecretStorePipelineKey {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                key: key.into(),
                created: epoch_milli().to_string(),
            },
        )
        .await
        {
            match e {
                storage::StorageError::Exists if force => {}
                storage::StorageError::Exists => {
                    return Err(EngineError::Exists(format!(
                        "pipeline secret '{key}' already exists"
                    )));
                }
                _ => return Err(e.into()),
            }
        }
    }

    engine
        .secret_store
        .put(
            &pipeline_secret_store_key(namespace_id, pipeline_id, key),
            content,
            force,
        )
        .await
        .map_err(|e| match e {
            secret_store::SecretStoreError::Exists => {
                EngineError::Exists(format!("pipeline secret '{key}' already exists"))
            }
            _ => EngineError::SecretStore(e),
        })?;

    Ok(())
}

pub async fn get_pipeline_secret(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
) -> Result<Vec<u8>, EngineError> {
    {
        let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

        storage::secret_store_pipeline_keys::get(&mut conn, namespace_id, pipeline_id, key)
            .await
            .map_err(|e| match e {
                storage::StorageError::NotFound => {
                    EngineError::NotFound(format!("pipeline secret '{key}' does not exist"))
                }
                _ => e.into(),
            })?;
    }

    let value = engine
        .secret_store
        .get(&pipeline_secret_store_key(namespace_id, pipeline_id, key))
        .await
        .map_err(|e| match e {
            secret_store::SecretStoreError::NotFound => {
                EngineError::NotFound(format!("pipeline secret '{key}' does not exist"))
            }
            _ => EngineError::SecretStore(e),
        })?;

    Ok(value.0)
}

pub async fn delete_pipeline_secret(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
) -> Result<(), EngineError> {
    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        storage::secret_store_pipeline_keys::delete(&mut conn, namespace_id, pipeline_id, key)
            .await
            .map_err(|e| match e {
                storage::StorageError::NotFound => {
                    EngineError::NotFound(format!("pipeline secret '{key}' does not exist"))
                }
                _ => e.into(),
            })?;
    }

    engine
        .secret_store
        .delete(&pipeline_secret_store_key(namespace_id, pipeline_id, key))
        .await
        .map_err(EngineError::SecretStore)?;

    Ok(())
}
