//! Pipeline and run level object registries. Both registries are bounded; once a registry is at
//! its limit the oldest key is evicted to make room, strictly FIFO by insertion order.

use crate::engine::{epoch_milli, Engine, EngineError};
use crate::{object_store, storage};
use bytes::Bytes;
use tracing::debug;

pub fn pipeline_object_store_key(namespace_id: &str, pipeline_id: &str, key: &str) -> String {
    format!("{namespace_id}_{pipeline_id}_{key}")
}

pub fn run_object_store_key(
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    key: &str,
) -> String {
    format!("{namespace_id}_{pipeline_id}_{run_id}_{key}")
}

/// Stores a pipeline level object. If the pipeline is already at its object limit the oldest
/// stored key is evicted first. Re-putting an existing key without force returns an
/// already-exists error.
pub async fn put_pipeline_object(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
    content: Bytes,
    force: bool,
) -> Result<(), EngineError> {
    let limit = engine.config.object_store.pipeline_object_limit;

    let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

    let existing_keys =
        storage::object_store_pipeline_keys::list(&mut conn, namespace_id, pipeline_id).await?;

    let is_new_key = !existing_keys.iter().any(|object_key| object_key.key == key);

    if is_new_key && existing_keys.len() as u64 >= limit {
        let evicted = &existing_keys[0];

        if let Err(e) = engine
            .object_store
            .delete(&pipeline_object_store_key(
                namespace_id,
                pipeline_id,
                &evicted.key,
            ))
            .await
        {
            if e != object_store::ObjectStoreError::NotFound {
                return Err(EngineError::ObjectStore(e));
            }
        }

        storage::object_store_pipeline_keys::delete(
            &mut conn,
            namespace_id,
            pipeline_id,
            &evicted.key,
        )
        .await?;

        debug!(
            namespace_id = namespace_id,
            pipeline_id = pipeline_id,
            evicted_key = evicted.key,
            limit = limit,
            "Evicted oldest pipeline object to make room for new object"
        );
    }

    if is_new_key {
        storage::object_store_pipeline_keys::insert(
            &mut conn,
            &storage::object_store_pipeline_keys::ObjectStorePipelineKey {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                key: key.into(),
                created: epoch_milli().to_string(),
            },
        )
        .await?;
    }

    engine
        .object_store
        .put(
            &pipeline_object_store_key(namespace_id, pipeline_id, key),
            content,
            force,
        )
        .await
        .map_err(|e| match e {
            object_store::ObjectStoreError::Exists => {
                EngineError::Exists(format!("pipeline object '{key}' already exists"))
            }
            _ => EngineError::ObjectStore(e),
        })?;

    Ok(())
}

pub async fn get_pipeline_object(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
) -> Result<Bytes, EngineError> {
    engine
        .object_store
        .get(&pipeline_object_store_key(namespace_id, pipeline_id, key))
        .await
        .map_err(|e| match e {
            object_store::ObjectStoreError::NotFound => {
                EngineError::NotFound(format!("pipeline object '{key}' does not exist"))
            }
            _ => EngineError::ObjectStore(e),
        })
}

pub async fn list_pipeline_object_keys(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<String>, EngineError> {
    let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

    let keys =
        storage::object_store_pipeline_keys::list(&mut conn, namespace_id, pipeline_id).await?;

    Ok(keys.into_iter().map(|object_key| object_key.key).collect())
}

pub async fn delete_pipeline_object(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
) -> Result<(), EngineError> {
    let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

    storage::object_store_pipeline_keys::delete(&mut conn, namespace_id, pipeline_id, key)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => {
                EngineError::NotFound(format!("pipeline object '{key}' does not exist"))
            }
            _ => e.into(),
        })?;

    engine
        .object_store
        .delete(&pipeline_object_store_key(namespace_id, pipeline_id, key))
        .await
        .map_err(EngineError::ObjectStore)?;

    Ok(())
}

/// Stores a run level object. Run registries follow the same FIFO eviction policy as pipeline
/// registries, with their own limit.
pub async fn put_run_object(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    key: &str,
    content: Bytes,
    force: bool,
) -> Result<(), EngineError> {
    let limit = engine.config.object_store.run_object_limit;

    let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

    let existing_keys =
        storage::object_store_run_keys::list(&mut conn, namespace_id, pipeline_id, run_id as i64)
            .await?;

    let is_new_key = !existing_keys.iter().any(|object_key| object_key.key == key);

    if is_new_key && existing_keys.len() as u64 >= limit {
        let evicted = &existing_keys[0];

        if let Err(e) = engine
            .object_store
            .delete(&run_object_store_key(
                namespace_id,
                pipeline_id,
                run_id,
                &evicted.key,
            ))
            .await
        {
            if e != object_store::ObjectStoreError::NotFound {
                return Err(EngineError::ObjectStore(e));
            }
        }

        storage::object_store_run_keys::delete(
            &mut conn,
            namespace_id,
            pipeline_id,
            run_id as i64,
            &evicted.key,
        )
        .await?;

        debug!(
            namespace_id = namespace_id,
            pipeline_id = pipeline_id,
            run_id = run_id,
            evicted_key = evicted.key,
            limit = limit,
            "Evicted oldest run object to make room for new object"
        );
    }

    if is_new_key {
        storage::object_store_run_keys::insert(
            &mut conn,
            &storage::object_store_run_keys::ObjectStoreRunKey {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                run_id: run_id as i64,
                key: key.into(),
                created: epoch_milli().to_string(),
            },
        )
        .await?;
    }

    engine
        .object_store
        .put(
            &run_object_store_key(namespace_id, pipeline_id, run_id, key),
            content,
            force,
        )
        .await
        .map_err(|e| match e {
            object_store::ObjectStoreError::Exists => {
                EngineError::Exists(format!("run object '{key}' already exists"))
            }
            _ => EngineError::ObjectStore(e),
        })?;

    Ok(())
}

pub async fn get_run_object(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    key: &str,
) -> Result<Bytes, EngineError> {
    engine
        .object_store
        .get(&run_object_store_key(namespace_id, pipeline_id, run_id, key))
        .await
        .map_err(|e| match e {
            object_store::ObjectStoreError::NotFound => {
                EngineError::NotFound(format!("run object '{key}' does not exist"))
            }
            _ => EngineError::ObjectStore(e),
        })
}

pub async fn list_run_object_keys(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
) -> Result<Vec<String>, EngineError> {
    let mut conn = engine.storage.read_conn().await.map_err(EngineError::from)?;

    let keys =
        storage::object_store_run_keys::list(&mut conn, namespace_id, pipeline_id, run_id as i64)
            .await?;

    Ok(keys.into_iter().map(|object_key| object_key.key).collect())
}
