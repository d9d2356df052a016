use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectStorePipelineKey {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub key: String,
    pub created: String,
}

impl From<SqliteRow> for ObjectStorePipelineKey {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            key: row.get("key"),
            created: row.get("created"),
        }
    }
}

pub async fn insert(
    conn: &mut SqliteConnection,
    object_key: &ObjectStorePipelineKey,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO object_store_pipeline_keys (namespace_id, pipeline_id, key, created)
VALUES (?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&object_key.namespace_id)
        .bind(&object_key.pipeline_id)
        .bind(&object_key.key)
        .bind(&object_key.created)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

/// Returns keys in insertion order, oldest first. Eviction takes the head of this list.
/// Ordering is by rowid rather than the created timestamp since two inserts can land within the
/// same millisecond.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<ObjectStorePipelineKey>, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, key, created
FROM object_store_pipeline_keys
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY rowid ASC;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(ObjectStorePipelineKey::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn delete(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
DELETE FROM object_store_pipeline_keys
WHERE namespace_id = ? AND pipeline_id = ? AND key = ?;"#;

    let result = sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(key)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
