use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineMetadata {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub state: String,
    pub created: String,
    pub modified: String,
}

impl From<SqliteRow> for PipelineMetadata {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            state: row.get("state"),
            created: row.get("created"),
            modified: row.get("modified"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub state: Option<String>,
    pub modified: String,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    pipeline: &PipelineMetadata,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO pipeline_metadata (namespace_id, pipeline_id, state, created, modified)
VALUES (?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&pipeline.namespace_id)
        .bind(&pipeline.pipeline_id)
        .bind(&pipeline.state)
        .bind(&pipeline.created)
        .bind(&pipeline.modified)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
) -> Result<Vec<PipelineMetadata>, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, state, created, modified
FROM pipeline_metadata
WHERE namespace_id = ?
ORDER BY pipeline_id ASC;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .map(PipelineMetadata::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineMetadata, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, state, created, modified
FROM pipeline_metadata
WHERE namespace_id = ? AND pipeline_id = ?;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineMetadata::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pipeline_metadata SET ");
    let mut separated = update_query.separated(", ");

    if let Some(state) = fields.state {
        separated.push("state = ");
        separated.push_bind_unseparated(state);
    }

    separated.push("modified = ");
    separated.push_bind_unseparated(fields.modified);

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

pub async fn delete(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"DELETE FROM pipeline_metadata WHERE namespace_id = ? AND pipeline_id = ?;"#;

    let result = sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
