use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub version: i64,
    pub parallelism: i64,
    pub state: String,
    pub registered: String,
    pub deprecated: String,
}

impl From<SqliteRow> for PipelineConfig {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            version: row.get("version"),
            parallelism: row.get("parallelism"),
            state: row.get("state"),
            registered: row.get("registered"),
            deprecated: row.get("deprecated"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub state: Option<String>,
    pub deprecated: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    config: &PipelineConfig,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO pipeline_configs (namespace_id, pipeline_id, version, parallelism, state, registered)
VALUES (?, ?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&config.namespace_id)
        .bind(&config.pipeline_id)
        .bind(config.version)
        .bind(config.parallelism)
        .bind(&config.state)
        .bind(&config.registered)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<PipelineConfig>, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, version, parallelism, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY version ASC;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineConfig::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<PipelineConfig, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, version, parallelism, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ? AND version = ?;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .map(PipelineConfig::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineConfig, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, version, parallelism, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY version DESC
LIMIT 1;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineConfig::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

/// Returns the single config currently in the 'live' state for the pipeline, if any.
pub async fn get_live(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineConfig, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, version, parallelism, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ? AND state = 'live'
ORDER BY version DESC
LIMIT 1;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineConfig::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pipeline_configs SET ");

    let mut updated_fields_total = 0;

    if let Some(state) = fields.state {
        update_query.push("state = ");
        update_query.push_bind(state);
        updated_fields_total += 1;
    }

    if let Some(deprecated) = fields.deprecated {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("deprecated = ");
        update_query.push_bind(deprecated);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND version = ");
    update_query.push_bind(version);
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
    version: i64,
) -> Result<(), StorageError> {
    const QUERY: &str =
        r#"DELETE FROM pipeline_configs WHERE namespace_id = ? AND pipeline_id = ? AND version = ?;"#;

    let result = sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
