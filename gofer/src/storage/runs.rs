use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Acquire, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Run {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: i64,
    pub pipeline_config_version: i64,
    pub started: String,
    pub ended: String,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub initiator: String,
    pub variables: String,
    pub store_objects_expired: bool,
    pub event_id: Option<i64>,
}

impl From<SqliteRow> for Run {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            run_id: row.get("run_id"),
            pipeline_config_version: row.get("pipeline_config_version"),
            started: row.get("started"),
            ended: row.get("ended"),
            state: row.get("state"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            initiator: row.get("initiator"),
            variables: row.get("variables"),
            store_objects_expired: row.get("store_objects_expired"),
            event_id: row.get("event_id"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub ended: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub variables: Option<String>,
    pub store_objects_expired: Option<bool>,
    pub event_id: Option<i64>,
}

const SELECT_FIELDS: &str = r#"namespace_id, pipeline_id, run_id, pipeline_config_version, started,
ended, state, status, status_reason, initiator, variables, store_objects_expired, event_id"#;

/// Inserts a new run and returns the run id assigned to it.
///
/// Run ids are sequential per (namespace, pipeline). The next id is derived from the current max
/// inside the same transaction as the insert so that ids stay monotonic even under concurrent
/// run requests.
pub async fn insert(conn: &mut SqliteConnection, run: &Run) -> Result<i64, StorageError> {
    let mut tx = conn
        .begin()
        .map_err(|e| map_sqlx_error(e, "BEGIN"))
        .await?;

    const MAX_QUERY: &str = r#"
SELECT COALESCE(MAX(run_id), 0) as max_id
FROM runs
WHERE namespace_id = ? AND pipeline_id = ?;"#;

    let last_run_id: i64 = sqlx::query(MAX_QUERY)
        .bind(&run.namespace_id)
        .bind(&run.pipeline_id)
        .map(|row: SqliteRow| row.get("max_id"))
        .fetch_one(&mut *tx)
        .map_err(|e| map_sqlx_error(e, MAX_QUERY))
        .await?;

    let next_id = last_run_id + 1;

    const QUERY: &str = r#"
INSERT INTO runs (namespace_id, pipeline_id, run_id, pipeline_config_version, started, ended, state,
    status, status_reason, initiator, variables, store_objects_expired, event_id)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&run.namespace_id)
        .bind(&run.pipeline_id)
        .bind(next_id)
        .bind(run.pipeline_config_version)
        .bind(&run.started)
        .bind(&run.ended)
        .bind(&run.state)
        .bind(&run.status)
        .bind(&run.status_reason)
        .bind(&run.initiator)
        .bind(&run.variables)
        .bind(run.store_objects_expired)
        .bind(run.event_id)
        .execute(&mut *tx)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    tx.commit()
        .map_err(|e| map_sqlx_error(e, "COMMIT"))
        .await?;

    Ok(next_id)
}

/// Return runs for a given namespace/pipeline by id in descending order.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<Run>, StorageError> {
    let query_str = format!(
        r#"
SELECT {SELECT_FIELDS}
FROM runs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY run_id DESC
LIMIT ?
OFFSET ?;"#
    );

    sqlx::query(&query_str)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(limit)
        .bind(offset)
        .map(Run::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

/// Return every run across all pipelines that has not reached the 'complete' state.
pub async fn list_unfinished(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
) -> Result<Vec<Run>, StorageError> {
    let query_str = format!(
        r#"
SELECT {SELECT_FIELDS}
FROM runs
WHERE state != 'complete'
ORDER BY namespace_id, pipeline_id, run_id ASC
LIMIT ?
OFFSET ?;"#
    );

    sqlx::query(&query_str)
        .bind(limit)
        .bind(offset)
        .map(Run::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
) -> Result<Run, StorageError> {
    let query_str = format!(
        r#"
SELECT {SELECT_FIELDS}
FROM runs
WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ?;"#
    );

    sqlx::query(&query_str)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(run_id)
        .map(Run::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Run, StorageError> {
    let query_str = format!(
        r#"
SELECT {SELECT_FIELDS}
FROM runs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY run_id DESC
LIMIT 1;"#
    );

    sqlx::query(&query_str)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(Run::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE runs SET ");

    let mut updated_fields_total = 0;

    if let Some(ended) = fields.ended {
        update_query.push("ended = ");
        update_query.push_bind(ended);
        updated_fields_total += 1;
    }

    if let Some(state) = fields.state {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("state = ");
        update_query.push_bind(state);
        updated_fields_total += 1;
    }

    if let Some(status) = fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
        update_query.push_bind(status);
        updated_fields_total += 1;
    }

    if let Some(status_reason) = fields.status_reason {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status_reason = ");
        update_query.push_bind(status_reason);
        updated_fields_total += 1;
    }

    if let Some(variables) = fields.variables {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("variables = ");
        update_query.push_bind(variables);
        updated_fields_total += 1;
    }

    if let Some(store_objects_expired) = fields.store_objects_expired {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("store_objects_expired = ");
        update_query.push_bind(store_objects_expired);
        updated_fields_total += 1;
    }

    if let Some(event_id) = fields.event_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("event_id = ");
        update_query.push_bind(event_id);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND run_id = ");
    update_query.push_bind(run_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}
