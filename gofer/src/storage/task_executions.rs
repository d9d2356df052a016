use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskExecution {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: i64,
    pub task_id: String,
    pub task: String,
    pub created: String,
    pub started: String,
    pub ended: String,
    pub attempt: i64,
    pub exit_code: Option<i64>,
    pub scheduler_id: Option<String>,
    pub logs_expired: bool,
    pub logs_removed: bool,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub variables: String,
}

impl From<SqliteRow> for TaskExecution {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            run_id: row.get("run_id"),
            task_id: row.get("task_id"),
            task: row.get("task"),
            created: row.get("created"),
            started: row.get("started"),
            ended: row.get("ended"),
            attempt: row.get("attempt"),
            exit_code: row.get("exit_code"),
            scheduler_id: row.get("scheduler_id"),
            logs_expired: row.get("logs_expired"),
            logs_removed: row.get("logs_removed"),
            state: row.get("state"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            variables: row.get("variables"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub started: Option<String>,
    pub ended: Option<String>,
    pub attempt: Option<i64>,
    pub exit_code: Option<i64>,
    pub scheduler_id: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub logs_expired: Option<bool>,
    pub logs_removed: Option<bool>,
    pub variables: Option<String>,
}

const SELECT_FIELDS: &str = r#"namespace_id, pipeline_id, run_id, task_id, task, created, started,
ended, attempt, exit_code, scheduler_id, logs_expired, logs_removed, state, status, status_reason, variables"#;

pub async fn insert(
    conn: &mut SqliteConnection,
    task_execution: &TaskExecution,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO task_executions (namespace_id, pipeline_id, run_id, task_id, task, created, started,
    ended, attempt, exit_code, scheduler_id, logs_expired, logs_removed, state, status, status_reason, variables)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&task_execution.namespace_id)
        .bind(&task_execution.pipeline_id)
        .bind(task_execution.run_id)
        .bind(&task_execution.task_id)
        .bind(&task_execution.task)
        .bind(&task_execution.created)
        .bind(&task_execution.started)
        .bind(&task_execution.ended)
        .bind(task_execution.attempt)
        .bind(task_execution.exit_code)
        .bind(&task_execution.scheduler_id)
        .bind(task_execution.logs_expired)
        .bind(task_execution.logs_removed)
        .bind(&task_execution.state)
        .bind(&task_execution.status)
        .bind(&task_execution.status_reason)
        .bind(&task_execution.variables)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
) -> Result<Vec<TaskExecution>, StorageError> {
    let query_str = format!(
        r#"
SELECT {SELECT_FIELDS}
FROM task_executions
WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ?
ORDER BY task_id ASC;"#
    );

    sqlx::query(&query_str)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(run_id)
        .map(TaskExecution::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    task_id: &str,
) -> Result<TaskExecution, StorageError> {
    let query_str = format!(
        r#"
SELECT {SELECT_FIELDS}
FROM task_executions
WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ? AND task_id = ?;"#
    );

    sqlx::query(&query_str)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(run_id)
        .bind(task_id)
        .map(TaskExecution::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    task_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE task_executions SET ");

    let mut updated_fields_total = 0;

    if let Some(started) = fields.started {
        update_query.push("started = ");
        update_query.push_bind(started);
        updated_fields_total += 1;
    }

    if let Some(ended) = fields.ended {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("ended = ");
        update_query.push_bind(ended);
        updated_fields_total += 1;
    }

    if let Some(attempt) = fields.attempt {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("attempt = ");
        update_query.push_bind(attempt);
        updated_fields_total += 1;
    }

    if let Some(exit_code) = fields.exit_code {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("exit_code = ");
        update_query.push_bind(exit_code);
        updated_fields_total += 1;
    }

    if let Some(scheduler_id) = fields.scheduler_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("scheduler_id = ");
        update_query.push_bind(scheduler_id);
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

    if let Some(logs_expired) = fields.logs_expired {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("logs_expired = ");
        update_query.push_bind(logs_expired);
        updated_fields_total += 1;
    }

    if let Some(logs_removed) = fields.logs_removed {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("logs_removed = ");
        update_query.push_bind(logs_removed);
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

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND run_id = ");
    update_query.push_bind(run_id);
    update_query.push(" AND task_id = ");
    update_query.push_bind(task_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}
