use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Task {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub pipeline_config_version: i64,
    pub task_id: String,
    pub description: String,
    pub image: String,
    pub registry_auth: String,
    pub depends_on: String,
    pub variables: String,
    pub entrypoint: String,
    pub command: String,
    pub inject_api_token: bool,
    pub retries: i64,
}

impl From<SqliteRow> for Task {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            pipeline_config_version: row.get("pipeline_config_version"),
            task_id: row.get("task_id"),
            description: row.get("description"),
            image: row.get("image"),
            registry_auth: row.get("registry_auth"),
            depends_on: row.get("depends_on"),
            variables: row.get("variables"),
            entrypoint: row.get("entrypoint"),
            command: row.get("command"),
            inject_api_token: row.get("inject_api_token"),
            retries: row.get("retries"),
        }
    }
}

pub async fn insert(conn: &mut SqliteConnection, task: &Task) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO tasks (namespace_id, pipeline_id, pipeline_config_version, task_id, description, image,
    registry_auth, depends_on, variables, entrypoint, command, inject_api_token, retries)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&task.namespace_id)
        .bind(&task.pipeline_id)
        .bind(task.pipeline_config_version)
        .bind(&task.task_id)
        .bind(&task.description)
        .bind(&task.image)
        .bind(&task.registry_auth)
        .bind(&task.depends_on)
        .bind(&task.variables)
        .bind(&task.entrypoint)
        .bind(&task.command)
        .bind(task.inject_api_token)
        .bind(task.retries)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<Vec<Task>, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, pipeline_config_version, task_id, description, image, registry_auth,
    depends_on, variables, entrypoint, command, inject_api_token, retries
FROM tasks
WHERE namespace_id = ? AND pipeline_id = ? AND pipeline_config_version = ?
ORDER BY task_id ASC;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .map(Task::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
    task_id: &str,
) -> Result<Task, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, pipeline_config_version, task_id, description, image, registry_auth,
    depends_on, variables, entrypoint, command, inject_api_token, retries
FROM tasks
WHERE namespace_id = ? AND pipeline_id = ? AND pipeline_config_version = ? AND task_id = ?;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .bind(task_id)
        .map(Task::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}
