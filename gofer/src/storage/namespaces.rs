use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created: String,
    pub modified: String,
    pub deleted: String,
}

impl From<SqliteRow> for Namespace {
    fn from(row: SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            created: row.get("created"),
            modified: row.get("modified"),
            deleted: row.get("deleted"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub modified: String,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    namespace: &Namespace,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO namespaces (id, name, description, created, modified)
VALUES (?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&namespace.id)
        .bind(&namespace.name)
        .bind(&namespace.description)
        .bind(&namespace.created)
        .bind(&namespace.modified)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Namespace>, StorageError> {
    const QUERY: &str = r#"
SELECT id, name, description, created, modified, deleted
FROM namespaces
WHERE deleted = ''
ORDER BY id ASC;"#;

    sqlx::query(QUERY)
        .map(Namespace::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Namespace, StorageError> {
    const QUERY: &str = r#"
SELECT id, name, description, created, modified, deleted
FROM namespaces
WHERE id = ? AND deleted = '';"#;

    sqlx::query(QUERY)
        .bind(id)
        .map(Namespace::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE namespaces SET ");
    let mut separated = update_query.separated(", ");

    if let Some(name) = fields.name {
        separated.push("name = ");
        separated.push_bind_unseparated(name);
    }

    if let Some(description) = fields.description {
        separated.push("description = ");
        separated.push_bind_unseparated(description);
    }

    separated.push("modified = ");
    separated.push_bind_unseparated(fields.modified);

    update_query.push(" WHERE id = ");
    update_query.push_bind(id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

/// Namespaces are soft deleted so that pipeline history within them stays readable; a deleted
/// namespace no longer shows up in gets or lists.
pub async fn delete(
    conn: &mut SqliteConnection,
    id: &str,
    deleted: &str,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"UPDATE namespaces SET deleted = ? WHERE id = ? AND deleted = '';"#;

    let result = sqlx::query(QUERY)
        .bind(deleted)
        .bind(id)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
