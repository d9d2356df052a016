use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretStoreGlobalKey {
    pub key: String,

    /// JSON encoded list of namespace globs this secret is allowed to be used from.
    pub namespaces: String,

    pub created: String,
}

impl From<SqliteRow> for SecretStoreGlobalKey {
    fn from(row: SqliteRow) -> Self {
        Self {
            key: row.get("key"),
            namespaces: row.get("namespaces"),
            created: row.get("created"),
        }
    }
}

pub async fn insert(
    conn: &mut SqliteConnection,
    secret_key: &SecretStoreGlobalKey,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO secret_store_global_keys (key, namespaces, created)
VALUES (?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&secret_key.key)
        .bind(&secret_key.namespaces)
        .bind(&secret_key.created)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
) -> Result<Vec<SecretStoreGlobalKey>, StorageError> {
    const QUERY: &str = r#"
SELECT key, namespaces, created
FROM secret_store_global_keys
ORDER BY key ASC;"#;

    sqlx::query(QUERY)
        .map(SecretStoreGlobalKey::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<SecretStoreGlobalKey, StorageError> {
    const QUERY: &str = r#"
SELECT key, namespaces, created
FROM secret_store_global_keys
WHERE key = ?;"#;

    sqlx::query(QUERY)
        .bind(key)
        .map(SecretStoreGlobalKey::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, key: &str) -> Result<(), StorageError> {
    const QUERY: &str = r#"DELETE FROM secret_store_global_keys WHERE key = ?;"#;

    let result = sqlx::query(QUERY)
        .bind(key)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
