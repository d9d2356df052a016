use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionSubscription {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub extension_id: String,
    pub subscription_id: String,
    pub settings: String,
    pub status: String,
    pub status_reason: String,
}

impl From<SqliteRow> for ExtensionSubscription {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            extension_id: row.get("extension_id"),
            subscription_id: row.get("subscription_id"),
            settings: row.get("settings"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub settings: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    subscription: &ExtensionSubscription,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO extension_subscriptions (namespace_id, pipeline_id, extension_id, subscription_id,
    settings, status, status_reason)
VALUES (?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&subscription.namespace_id)
        .bind(&subscription.pipeline_id)
        .bind(&subscription.extension_id)
        .bind(&subscription.subscription_id)
        .bind(&subscription.settings)
        .bind(&subscription.status)
        .bind(&subscription.status_reason)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

/// List every stored subscription; used at startup to replay subscriptions against live extensions.
pub async fn list(
    conn: &mut SqliteConnection,
) -> Result<Vec<ExtensionSubscription>, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, extension_id, subscription_id, settings, status, status_reason
FROM extension_subscriptions
ORDER BY namespace_id, pipeline_id, extension_id, subscription_id ASC;"#;

    sqlx::query(QUERY)
        .map(ExtensionSubscription::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list_by_extension(
    conn: &mut SqliteConnection,
    extension_id: &str,
) -> Result<Vec<ExtensionSubscription>, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, extension_id, subscription_id, settings, status, status_reason
FROM extension_subscriptions
WHERE extension_id = ?
ORDER BY namespace_id, pipeline_id, subscription_id ASC;"#;

    sqlx::query(QUERY)
        .bind(extension_id)
        .map(ExtensionSubscription::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_id: &str,
    subscription_id: &str,
) -> Result<ExtensionSubscription, StorageError> {
    const QUERY: &str = r#"
SELECT namespace_id, pipeline_id, extension_id, subscription_id, settings, status, status_reason
FROM extension_subscriptions
WHERE namespace_id = ? AND pipeline_id = ? AND extension_id = ? AND subscription_id = ?;"#;

    sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(extension_id)
        .bind(subscription_id)
        .map(ExtensionSubscription::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_id: &str,
    subscription_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE extension_subscriptions SET ");

    let mut updated_fields_total = 0;

    if let Some(settings) = fields.settings {
        update_query.push("settings = ");
        update_query.push_bind(settings);
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

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND extension_id = ");
    update_query.push_bind(extension_id);
    update_query.push(" AND subscription_id = ");
    update_query.push_bind(subscription_id);
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
    extension_id: &str,
    subscription_id: &str,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
DELETE FROM extension_subscriptions
WHERE namespace_id = ? AND pipeline_id = ? AND extension_id = ? AND subscription_id = ?;"#;

    let result = sqlx::query(QUERY)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(extension_id)
        .bind(subscription_id)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
