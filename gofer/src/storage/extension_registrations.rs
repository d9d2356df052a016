use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionRegistration {
    pub extension_id: String,
    pub image: String,
    pub registry_auth: String,
    pub settings: String,
    pub created: String,
    pub modified: String,
    pub status: String,
}

impl From<SqliteRow> for ExtensionRegistration {
    fn from(row: SqliteRow) -> Self {
        Self {
            extension_id: row.get("extension_id"),
            image: row.get("image"),
            registry_auth: row.get("registry_auth"),
            settings: row.get("settings"),
            created: row.get("created"),
            modified: row.get("modified"),
            status: row.get("status"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub image: Option<String>,
    pub registry_auth: Option<String>,
    pub settings: Option<String>,
    pub status: Option<String>,
    pub modified: String,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    registration: &ExtensionRegistration,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"
INSERT INTO extension_registrations (extension_id, image, registry_auth, settings, created, modified, status)
VALUES (?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(QUERY)
        .bind(&registration.extension_id)
        .bind(&registration.image)
        .bind(&registration.registry_auth)
        .bind(&registration.settings)
        .bind(&registration.created)
        .bind(&registration.modified)
        .bind(&registration.status)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
) -> Result<Vec<ExtensionRegistration>, StorageError> {
    const QUERY: &str = r#"
SELECT extension_id, image, registry_auth, settings, created, modified, status
FROM extension_registrations
ORDER BY extension_id ASC;"#;

    sqlx::query(QUERY)
        .map(ExtensionRegistration::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    extension_id: &str,
) -> Result<ExtensionRegistration, StorageError> {
    const QUERY: &str = r#"
SELECT extension_id, image, registry_auth, settings, created, modified, status
FROM extension_registrations
WHERE extension_id = ?;"#;

    sqlx::query(QUERY)
        .bind(extension_id)
        .map(ExtensionRegistration::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    extension_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE extension_registrations SET ");

    let mut updated_fields_total = 0;

    if let Some(image) = fields.image {
        update_query.push("image = ");
        update_query.push_bind(image);
        updated_fields_total += 1;
    }

    if let Some(registry_auth) = fields.registry_auth {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("registry_auth = ");
        update_query.push_bind(registry_auth);
        updated_fields_total += 1;
    }

    if let Some(settings) = fields.settings {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
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

    if updated_fields_total > 0 {
        update_query.push(", ");
    }
    update_query.push("modified = ");
    update_query.push_bind(fields.modified);

    update_query.push(" WHERE extension_id = ");
    update_query.push_bind(extension_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, extension_id: &str) -> Result<(), StorageError> {
    const QUERY: &str = r#"DELETE FROM extension_registrations WHERE extension_id = ?;"#;

    let result = sqlx::query(QUERY)
        .bind(extension_id)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
