use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub kind: String,
    pub emitted: String,
}

impl From<SqliteRow> for Event {
    fn from(row: SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            kind: row.get("kind"),
            emitted: row.get("emitted"),
        }
    }
}

/// Return events in ascending id order. The reverse parameter flips the sort to newest first.
pub async fn list(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let query_str = r#"
SELECT id, kind, emitted
FROM events
ORDER BY id ASC
LIMIT ?
OFFSET ?;"#;

    let query_str = if reverse {
        query_str.replacen("ASC", "DESC", 1)
    } else {
        query_str.to_string()
    };

    sqlx::query(&query_str)
        .bind(limit)
        .bind(offset)
        .map(Event::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, &query_str))
        .await
}

/// Return events with an id strictly greater than the one given, in ascending id order.
/// Used to resume event streams from a historical point.
pub async fn list_after(
    conn: &mut SqliteConnection,
    after_id: i64,
    limit: i64,
) -> Result<Vec<Event>, StorageError> {
    const QUERY: &str = r#"
SELECT id, kind, emitted
FROM events
WHERE id > ?
ORDER BY id ASC
LIMIT ?;"#;

    sqlx::query(QUERY)
        .bind(after_id)
        .bind(limit)
        .map(Event::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

/// Insert a new event. The monotonically increasing event id is assigned by the database and
/// returned to the caller.
pub async fn insert(conn: &mut SqliteConnection, event: &Event) -> Result<i64, StorageError> {
    const QUERY: &str = r#"
INSERT INTO events (kind, emitted)
VALUES (?, ?);"#;

    let result = sqlx::query(QUERY)
        .bind(&event.kind)
        .bind(&event.emitted)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Event, StorageError> {
    const QUERY: &str = r#"
SELECT id, kind, emitted
FROM events
WHERE id = ?;"#;

    sqlx::query(QUERY)
        .bind(id)
        .map(Event::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<(), StorageError> {
    const QUERY: &str = r#"
DELETE FROM events
WHERE id = ?;"#;

    sqlx::query(QUERY)
        .bind(id)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}
