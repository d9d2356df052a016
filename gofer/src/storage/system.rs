use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemParameters {
    pub ignore_pipeline_run_events: bool,
}

pub async fn get_system_parameters(
    conn: &mut SqliteConnection,
) -> Result<SystemParameters, StorageError> {
    const QUERY: &str = r#"SELECT ignore_pipeline_run_events FROM system WHERE id = 1;"#;

    sqlx::query(QUERY)
        .map(|row: SqliteRow| SystemParameters {
            ignore_pipeline_run_events: row.get("ignore_pipeline_run_events"),
        })
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}

pub async fn update_system_parameters(
    conn: &mut SqliteConnection,
    parameters: &SystemParameters,
) -> Result<(), StorageError> {
    const QUERY: &str = r#"UPDATE system SET ignore_pipeline_run_events = ? WHERE id = 1;"#;

    sqlx::query(QUERY)
        .bind(parameters.ignore_pipeline_run_events)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, QUERY))
        .await
}
