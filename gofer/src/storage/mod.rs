//! Contains the data storage interface in which Gofer stores all internal data.
//!
//! As a special concession made we use TEXT to keep epoch millisecond time due to Sqlite's limitation
//! in using only i64. We want most epoch millisecond representations to instead just be u64.
//!
//! ## Transactions
//!
//! Transactions are handled by calling [`Db::open_tx`]:
//!
//! ```ignore
//! let mut tx = storage.open_tx().await?;
//! some_db_call(&mut tx).await?;
//! some_other_db_call(&mut tx).await?;
//! tx.commit().await?; // Make sure you call commit or changes made inside the transaction are dropped.
//! ```
//!
//! Sqlite tuning with help from: https://kerkour.com/sqlite-for-servers

pub mod events;
pub mod extension_registrations;
pub mod extension_subscriptions;
pub mod namespaces;
pub mod object_store_pipeline_keys;
pub mod object_store_run_keys;
pub mod pipeline_configs;
pub mod pipeline_metadata;
pub mod runs;
pub mod secret_store_global_keys;
pub mod secret_store_pipeline_keys;
pub mod system;
pub mod task_executions;
pub mod tasks;

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite, Transaction,
};
use std::ops::Deref;
use std::str::FromStr;

const SCHEMA: &str = include_str!("./schema.sql");

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("did not find required foreign key for query; {0}")]
    ForeignKeyViolation(String),

    #[error(
        "unexpected storage error occurred; code: {code:?}; message: {message}; query: {query}"
    )]
    GenericDBError {
        code: Option<String>,
        message: String,
        query: String,
    },
}

/// Sqlite errors are determined by database error code. We map these to specific variants so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => StorageError::Exists,
                    "787" => StorageError::ForeignKeyViolation(database_err.to_string()),
                    _ => StorageError::GenericDBError {
                        code: Some(err_code.to_string()),
                        message: format!("Unmapped error occurred; {}", database_err),
                        query: query.into(),
                    },
                }
            } else {
                StorageError::GenericDBError {
                    code: None,
                    message: database_err.to_string(),
                    query: query.into(),
                }
            }
        }
        _ => StorageError::GenericDBError {
            code: None,
            message: e.to_string(),
            query: query.into(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct Db {
    read_pool: Pool<Sqlite>,
    write_pool: Pool<Sqlite>,
}

impl Db {
    pub async fn new(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .context("Could not create directory for storage path")?;
        }

        // The settings here control various sqlite attributes that are required for a working and performant
        // sqlite database. In order:
        // * journal_mode: Turns on WAL mode which increases concurrency and reliability.
        // * synchronous: Tells sqlite to not sync to disk as often and specifically only focus on syncing at critical
        //   junctures. This makes sqlite speedier and also has no downside because we have WAL mode.
        // * foreign_keys: Turns on relational style foreign keys. A must have.
        // * busy_timeout: How long a sqlite query will try before it returns an error. Very helpful to avoid
        //   sqlite "database busy/database is locked" errors.
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .context("Could not parse sqlite connection path")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        // We create two different pools of connections. The read pool has many connections and is high concurrency.
        // The write pool is essentially a single connection in which only one write can be made at a time.
        // Not using this paradigm may result in sqlite "database is locked(error: 5)" errors because of the
        // manner in which sqlite handles transactions.
        let read_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(connect_options.clone())
            .await
            .context("Could not open read pool to sqlite database")?;

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context("Could not open write pool to sqlite database")?;

        sqlx::raw_sql(SCHEMA)
            .execute(&write_pool)
            .await
            .context("Could not run schema against sqlite database")?;

        Ok(Db {
            read_pool,
            write_pool,
        })
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }

    /// Alias for [`Db::write_conn`]; useful at call sites that don't care about the read/write split.
    pub async fn conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_conn().await
    }

    pub async fn open_tx(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        self.write_pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }
}
