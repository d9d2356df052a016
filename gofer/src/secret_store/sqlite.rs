use super::{SecretStore, SecretStoreError, Value};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead},
    Aes256Gcm, KeyInit,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::TryFutureExt;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::ops::Deref;
use std::str::FromStr;
use tracing::error;

// Standard nonce size for AES-GCM.
const NONCE_SIZE: usize = 12;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    pub path: String,

    /// Must be at least 32 characters long.
    pub encryption_key: String,
}

#[derive(Debug, Clone)]
pub struct Engine {
    pool: Pool<Sqlite>,
    encryption_key: String,
}

/// Sqlite errors are determined by database error code. We map these to specific variants so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
fn map_sqlx_error(e: sqlx::Error, query: &str) -> SecretStoreError {
    match e {
        sqlx::Error::RowNotFound => SecretStoreError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => SecretStoreError::Exists,
                    _ => SecretStoreError::Internal(format!(
                        "Error occurred while running secret store query; [{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                SecretStoreError::Internal(format!(
                    "Error occurred while running secret store query; {database_err}; query: {query}"
                ))
            }
        }
        _ => SecretStoreError::Internal(format!(
            "Error occurred while running query; {:#?}; query: {query}",
            e
        )),
    }
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self, SecretStoreError> {
        if config.encryption_key.len() < 32 {
            return Err(SecretStoreError::FailedInitPrecondition(
                "secret_store.sqlite.encryption_key must be at least 32 characters".into(),
            ));
        }

        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SecretStoreError::FailedInitPrecondition(format!(
                    "could not create directory for secret store path; {e}"
                ))
            })?;
        }

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| {
                SecretStoreError::FailedInitPrecondition(format!(
                    "could not parse secret store path; {e}"
                ))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_options)
            .await
            .map_err(|e| SecretStoreError::Connection(format!("{:?}", e)))?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS secrets (
    key   TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key)
) STRICT;"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| {
            SecretStoreError::FailedInitPrecondition(format!("could not create schema; {e}"))
        })?;

        Ok(Engine {
            pool,
            encryption_key: config.encryption_key.clone(),
        })
    }

    async fn conn(&self) -> Result<PoolConnection<Sqlite>, SecretStoreError> {
        self.pool.acquire().await.map_err(|e| {
            SecretStoreError::Connection(format!(
                "Could not establish connection to secret store; {:?}",
                e
            ))
        })
    }
}

pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key[..32])
        .map_err(|e| anyhow!("invalid key length: {:?}", e))?;

    let mut n = vec![0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut n);
    let nonce = GenericArray::from_slice(&n);

    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| {
        error!(error = %e, "Could not encrypt value for key");
        anyhow!("Could not encrypt value for key")
    })?;

    Ok([nonce.as_slice(), ciphertext.as_slice()].concat())
}

pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE {
        bail!("Ciphertext is too short and may be malformed");
    }

    let cipher = Aes256Gcm::new_from_slice(&key[..32])
        .map_err(|e| anyhow!("invalid key length: {:?}", e))?;
    let (nonce, ciphertext) = ciphertext.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce);

    cipher.decrypt(nonce, ciphertext).map_err(|e| {
        error!(error = %e, "Could not decrypt value for key");
        anyhow!("Could not decrypt value for key")
    })
}

#[async_trait]
impl SecretStore for Engine {
    async fn get(&self, key: &str) -> Result<Value, SecretStoreError> {
        let mut conn = self.conn().await?;

        const QUERY: &str = "SELECT value FROM secrets WHERE key = ?;";

        let result: (Vec<u8>,) = sqlx::query_as(QUERY)
            .bind(key)
            .fetch_one(&mut *conn)
            .map_err(|e| map_sqlx_error(e, QUERY))
            .await?;

        let decrypted_value =
            decrypt(self.encryption_key.as_bytes(), &result.0).map_err(|_| {
                SecretStoreError::Internal("Could not decrypt value while getting secret".into())
            })?;

        Ok(Value(decrypted_value))
    }

    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), SecretStoreError> {
        let encrypted_value =
            encrypt(self.encryption_key.as_bytes(), &content).map_err(|_| {
                SecretStoreError::Internal("Could not encrypt value while inserting secret".into())
            })?;

        let mut conn = self.conn().await?;

        const QUERY: &str = "INSERT INTO secrets (key, value) VALUES (?, ?);";

        // If there is already a key we provide the functionality to update that key instead of
        // passing back up the conflict error, but only when the caller asked for it via force.
        if let Err(e) = sqlx::query(QUERY)
            .bind(key)
            .bind(encrypted_value.clone())
            .execute(&mut *conn)
            .await
        {
            let mapped = map_sqlx_error(e, QUERY);

            if mapped != SecretStoreError::Exists || !force {
                return Err(mapped);
            }

            const UPDATE_QUERY: &str = "UPDATE secrets SET value = ? WHERE key = ?;";

            sqlx::query(UPDATE_QUERY)
                .bind(encrypted_value)
                .bind(key)
                .execute(&mut *conn)
                .map_err(|err| map_sqlx_error(err, UPDATE_QUERY))
                .await?;
        };

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        let mut conn = self.conn().await?;

        const QUERY: &str = "DELETE FROM secrets WHERE key = ?;";

        sqlx::query(QUERY)
            .bind(key)
            .execute(&mut *conn)
            .map_ok(|_| ())
            .map_err(|e| map_sqlx_error(e, QUERY))
            .await
    }
}
