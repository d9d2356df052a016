pub mod sqlite;

#[cfg(test)]
mod tests;

use crate::conf;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use strum::{Display, EnumString};

/// Represents different secret store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("could not establish connection to secret store; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("could not init store; {0}")]
    FailedInitPrecondition(String),

    #[error("unexpected error occurred; {0}")]
    Internal(String),
}

/// A decrypted secret value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(pub Vec<u8>);

/// The store trait defines what the interface between Gofer and a secret store should adhere to.
#[async_trait]
pub trait SecretStore: Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Value, SecretStoreError>;
    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), SecretStoreError>;
    async fn delete(&self, key: &str) -> Result<(), SecretStoreError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum Engine {
    Sqlite,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Sqlite
    }
}

pub async fn new(
    config: &conf::api::SecretStore,
) -> Result<Box<dyn SecretStore>, SecretStoreError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Sqlite => {
            if let Some(config) = &config.sqlite {
                let engine = sqlite::Engine::new(config).await?;
                Ok(Box::new(engine))
            } else {
                Err(SecretStoreError::FailedInitPrecondition(
                    "sqlite engine settings not found in config".into(),
                ))
            }
        }
    }
}
