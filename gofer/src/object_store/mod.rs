pub mod filesystem;

#[cfg(test)]
mod tests;

use crate::conf;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt::Debug;
use strum::{Display, EnumString};

/// Represents different object store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("could not init store; {0}")]
    FailedInitPrecondition(String),

    #[error("unexpected error occurred; {0}")]
    Internal(String),
}

/// The store trait defines what the interface between Gofer and an object store should adhere to.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum Engine {
    Filesystem,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Filesystem
    }
}

pub async fn new(
    config: &conf::api::ObjectStore,
) -> Result<Box<dyn ObjectStore>, ObjectStoreError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Filesystem => {
            if let Some(config) = &config.filesystem {
                let engine = filesystem::Engine::new(config)?;
                Ok(Box::new(engine))
            } else {
                Err(ObjectStoreError::FailedInitPrecondition(
                    "filesystem engine settings not found in config".into(),
                ))
            }
        }
    }
}
