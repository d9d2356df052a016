use super::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{local::LocalFileSystem, ObjectStore as ObjStore};
use serde::Deserialize;

impl From<object_store::Error> for ObjectStoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => ObjectStoreError::NotFound,
            _ => ObjectStoreError::Internal(err.to_string()),
        }
    }
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The path of the directory that should contain the object files.
    pub path: String,
}

#[derive(Debug)]
pub struct Engine(LocalFileSystem);

impl Engine {
    pub fn new(config: &Config) -> Result<Self, ObjectStoreError> {
        std::fs::create_dir_all(&config.path).map_err(|e| {
            ObjectStoreError::FailedInitPrecondition(format!(
                "could not create object store directory; {e}"
            ))
        })?;

        let store = LocalFileSystem::new_with_prefix(&config.path).map_err(|e| {
            ObjectStoreError::FailedInitPrecondition(format!(
                "could not open object store directory; {e}"
            ))
        })?;

        Ok(Engine(store))
    }
}

#[async_trait]
impl ObjectStore for Engine {
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = object_store::path::Path::from(key);

        match self.0.head(&path).await {
            Ok(_) => Ok(true),
            Err(e) => {
                if let object_store::Error::NotFound { .. } = e {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::from(e))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let path = object_store::path::Path::from(key);

        let result = self.0.get(&path).await.map_err(ObjectStoreError::from)?;

        let object = result.bytes().await.map_err(ObjectStoreError::from)?;

        Ok(object)
    }

    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError> {
        let path = object_store::path::Path::from(key);

        // We've found an object, but the user did not pass force, return an error.
        if self.0.head(&path).await.is_ok() && !force {
            return Err(ObjectStoreError::Exists);
        }

        let payload = object_store::PutPayload::from_bytes(content);

        self.0
            .put(&path, payload)
            .await
            .map_err(ObjectStoreError::from)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = object_store::path::Path::from(key);

        self.0.delete(&path).await.map_err(ObjectStoreError::from)?;

        Ok(())
    }
}
