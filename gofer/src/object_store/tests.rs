use super::{filesystem, ObjectStore, ObjectStoreError};
use bytes::Bytes;

#[tokio::test]
/// Basic CRUD can be accomplished for the filesystem object store.
async fn crud_object_store_filesystem() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = filesystem::Config {
        path: tmp_dir.path().to_string_lossy().to_string(),
    };

    let store = filesystem::Engine::new(&config).unwrap();

    let test_key = "test_key";
    let test_value = Bytes::from_static(b"test_value");

    store.put(test_key, test_value.clone(), false).await.unwrap();

    let returned_value = store.get(test_key).await.unwrap();
    assert_eq!(test_value, returned_value);

    assert!(store.exists(test_key).await.unwrap());

    let returned_err = store.put(test_key, test_value.clone(), false).await.unwrap_err();
    assert_eq!(ObjectStoreError::Exists, returned_err);

    // With force the same key should be writable.
    store
        .put(test_key, Bytes::from_static(b"new_value"), true)
        .await
        .unwrap();

    let returned_value = store.get(test_key).await.unwrap();
    assert_eq!(Bytes::from_static(b"new_value"), returned_value);

    store.delete(test_key).await.unwrap();

    let returned_err = store.get(test_key).await.unwrap_err();
    assert_eq!(ObjectStoreError::NotFound, returned_err);
    assert!(!store.exists(test_key).await.unwrap());
}
