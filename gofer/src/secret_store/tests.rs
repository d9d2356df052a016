use super::{sqlite, SecretStore, SecretStoreError};

async fn test_engine(tmp_dir: &tempfile::TempDir) -> sqlite::Engine {
    let config = sqlite::Config {
        path: tmp_dir
            .path()
            .join("secrets.db")
            .to_string_lossy()
            .to_string(),
        encryption_key: "testtesttesttesttesttesttesttest".into(),
    };

    sqlite::Engine::new(&config).await.unwrap()
}

#[tokio::test]
/// Basic CRUD can be accomplished for the sqlite secret store.
async fn crud_secret_store_sqlite() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let store = test_engine(&tmp_dir).await;

    let test_key = "test_key";
    let test_value = b"test_value".to_vec();

    store.put(test_key, test_value.clone(), false).await.unwrap();

    let returned_value = store.get(test_key).await.unwrap();
    assert_eq!(test_value, returned_value.0);

    let returned_err = store
        .put(test_key, test_value.clone(), false)
        .await
        .unwrap_err();
    assert_eq!(SecretStoreError::Exists, returned_err);

    store
        .put(test_key, b"new_value".to_vec(), true)
        .await
        .unwrap();

    let returned_value = store.get(test_key).await.unwrap();
    assert_eq!(b"new_value".to_vec(), returned_value.0);

    store.delete(test_key).await.unwrap();

    let returned_err = store.get(test_key).await.unwrap_err();
    assert_eq!(SecretStoreError::NotFound, returned_err);
}

#[test]
fn encrypt_decrypt_round_trip() {
    let key = b"testtesttesttesttesttesttesttest";
    let plaintext = b"super secret value";

    let ciphertext = sqlite::encrypt(key, plaintext).unwrap();
    assert_ne!(ciphertext, plaintext.to_vec());

    let decrypted = sqlite::decrypt(key, &ciphertext).unwrap();
    assert_eq!(decrypted, plaintext.to_vec());
}

#[test]
fn decrypt_rejects_malformed_ciphertext() {
    let key = b"testtesttesttesttesttesttesttest";
    sqlite::decrypt(key, b"short").unwrap_err();
}
