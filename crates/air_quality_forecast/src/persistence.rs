//! JSON documents and opaque blobs kept in the object store.

use bytes::Bytes;
use object_store::path::Path as ObjectStorePath;
use object_store::{ObjectStore, ObjectStoreExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("invalid document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads an object. `Ok(None)` when it does not exist.
pub async fn load_bytes(
    store: &dyn ObjectStore,
    path: &str,
) -> Result<Option<Bytes>, object_store::Error> {
    let location = ObjectStorePath::from(path);
    let result = match store.get(&location).await {
        Ok(result) => result,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(error) => return Err(error),
    };
    Ok(Some(result.bytes().await?))
}

/// Writes an object, replacing any previous version in one put.
pub async fn save_bytes(
    store: &dyn ObjectStore,
    path: &str,
    payload: Bytes,
) -> Result<(), object_store::Error> {
    store
        .put(&ObjectStorePath::from(path), payload.into())
        .await?;
    Ok(())
}

/// Reads a JSON document. `Ok(None)` when it does not exist.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    path: &str,
) -> Result<Option<T>, PersistError> {
    match load_bytes(store, path).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Writes a JSON document, replacing any previous version in one put.
pub async fn save_json<T: Serialize>(
    store: &dyn ObjectStore,
    path: &str,
    value: &T,
) -> Result<(), PersistError> {
    let payload = Bytes::from(serde_json::to_vec_pretty(value)?);
    save_bytes(store, path, payload).await?;
    Ok(())
}
