//! Opaque key/value + blob store. The correlation core treats
//! persistence as a dumb content-addressed bucket: JSON documents under
//! string keys, plus a namespaced prefix scan for listing. No schema, no
//! query planner — callers own their own key conventions.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::InMemoryStore;

use crate::error::Result;

/// Common interface for opaque storage backends.
///
/// Deliberately has no generic methods so `dyn Store` stays usable — the
/// orchestrator holds its store behind `Arc<dyn Store>` to stay agnostic of
/// the backend. JSON convenience wrappers live as free functions below
/// instead of default trait methods for the same reason.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key with the given prefix, in lexicographic order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Serialize `value` to JSON and `put` it under `key`.
pub async fn put_json<T: serde::Serialize + Sync>(
    store: &(impl Store + ?Sized),
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(crate::error::StoreError::Serialization)?;
    store.put(key, &bytes).await
}

/// `get` and deserialize as JSON.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &(impl Store + ?Sized),
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(crate::error::StoreError::Serialization)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip<S: Store>(store: &S) {
        assert!(store.get("a/1").await.unwrap().is_none());
        store.put("a/1", b"hello").await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap().unwrap(), b"hello");

        store.put("a/2", b"world").await.unwrap();
        store.put("b/1", b"other").await.unwrap();
        let mut keys = store.list_prefix("a/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a/1".to_string(), "a/2".to_string()]);

        store.delete("a/1").await.unwrap();
        assert!(store.get("a/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        roundtrip(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        roundtrip(&FsStore::new(tmp.path())).await;
    }

    #[tokio::test]
    async fn json_helpers_roundtrip_through_dyn_store() {
        let store: Box<dyn Store> = Box::new(InMemoryStore::new());
        put_json(store.as_ref(), "k", &vec![1, 2, 3]).await.unwrap();
        let value: Option<Vec<i32>> = get_json(store.as_ref(), "k").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }
}
