//! In-memory ResultStore

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use labelaudio_core::store::{content_hash, encode_payload, ResultRef, ResultStore, StoreError};

struct Entry {
    payload: Value,
    size_bytes: u64,
}

/// Process-local store for development, tests and single-shot CLI runs.
#[derive(Default)]
pub struct InMemoryResultStore {
    entries: RwLock<HashMap<(String, String), Entry>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries across all runs.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(
        &self,
        run_id: &str,
        payload: &Value,
        content_type: &str,
    ) -> Result<ResultRef, StoreError> {
        let bytes = encode_payload(payload)?;
        let hash = content_hash(run_id, &bytes);
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entries
            .entry((run_id.to_string(), hash.clone()))
            .or_insert_with(|| Entry {
                payload: payload.clone(),
                size_bytes: bytes.len() as u64,
            });
        Ok(ResultRef {
            location: format!("memory://{}/{}", run_id, hash),
            ref_id: hash,
            run_id: run_id.to_string(),
            size_bytes: bytes.len() as u64,
            content_type: content_type.to_string(),
        })
    }

    async fn get(&self, reference: &ResultRef) -> Result<Value, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entries
            .get(&(reference.run_id.clone(), reference.ref_id.clone()))
            .filter(|entry| entry.size_bytes == reference.size_bytes)
            .map(|entry| entry.payload.clone())
            .ok_or_else(|| StoreError::ReferenceNotFound(reference.summary()))
    }

    async fn delete(&self, reference: &ResultRef) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entries.remove(&(reference.run_id.clone(), reference.ref_id.clone()));
        Ok(())
    }

    async fn purge_run(&self, run_id: &str) -> Result<usize, StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let before = entries.len();
        entries.retain(|(run, _), _| run != run_id);
        let dropped = before - entries.len();
        tracing::debug!(run_id = %run_id, dropped, "run purged from memory store");
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelaudio_core::store::JSON_CONTENT_TYPE;
    use serde_json::json;

    #[test]
    fn test_identical_writes_share_one_entry() {
        tokio_test::block_on(async {
            let store = InMemoryResultStore::new();
            let payload = json!({"text": "hello", "sentences": [1, 2, 3]});
            let a = store.put("run-1", &payload, JSON_CONTENT_TYPE).await.expect("put");
            let b = store.put("run-1", &payload, JSON_CONTENT_TYPE).await.expect("put");
            assert_eq!(a, b);
            assert_eq!(store.len(), 1);
            assert_eq!(store.get(&a).await.expect("get"), payload);

            let other_run = store.put("run-2", &payload, JSON_CONTENT_TYPE).await.expect("put");
            assert_ne!(other_run.ref_id, a.ref_id);
            assert_eq!(store.len(), 2);
        });
    }

    #[test]
    fn test_purge_invalidates_only_that_run() {
        tokio_test::block_on(async {
            let store = InMemoryResultStore::new();
            let a = store.put("run-1", &json!(1), JSON_CONTENT_TYPE).await.expect("put");
            let b = store.put("run-1", &json!(2), JSON_CONTENT_TYPE).await.expect("put");
            let keep = store.put("run-2", &json!(1), JSON_CONTENT_TYPE).await.expect("put");

            assert_eq!(store.purge_run("run-1").await.expect("purge"), 2);
            for gone in [&a, &b] {
                assert!(matches!(
                    store.get(gone).await,
                    Err(StoreError::ReferenceNotFound(_))
                ));
            }
            assert_eq!(store.get(&keep).await.expect("get"), json!(1));
        });
    }

    #[test]
    fn test_reference_from_other_run_does_not_resolve() {
        tokio_test::block_on(async {
            let store = InMemoryResultStore::new();
            let mut reference = store.put("run-1", &json!("x"), JSON_CONTENT_TYPE).await.expect("put");
            reference.run_id = "run-9".to_string();
            assert!(matches!(
                store.get(&reference).await,
                Err(StoreError::ReferenceNotFound(_))
            ));
        });
    }

    #[test]
    fn test_delete_is_idempotent() {
        tokio_test::block_on(async {
            let store = InMemoryResultStore::new();
            let reference = store.put("run-1", &json!([1]), JSON_CONTENT_TYPE).await.expect("put");
            store.delete(&reference).await.expect("delete");
            store.delete(&reference).await.expect("delete again");
            assert!(store.is_empty());
        });
    }
}
