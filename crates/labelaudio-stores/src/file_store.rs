//! File-backed ResultStore

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use labelaudio_core::store::{content_hash, encode_payload, ResultRef, ResultStore, StoreError};

#[derive(Serialize, Deserialize)]
struct Envelope {
    content_type: String,
    payload: Value,
}

/// Stores each payload at `{root}/{run_id}/{hash}.json`.
///
/// Writes go to a temp file first and are renamed into place, so a reader
/// never observes a partial payload and identical concurrent writes settle
/// on the same file.
pub struct FileResultStore {
    root_dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileResultStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Ids become path components; anything that could escape the root is
    /// refused.
    fn ensure_safe_component(kind: &str, value: &str) -> Result<(), StoreError> {
        let valid = !value.is_empty()
            && value != "."
            && value != ".."
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(StoreError::Io(format!("unsafe {} '{}'", kind, value)))
        }
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        Self::ensure_safe_component("run id", run_id)?;
        Ok(self.root_dir.join(run_id))
    }

    fn entry_path(&self, run_id: &str, ref_id: &str) -> Result<PathBuf, StoreError> {
        Self::ensure_safe_component("ref id", ref_id)?;
        Ok(self.run_dir(run_id)?.join(format!("{}.json", ref_id)))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn put(
        &self,
        run_id: &str,
        payload: &Value,
        content_type: &str,
    ) -> Result<ResultRef, StoreError> {
        let bytes = encode_payload(payload)?;
        let hash = content_hash(run_id, &bytes);
        let path = self.entry_path(run_id, &hash)?;

        if tokio::fs::metadata(&path).await.is_err() {
            let dir = self.run_dir(run_id)?;
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
            let envelope = serde_json::to_vec(&Envelope {
                content_type: content_type.to_string(),
                payload: payload.clone(),
            })?;
            let tmp = dir.join(format!(
                ".{}.{}.{}.tmp",
                hash,
                std::process::id(),
                self.tmp_counter.fetch_add(1, Ordering::Relaxed)
            ));
            tokio::fs::write(&tmp, &envelope)
                .await
                .map_err(|e| io_error(&tmp, e))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| io_error(&path, e))?;
            tracing::debug!(run_id = %run_id, path = %path.display(), "payload stored");
        }

        Ok(ResultRef {
            ref_id: hash,
            run_id: run_id.to_string(),
            location: path.display().to_string(),
            size_bytes: bytes.len() as u64,
            content_type: content_type.to_string(),
        })
    }

    async fn get(&self, reference: &ResultRef) -> Result<Value, StoreError> {
        let path = self.entry_path(&reference.run_id, &reference.ref_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ReferenceNotFound(reference.summary()));
            }
            Err(err) => return Err(io_error(&path, err)),
        };
        let envelope: Envelope = serde_json::from_slice(&raw)?;
        Ok(envelope.payload)
    }

    async fn delete(&self, reference: &ResultRef) -> Result<(), StoreError> {
        let path = self.entry_path(&reference.run_id, &reference.ref_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn purge_run(&self, run_id: &str) -> Result<usize, StoreError> {
        let dir = self.run_dir(run_id)?;
        let mut listing = match tokio::fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_error(&dir, err)),
        };
        let mut count = 0;
        while let Some(entry) = listing.next_entry().await.map_err(|e| io_error(&dir, e))? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        tracing::debug!(run_id = %run_id, dropped = count, "run purged from file store");
        Ok(count)
    }
}
