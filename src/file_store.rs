//! File-backed ownership and checkpoint store.
//!
//! Records are JSON files under a container directory:
//!
//! ```text
//! <container>/ownership/<consumer_group>/<hub>/<partition>.json
//! <container>/checkpoint/<consumer_group>/<hub>/<partition>.json
//! ```
//!
//! Each write goes to a temporary file that is then renamed over the target.
//! Conditional writes are serialised by an in-process lock, so the store is
//! safe for any number of processors in one process sharing a container.

use crate::checkpoint::{CheckpointRecord, CheckpointStore, CheckpointUpdate, monotonic_write};
use crate::error::{StoreError, StoreResult};
use crate::ownership::{OwnershipRecord, OwnershipStore, VersionToken, conditional_write};
use crate::partition::{HubScope, Namespace, PartitionId};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::trace;

/// Durable store keeping both namespaces in one container directory.
#[derive(Debug, Clone)]
pub struct FileStore {
  root: PathBuf,
  write_lock: Arc<Mutex<()>>,
}

impl FileStore {
  /// Opens (or lazily creates) a store rooted at `container`.
  pub fn new<P: AsRef<Path>>(container: P) -> Self {
    Self {
      root: container.as_ref().to_path_buf(),
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  /// Returns the container directory.
  pub fn path(&self) -> &Path {
    &self.root
  }

  fn scope_dir(&self, namespace: Namespace, scope: &HubScope) -> PathBuf {
    self
      .root
      .join(namespace.as_str())
      .join(sanitize(&scope.consumer_group))
      .join(sanitize(&scope.hub_name))
  }

  fn record_path(&self, namespace: Namespace, scope: &HubScope, partition_id: &PartitionId) -> PathBuf {
    self
      .scope_dir(namespace, scope)
      .join(format!("{}.json", sanitize(partition_id.as_str())))
  }

  async fn read_record<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path).await {
      Ok(data) => serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    trace!(path = %path.display(), "record written");
    Ok(())
  }

  async fn list_records<T: DeserializeOwned>(&self, dir: &Path) -> StoreResult<Vec<T>> {
    let mut entries = match fs::read_dir(dir).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().is_some_and(|e| e == "json") {
        if let Some(record) = self.read_record(&path).await? {
          records.push(record);
        }
      }
    }
    Ok(records)
  }
}

// Partition ids and group names become path components.
fn sanitize(component: &str) -> String {
  component
    .chars()
    .map(|c| match c {
      '/' | '\\' | ':' | '\0' => '_',
      c => c,
    })
    .collect()
}

#[async_trait]
impl OwnershipStore for FileStore {
  async fn list_ownership(&self, scope: &HubScope) -> StoreResult<Vec<OwnershipRecord>> {
    let mut records: Vec<OwnershipRecord> = self
      .list_records(&self.scope_dir(Namespace::Ownership, scope))
      .await?;
    records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
    Ok(records)
  }

  async fn claim_ownership(
    &self,
    record: &OwnershipRecord,
    expected: Option<&VersionToken>,
  ) -> StoreResult<OwnershipRecord> {
    let _guard = self.write_lock.lock().await;
    let path = self.record_path(Namespace::Ownership, &record.scope, &record.partition_id);
    let current: Option<OwnershipRecord> = self.read_record(&path).await?;
    let written = conditional_write(current.as_ref(), record, expected)?;
    self.write_record(&path, &written).await?;
    Ok(written)
  }
}

#[async_trait]
impl CheckpointStore for FileStore {
  async fn read_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
  ) -> StoreResult<Option<CheckpointRecord>> {
    self
      .read_record(&self.record_path(Namespace::Checkpoint, scope, partition_id))
      .await
  }

  async fn write_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
    position: u64,
  ) -> StoreResult<CheckpointRecord> {
    let _guard = self.write_lock.lock().await;
    let path = self.record_path(Namespace::Checkpoint, scope, partition_id);
    let current: Option<CheckpointRecord> = self.read_record(&path).await?;
    match monotonic_write(current.as_ref(), scope, partition_id, position)? {
      CheckpointUpdate::Unchanged(record) => Ok(record),
      CheckpointUpdate::Advanced(record) => {
        self.write_record(&path, &record).await?;
        Ok(record)
      }
    }
  }

  async fn list_checkpoints(&self, scope: &HubScope) -> StoreResult<Vec<CheckpointRecord>> {
    let mut records: Vec<CheckpointRecord> = self
      .list_records(&self.scope_dir(Namespace::Checkpoint, scope))
      .await?;
    records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
    Ok(records)
  }
}
