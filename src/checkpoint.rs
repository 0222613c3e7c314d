//! Durable last-processed positions per partition.

use crate::error::{StoreError, StoreResult};
use crate::partition::{HubScope, PartitionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The last position durably acknowledged for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
  /// Hub and consumer group.
  pub scope: HubScope,
  /// Partition.
  pub partition_id: PartitionId,
  /// Sequence position of the last processed event.
  pub position: u64,
  /// When the checkpoint was written.
  pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
  /// Store key of this record.
  pub fn key(&self) -> String {
    self.scope.key(&self.partition_id)
  }
}

/// Durable storage for checkpoints.
///
/// Positions never move backwards. Writing the stored position again is a
/// no-op; writing a lower one fails with [`StoreError::Regression`], which
/// points at a bug in the caller and must be reported, not retried.
#[async_trait]
pub trait CheckpointStore: Send + Sync + fmt::Debug {
  /// Reads the checkpoint for a partition, `None` if it was never written.
  async fn read_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
  ) -> StoreResult<Option<CheckpointRecord>>;

  /// Records `position` as processed.
  async fn write_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
    position: u64,
  ) -> StoreResult<CheckpointRecord>;

  /// Lists every checkpoint in `scope`.
  async fn list_checkpoints(&self, scope: &HubScope) -> StoreResult<Vec<CheckpointRecord>>;
}

/// Outcome of a monotonic checkpoint update.
pub(crate) enum CheckpointUpdate {
  /// The position is already stored.
  Unchanged(CheckpointRecord),
  /// A new record must be persisted.
  Advanced(CheckpointRecord),
}

/// Monotonic update shared by the stores in this crate.
pub(crate) fn monotonic_write(
  current: Option<&CheckpointRecord>,
  scope: &HubScope,
  partition_id: &PartitionId,
  position: u64,
) -> StoreResult<CheckpointUpdate> {
  match current {
    Some(stored) if position < stored.position => Err(StoreError::Regression {
      key: scope.key(partition_id),
      stored: stored.position,
      attempted: position,
    }),
    Some(stored) if position == stored.position => Ok(CheckpointUpdate::Unchanged(stored.clone())),
    _ => Ok(CheckpointUpdate::Advanced(CheckpointRecord {
      scope: scope.clone(),
      partition_id: partition_id.clone(),
      position,
      timestamp: Utc::now(),
    })),
  }
}

/// In-memory checkpoint store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
  records: Arc<Mutex<HashMap<String, CheckpointRecord>>>,
}

impl InMemoryCheckpointStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
  async fn read_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
  ) -> StoreResult<Option<CheckpointRecord>> {
    let records = self.records.lock().await;
    Ok(records.get(&scope.key(partition_id)).cloned())
  }

  async fn write_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
    position: u64,
  ) -> StoreResult<CheckpointRecord> {
    let mut records = self.records.lock().await;
    let key = scope.key(partition_id);
    match monotonic_write(records.get(&key), scope, partition_id, position)? {
      CheckpointUpdate::Unchanged(record) => Ok(record),
      CheckpointUpdate::Advanced(record) => {
        records.insert(key, record.clone());
        Ok(record)
      }
    }
  }

  async fn list_checkpoints(&self, scope: &HubScope) -> StoreResult<Vec<CheckpointRecord>> {
    let records = self.records.lock().await;
    let mut list: Vec<CheckpointRecord> = records
      .values()
      .filter(|r| &r.scope == scope)
      .cloned()
      .collect();
    list.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
    Ok(list)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scope() -> HubScope {
    HubScope::new("usage", "$Default")
  }

  #[tokio::test]
  async fn test_missing_checkpoint_reads_none() {
    let store = InMemoryCheckpointStore::new();
    let read = store.read_checkpoint(&scope(), &PartitionId::from("0")).await.unwrap();
    assert!(read.is_none());
  }

  #[tokio::test]
  async fn test_write_is_idempotent() {
    let store = InMemoryCheckpointStore::new();
    let p = PartitionId::from("0");
    store.write_checkpoint(&scope(), &p, 100).await.unwrap();
    store.write_checkpoint(&scope(), &p, 100).await.unwrap();
    let read = store.read_checkpoint(&scope(), &p).await.unwrap().unwrap();
    assert_eq!(read.position, 100);
  }

  #[tokio::test]
  async fn test_regression_is_rejected() {
    let store = InMemoryCheckpointStore::new();
    let p = PartitionId::from("0");
    store.write_checkpoint(&scope(), &p, 100).await.unwrap();
    let err = store.write_checkpoint(&scope(), &p, 99).await.unwrap_err();
    assert!(matches!(
      err,
      StoreError::Regression {
        stored: 100,
        attempted: 99,
        ..
      }
    ));
    let read = store.read_checkpoint(&scope(), &p).await.unwrap().unwrap();
    assert_eq!(read.position, 100);
  }

  #[tokio::test]
  async fn test_advancing_and_listing() {
    let store = InMemoryCheckpointStore::new();
    store.write_checkpoint(&scope(), &PartitionId::from("1"), 5).await.unwrap();
    store.write_checkpoint(&scope(), &PartitionId::from("0"), 7).await.unwrap();
    store.write_checkpoint(&scope(), &PartitionId::from("0"), 9).await.unwrap();
    let list = store.list_checkpoints(&scope()).await.unwrap();
    let positions: Vec<(String, u64)> = list
      .into_iter()
      .map(|r| (r.partition_id.to_string(), r.position))
      .collect();
    assert_eq!(positions, vec![("0".to_string(), 9), ("1".to_string(), 5)]);
  }
}
