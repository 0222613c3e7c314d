//! Partition lease records and the store that arbitrates them.
//!
//! Mutual exclusion between processors comes entirely from
//! [`OwnershipStore::claim_ownership`]: a conditional write that succeeds only
//! when the caller's expected version matches the stored one. Releasing a
//! partition is a claim with an empty owner id; records are never deleted.

use crate::error::{StoreError, StoreResult};
use crate::partition::{HubScope, PartitionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Opaque version of a stored record, replaced on every successful write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
  /// Creates a token from a raw value.
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  /// Generates a fresh random token.
  pub fn generate() -> Self {
    Self(format!("{:016x}", rand::random::<u64>()))
  }

  /// Returns the raw value.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for VersionToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A lease on one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
  /// Hub and consumer group.
  pub scope: HubScope,
  /// Leased partition.
  pub partition_id: PartitionId,
  /// Owning instance; empty when released.
  pub owner_id: String,
  /// Version assigned by the store; `None` for records never written.
  pub version: Option<VersionToken>,
  /// Store time of the last successful write.
  pub last_modified: DateTime<Utc>,
}

impl OwnershipRecord {
  /// A claim request for `partition_id` by `owner_id`.
  pub fn claim(scope: HubScope, partition_id: PartitionId, owner_id: impl Into<String>) -> Self {
    Self {
      scope,
      partition_id,
      owner_id: owner_id.into(),
      version: None,
      last_modified: DateTime::<Utc>::UNIX_EPOCH,
    }
  }

  /// Store key of this record.
  pub fn key(&self) -> String {
    self.scope.key(&self.partition_id)
  }

  /// The same record with a different owner, keeping the version for a
  /// conditional write.
  #[must_use]
  pub fn with_owner(&self, owner_id: impl Into<String>) -> Self {
    Self {
      owner_id: owner_id.into(),
      ..self.clone()
    }
  }

  /// The same record with the owner cleared.
  #[must_use]
  pub fn released(&self) -> Self {
    self.with_owner(String::new())
  }

  /// Whether some instance holds this lease.
  pub fn has_owner(&self) -> bool {
    !self.owner_id.is_empty()
  }

  /// Whether the lease was written within `lease_duration` of `now`.
  pub fn is_fresh(&self, now: DateTime<Utc>, lease_duration: Duration) -> bool {
    let age = now.signed_duration_since(self.last_modified);
    match chrono::Duration::from_std(lease_duration) {
      Ok(lease) => age < lease,
      Err(_) => true,
    }
  }

  /// Whether the lease is owned and unexpired.
  pub fn is_active(&self, now: DateTime<Utc>, lease_duration: Duration) -> bool {
    self.has_owner() && self.is_fresh(now, lease_duration)
  }

  /// Whether `owner_id` holds an unexpired lease.
  pub fn is_owned_by(&self, owner_id: &str, now: DateTime<Utc>, lease_duration: Duration) -> bool {
    self.owner_id == owner_id && self.is_active(now, lease_duration)
  }
}

/// Durable, versioned storage for ownership records.
#[async_trait]
pub trait OwnershipStore: Send + Sync + fmt::Debug {
  /// Lists every ownership record in `scope`.
  async fn list_ownership(&self, scope: &HubScope) -> StoreResult<Vec<OwnershipRecord>>;

  /// Writes `record` if the stored version equals `expected`.
  ///
  /// `expected = None` creates the record only if none exists. Any mismatch
  /// fails with [`StoreError::Conflict`]. On success the stored record is
  /// returned with its new version and modification time.
  async fn claim_ownership(
    &self,
    record: &OwnershipRecord,
    expected: Option<&VersionToken>,
  ) -> StoreResult<OwnershipRecord>;
}

/// In-memory ownership store.
///
/// Clones share state, so several processors can contend over one instance
/// the way separate hosts contend over a real store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOwnershipStore {
  records: Arc<Mutex<HashMap<String, OwnershipRecord>>>,
}

impl InMemoryOwnershipStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts a record as-is, bypassing version checks.
  pub async fn seed(&self, record: OwnershipRecord) {
    self.records.lock().await.insert(record.key(), record);
  }
}

/// Compare-and-swap shared by the stores in this crate.
pub(crate) fn conditional_write(
  current: Option<&OwnershipRecord>,
  record: &OwnershipRecord,
  expected: Option<&VersionToken>,
) -> StoreResult<OwnershipRecord> {
  let current_version = current.and_then(|r| r.version.as_ref());
  let matches = match (current, expected) {
    (None, None) => true,
    (Some(_), Some(expected)) => current_version == Some(expected),
    _ => false,
  };
  if !matches {
    return Err(StoreError::Conflict { key: record.key() });
  }
  Ok(OwnershipRecord {
    version: Some(VersionToken::generate()),
    last_modified: Utc::now(),
    ..record.clone()
  })
}

#[async_trait]
impl OwnershipStore for InMemoryOwnershipStore {
  async fn list_ownership(&self, scope: &HubScope) -> StoreResult<Vec<OwnershipRecord>> {
    let records = self.records.lock().await;
    let mut list: Vec<OwnershipRecord> = records
      .values()
      .filter(|r| &r.scope == scope)
      .cloned()
      .collect();
    list.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
    Ok(list)
  }

  async fn claim_ownership(
    &self,
    record: &OwnershipRecord,
    expected: Option<&VersionToken>,
  ) -> StoreResult<OwnershipRecord> {
    let mut records = self.records.lock().await;
    let key = record.key();
    let written = conditional_write(records.get(&key), record, expected)?;
    records.insert(key, written.clone());
    Ok(written)
  }
}
