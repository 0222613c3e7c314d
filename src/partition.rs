//! Identity types shared by every layer: partitions, hub scope, consumer
//! instances and the key layout used by the durable stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display};

/// Consumer group used when none is configured.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Identifier of a partition within an event hub.
///
/// Partition ids are opaque strings. Integer ids sort numerically (so
/// `"2" < "10"`) and before every non-integer id, which sort
/// lexicographically. The load balancer relies on this for its
/// deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
  /// Creates a partition id.
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Returns the id as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl PartitionId {
  fn sort_key(&self) -> (bool, u64, &str) {
    match self.0.parse::<u64>() {
      Ok(n) => (false, n, &self.0),
      Err(_) => (true, 0, &self.0),
    }
  }
}

impl Ord for PartitionId {
  fn cmp(&self, other: &Self) -> Ordering {
    self.sort_key().cmp(&other.sort_key())
  }
}

impl PartialOrd for PartitionId {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Display for PartitionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for PartitionId {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for PartitionId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<u32> for PartitionId {
  fn from(n: u32) -> Self {
    Self(n.to_string())
  }
}

/// The hub and consumer group a set of records belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HubScope {
  /// Event hub name.
  pub hub_name: String,
  /// Consumer group name.
  pub consumer_group: String,
}

impl HubScope {
  /// Creates a scope.
  pub fn new(hub_name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
    Self {
      hub_name: hub_name.into(),
      consumer_group: consumer_group.into(),
    }
  }

  /// Store key for a partition in this scope: `{consumer_group}/{hub_name}/{partition}`.
  pub fn key(&self, partition_id: &PartitionId) -> String {
    format!("{}/{}/{}", self.consumer_group, self.hub_name, partition_id)
  }
}

impl Display for HubScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.consumer_group, self.hub_name)
  }
}

/// Logical namespaces records are stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
  /// Partition lease records.
  Ownership,
  /// Last-processed position records.
  Checkpoint,
}

impl Namespace {
  /// Directory/prefix name of the namespace.
  pub fn as_str(self) -> &'static str {
    match self {
      Namespace::Ownership => "ownership",
      Namespace::Checkpoint => "checkpoint",
    }
  }
}

/// Ephemeral identity of one running processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInstance {
  /// Owner id written into ownership records.
  pub instance_id: String,
  /// When this instance was created.
  pub joined_at: DateTime<Utc>,
}

impl ConsumerInstance {
  /// Creates an instance with a random id.
  pub fn generate() -> Self {
    Self::with_id(format!("{:016x}", rand::random::<u64>()))
  }

  /// Creates an instance with a fixed id.
  pub fn with_id(instance_id: impl Into<String>) -> Self {
    Self {
      instance_id: instance_id.into(),
      joined_at: Utc::now(),
    }
  }
}
