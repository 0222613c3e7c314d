//! Read positions within a partition and the policies that decide where a
//! worker starts and how often it checkpoints.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::Duration;

/// Where a fetch reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReadPosition {
  /// The oldest event still retained by the partition.
  #[default]
  Earliest,
  /// Only events enqueued after the read is first issued.
  Latest,
  /// The first event whose sequence position is at least this value.
  Sequence(u64),
}

impl Display for ReadPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReadPosition::Sequence(n) => write!(f, "seq:{}", n),
      ReadPosition::Earliest => write!(f, "earliest"),
      ReadPosition::Latest => write!(f, "latest"),
    }
  }
}

impl ReadPosition {
  /// The position immediately after a checkpointed (already processed) event.
  ///
  /// Saturates at `u64::MAX`, the last addressable position.
  pub fn after(position: u64) -> Self {
    ReadPosition::Sequence(position.saturating_add(1))
  }

  /// Returns the sequence value for resolved positions.
  pub fn sequence(&self) -> Option<u64> {
    match self {
      ReadPosition::Sequence(n) => Some(*n),
      _ => None,
    }
  }
}

/// Where a partition starts when it has no checkpoint yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
  /// Start from the earliest retained event.
  #[default]
  Earliest,
  /// Start from events enqueued after the worker starts.
  Latest,
}

impl From<StartPosition> for ReadPosition {
  fn from(start: StartPosition) -> Self {
    match start {
      StartPosition::Earliest => ReadPosition::Earliest,
      StartPosition::Latest => ReadPosition::Latest,
    }
  }
}

/// When a worker writes a checkpoint.
///
/// Checkpoints are only ever written at batch boundaries; the thresholds of
/// [`CheckpointPolicy::Periodic`] are evaluated after each completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
  /// Checkpoint after every completed batch.
  #[default]
  EveryBatch,
  /// Checkpoint once either threshold is reached.
  Periodic {
    /// Events processed since the last checkpoint.
    events: usize,
    /// Time since the last checkpoint.
    interval: Duration,
  },
}

impl CheckpointPolicy {
  /// Whether a checkpoint is due given progress since the last one.
  pub fn is_due(&self, events_since: usize, elapsed: Duration) -> bool {
    match self {
      CheckpointPolicy::EveryBatch => events_since > 0,
      CheckpointPolicy::Periodic { events, interval } => {
        events_since > 0 && (events_since >= *events || elapsed >= *interval)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_read_position_display() {
    assert_eq!(ReadPosition::Sequence(42).to_string(), "seq:42");
    assert_eq!(ReadPosition::Earliest.to_string(), "earliest");
    assert_eq!(ReadPosition::Latest.to_string(), "latest");
  }

  #[test]
  fn test_read_position_after_checkpoint() {
    assert_eq!(ReadPosition::after(99), ReadPosition::Sequence(100));
    assert_eq!(ReadPosition::after(99).sequence(), Some(100));
    assert_eq!(ReadPosition::Latest.sequence(), None);
  }

  #[test]
  fn test_read_position_after_last_position_saturates() {
    assert_eq!(ReadPosition::after(u64::MAX), ReadPosition::Sequence(u64::MAX));
  }

  #[test]
  fn test_start_position_conversion() {
    assert_eq!(ReadPosition::from(StartPosition::Earliest), ReadPosition::Earliest);
    assert_eq!(ReadPosition::from(StartPosition::Latest), ReadPosition::Latest);
    assert_eq!(StartPosition::default(), StartPosition::Earliest);
  }

  #[test]
  fn test_every_batch_policy() {
    let policy = CheckpointPolicy::EveryBatch;
    assert!(policy.is_due(1, Duration::ZERO));
    assert!(!policy.is_due(0, Duration::from_secs(60)));
  }

  #[test]
  fn test_periodic_policy_thresholds() {
    let policy = CheckpointPolicy::Periodic {
      events: 10,
      interval: Duration::from_secs(5),
    };
    assert!(!policy.is_due(3, Duration::from_secs(1)));
    assert!(policy.is_due(10, Duration::from_secs(1)));
    assert!(policy.is_due(3, Duration::from_secs(5)));
    assert!(!policy.is_due(0, Duration::from_secs(5)));
  }
}
