//! The application-facing surface: the [`EventHandler`] trait and the
//! read-only [`ProcessorView`] a handler may be given at construction to
//! query ownership and positions.

use crate::error::{ErrorReport, HandlerError};
use crate::partition::{HubScope, PartitionId};
use crate::source::{Event, EventBatch};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Where a batch came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
  /// Hub and consumer group.
  pub scope: HubScope,
  /// Partition the batch belongs to.
  pub partition_id: PartitionId,
  /// Instance processing the partition.
  pub owner_id: String,
}

/// Receives events and errors from a running processor.
///
/// Implement [`on_event`](Self::on_event) for per-event processing, or
/// override [`on_events`](Self::on_events) to handle a whole batch at once.
/// Either way events of one partition arrive strictly in position order and
/// never concurrently; different partitions are dispatched in parallel.
#[async_trait]
pub trait EventHandler: Send + Sync {
  /// Processes one event.
  async fn on_event(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError>;

  /// Processes a batch. The default calls [`on_event`](Self::on_event) for
  /// each event in order and stops at the first failure, attributing it to
  /// that event's position.
  async fn on_events(&self, ctx: &PartitionContext, batch: &EventBatch) -> Result<(), HandlerError> {
    for event in &batch.events {
      self.on_event(ctx, event).await.map_err(|e| match e.position {
        Some(_) => e,
        None => e.at(event.position),
      })?;
    }
    Ok(())
  }

  /// Receives every error reported by the processor, one at a time.
  async fn on_error(&self, _report: &ErrorReport) {}
}

/// Lifecycle state of a partition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
  /// Reading the checkpoint.
  Starting,
  /// Fetching and dispatching batches.
  Running,
  /// Finishing the in-flight batch before stopping.
  Draining,
  /// Stopped after a non-retryable error.
  Faulted,
  /// Finished.
  Stopped,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      WorkerState::Starting => "starting",
      WorkerState::Running => "running",
      WorkerState::Draining => "draining",
      WorkerState::Faulted => "faulted",
      WorkerState::Stopped => "stopped",
    };
    f.write_str(s)
  }
}

/// Snapshot of one partition as seen by this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
  /// Worker state.
  pub state: WorkerState,
  /// Position of the last event handed to the handler.
  pub last_dispatched: Option<u64>,
  /// Last checkpointed position this instance knows of.
  pub last_checkpoint: Option<u64>,
}

/// Read-only view of what this instance owns and how far it has got.
///
/// Cloning is cheap; all clones observe the same processor. Only the
/// processor itself updates the view.
#[derive(Debug, Clone)]
pub struct ProcessorView {
  instance_id: Arc<str>,
  partitions: Arc<RwLock<BTreeMap<PartitionId, PartitionStatus>>>,
}

impl ProcessorView {
  /// Creates an empty view for `instance_id`.
  pub fn new(instance_id: impl Into<String>) -> Self {
    Self {
      instance_id: Arc::from(instance_id.into()),
      partitions: Arc::default(),
    }
  }

  /// Id of the instance this view observes.
  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// Partitions with a live worker, in ascending order.
  pub fn owned_partitions(&self) -> Vec<PartitionId> {
    self
      .read()
      .iter()
      .filter(|(_, s)| matches!(s.state, WorkerState::Starting | WorkerState::Running))
      .map(|(p, _)| p.clone())
      .collect()
  }

  /// Status of one partition, if this instance has worked on it.
  pub fn status(&self, partition_id: &PartitionId) -> Option<PartitionStatus> {
    self.read().get(partition_id).cloned()
  }

  /// Last checkpointed position of a partition, as seen by this instance.
  pub fn checkpoint_position(&self, partition_id: &PartitionId) -> Option<u64> {
    self.read().get(partition_id).and_then(|s| s.last_checkpoint)
  }

  /// All known partitions.
  pub fn snapshot(&self) -> BTreeMap<PartitionId, PartitionStatus> {
    self.read().clone()
  }

  fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<PartitionId, PartitionStatus>> {
    self.partitions.read().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn update<F>(&self, partition_id: &PartitionId, f: F)
  where
    F: FnOnce(&mut PartitionStatus),
  {
    let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
    let status = partitions.entry(partition_id.clone()).or_insert(PartitionStatus {
      state: WorkerState::Starting,
      last_dispatched: None,
      last_checkpoint: None,
    });
    f(status);
  }

  pub(crate) fn set_state(&self, partition_id: &PartitionId, state: WorkerState) {
    self.update(partition_id, |s| s.state = state);
  }
}
