//! The per-partition worker.
//!
//! A worker owns one partition lease. It reads the checkpoint, then fetches
//! and dispatches batches strictly in position order, checkpointing at batch
//! boundaries, until it is told to drain, loses its lease or hits an error it
//! cannot retry:
//!
//! ```text
//! Starting -> Running -> Draining -> Stopped
//!                  \
//!                   -> Faulted -> Stopped
//! ```
//!
//! Lease renewal runs as a separate task next to the worker so that a failed
//! renewal can cancel the worker directly. The worker also renews before
//! every dispatch and every checkpoint write, so a partition taken over by
//! another instance is never processed or checkpointed here again. A lease
//! that cannot be renewed is given up one renew interval before it could
//! expire in the store.

use crate::checkpoint::CheckpointStore;
use crate::config::ProcessorOptions;
use crate::error::{ErrorAction, ErrorReport, ProcessorError, SourceError, StoreError};
use crate::handler::{EventHandler, PartitionContext, ProcessorView, WorkerState};
use crate::ownership::{OwnershipRecord, OwnershipStore};
use crate::partition::{HubScope, PartitionId};
use crate::position::ReadPosition;
use crate::source::{EventBatch, PartitionSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Everything a worker needs that is shared with the rest of its processor.
#[derive(Clone)]
pub struct WorkerEnv {
  /// Hub and consumer group.
  pub scope: HubScope,
  /// Id written into ownership records.
  pub instance_id: String,
  /// Tunables.
  pub options: ProcessorOptions,
  /// Event source.
  pub source: Arc<dyn PartitionSource>,
  /// Lease store.
  pub ownership: Arc<dyn OwnershipStore>,
  /// Checkpoint store.
  pub checkpoints: Arc<dyn CheckpointStore>,
  /// Application handler.
  pub handler: Arc<dyn EventHandler>,
  /// Status published to the application.
  pub view: ProcessorView,
  /// Error sink.
  pub reports: mpsc::UnboundedSender<ErrorReport>,
}

impl WorkerEnv {
  fn report(&self, report: ErrorReport) {
    // The receiver only goes away when the whole processor is shutting down.
    let _ = self.reports.send(report);
  }
}

/// How a worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
  /// The partition.
  pub partition_id: PartitionId,
  /// Whether the worker went through `Faulted`.
  pub faulted: bool,
  /// Whether the lease was lost to another instance or expired.
  pub lease_lost: bool,
  /// Position of the last event handed to the handler.
  pub last_dispatched: Option<u64>,
  /// Last checkpointed position.
  pub last_checkpoint: Option<u64>,
}

/// The lease shared between a worker and its renewal task.
#[derive(Debug)]
struct Lease {
  held: Mutex<Held>,
  lost: AtomicBool,
}

#[derive(Debug)]
struct Held {
  record: OwnershipRecord,
  // When the last successful renewal was sent.
  renewed_at: Instant,
}

/// Result of one renewal attempt.
#[derive(Debug)]
enum Renewal {
  Renewed,
  /// The store failed but the lease is still safely within its duration.
  Failed(StoreError),
  Lost(String),
}

impl Lease {
  fn new(record: OwnershipRecord) -> Self {
    Self {
      held: Mutex::new(Held {
        record,
        renewed_at: Instant::now(),
      }),
      lost: AtomicBool::new(false),
    }
  }

  fn is_lost(&self) -> bool {
    self.lost.load(Ordering::Acquire)
  }

  /// Marks the lease lost. Only the first caller gets `true`.
  fn lose(&self) -> bool {
    !self.lost.swap(true, Ordering::AcqRel)
  }

  async fn record(&self) -> OwnershipRecord {
    self.held.lock().await.record.clone()
  }

  /// Point after which the lease counts as lost locally: one renew interval
  /// before the store would consider it expired.
  async fn deadline(&self, options: &ProcessorOptions) -> Instant {
    self.held.lock().await.renewed_at + safe_window(options)
  }

  /// Conditionally rewrites the lease with this instance as owner.
  ///
  /// The store call is bounded by the renew interval and by the local
  /// deadline. Concurrent callers are serialised so they never conflict
  /// with each other.
  async fn renew(&self, env: &WorkerEnv) -> Renewal {
    if self.is_lost() {
      return Renewal::Lost("lease already lost".into());
    }
    let mut held = self.held.lock().await;
    let deadline = held.renewed_at + safe_window(&env.options);
    let sent = Instant::now();
    if sent >= deadline {
      return Renewal::Lost("lease not renewed in time".into());
    }

    let request = held.record.with_owner(env.instance_id.clone());
    let limit = (sent + env.options.renew_interval).min(deadline);
    let claim = env.ownership.claim_ownership(&request, held.record.version.as_ref());
    let result = tokio::time::timeout_at(limit, claim).await;
    let err = match result {
      Ok(Ok(record)) => {
        held.record = record;
        held.renewed_at = sent;
        return Renewal::Renewed;
      }
      Ok(Err(e)) if e.is_conflict() => return Renewal::Lost("claimed by another instance".into()),
      Ok(Err(e)) => e,
      Err(_) => StoreError::Unavailable(format!("lease renewal timed out after {:?}", sent.elapsed())),
    };
    if Instant::now() >= deadline {
      Renewal::Lost(format!("lease not renewed in time: {}", err))
    } else {
      Renewal::Failed(err)
    }
  }
}

fn safe_window(options: &ProcessorOptions) -> Duration {
  options.lease_duration.saturating_sub(options.renew_interval)
}

/// Error that moves a worker to `Faulted`.
#[derive(Debug)]
struct Fault {
  error: ProcessorError,
  position: Option<u64>,
}

impl From<ProcessorError> for Fault {
  fn from(error: ProcessorError) -> Self {
    Self {
      error,
      position: None,
    }
  }
}

impl From<StoreError> for Fault {
  fn from(error: StoreError) -> Self {
    ProcessorError::from(error).into()
  }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
  partition_id: PartitionId,
  cancel: CancellationToken,
  pub(crate) task: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
  /// Partition the worker processes.
  pub fn partition_id(&self) -> &PartitionId {
    &self.partition_id
  }

  /// Asks the worker to finish its in-flight batch and stop.
  pub fn drain(&self) {
    self.cancel.cancel();
  }

  /// Whether drain has been requested, by the coordinator or a lost lease.
  pub fn is_draining(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Whether the worker task has finished.
  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Waits for the worker. `None` if the task panicked or was aborted.
  pub async fn join(self) -> Option<WorkerExit> {
    self.task.await.ok()
  }
}

/// Processes one owned partition.
pub struct PartitionWorker {
  env: Arc<WorkerEnv>,
  ctx: PartitionContext,
  lease: Arc<Lease>,
  handoff: Option<Duration>,
  position: ReadPosition,
  pending: Option<u64>,
  events_since_checkpoint: usize,
  last_checkpoint_at: Instant,
  last_dispatched: Option<u64>,
  last_checkpoint: Option<u64>,
}

impl PartitionWorker {
  /// Creates a worker for a lease this instance holds.
  pub fn new(env: Arc<WorkerEnv>, lease: OwnershipRecord) -> Self {
    let ctx = PartitionContext {
      scope: env.scope.clone(),
      partition_id: lease.partition_id.clone(),
      owner_id: env.instance_id.clone(),
    };
    let position = env.options.start_position.into();
    Self {
      env,
      ctx,
      lease: Arc::new(Lease::new(lease)),
      handoff: None,
      position,
      pending: None,
      events_since_checkpoint: 0,
      last_checkpoint_at: Instant::now(),
      last_dispatched: None,
      last_checkpoint: None,
    }
  }

  /// Delays the first checkpoint read and fetch by `delay`.
  ///
  /// Used for partitions taken over from a live owner, which keeps
  /// processing until its next renewal tells it the lease is gone.
  #[must_use]
  pub fn with_handoff(mut self, delay: Duration) -> Self {
    self.handoff = Some(delay);
    self
  }

  /// The partition.
  pub fn partition_id(&self) -> &PartitionId {
    &self.ctx.partition_id
  }

  /// Runs the worker on its own task.
  pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle {
    let partition_id = self.partition_id().clone();
    self.env.view.set_state(&partition_id, WorkerState::Starting);
    let task = tokio::spawn(self.run(cancel.clone()));
    WorkerHandle {
      partition_id,
      cancel,
      task,
    }
  }

  /// Runs the worker to completion. Cancelling `cancel` drains it.
  pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
    info!(
      partition_id = %self.ctx.partition_id,
      owner_id = %self.env.instance_id,
      "partition worker starting"
    );
    self.set_state(WorkerState::Starting);

    // Renewal stops with the worker, even if the worker task is aborted.
    let stop_renewal = CancellationToken::new();
    let _renewal_guard = stop_renewal.clone().drop_guard();
    let renewal = tokio::spawn(renew_lease(
      self.env.clone(),
      self.lease.clone(),
      self.ctx.partition_id.clone(),
      stop_renewal.clone(),
      cancel.clone(),
    ));

    if let Some(delay) = self.handoff {
      debug!(partition_id = %self.ctx.partition_id, delay_ms = delay.as_millis() as u64, "waiting for previous owner");
      tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
      }
    }

    let outcome = match self.start().await {
      Ok(()) => self.process(&cancel).await,
      Err(fault) => Err(fault),
    };

    stop_renewal.cancel();
    if let Err(e) = renewal.await {
      warn!(partition_id = %self.ctx.partition_id, error = %e, "lease renewal task failed");
    }

    let faulted = match outcome {
      Ok(()) => {
        self.drain().await;
        false
      }
      Err(fault) => {
        self.fault(fault).await;
        true
      }
    };

    self.set_state(WorkerState::Stopped);
    info!(
      partition_id = %self.ctx.partition_id,
      last_checkpoint = ?self.last_checkpoint,
      "partition worker stopped"
    );
    WorkerExit {
      partition_id: self.ctx.partition_id.clone(),
      faulted,
      lease_lost: self.lease.is_lost(),
      last_dispatched: self.last_dispatched,
      last_checkpoint: self.last_checkpoint,
    }
  }

  async fn start(&mut self) -> Result<(), Fault> {
    let checkpoint = self
      .env
      .checkpoints
      .read_checkpoint(&self.env.scope, &self.ctx.partition_id)
      .await?;
    match checkpoint {
      Some(record) => {
        self.position = ReadPosition::after(record.position);
        self.last_checkpoint = Some(record.position);
        self
          .env
          .view
          .update(&self.ctx.partition_id, |s| s.last_checkpoint = Some(record.position));
      }
      None => self.position = self.env.options.start_position.into(),
    }
    debug!(partition_id = %self.ctx.partition_id, position = %self.position, "resuming");
    Ok(())
  }

  async fn process(&mut self, cancel: &CancellationToken) -> Result<(), Fault> {
    if cancel.is_cancelled() {
      return Ok(());
    }
    self.set_state(WorkerState::Running);

    while !cancel.is_cancelled() {
      let Some(batch) = self.fetch(cancel).await? else {
        break;
      };

      if !batch.is_empty() {
        if !self.hold_lease().await {
          break;
        }
        trace!(
          partition_id = %self.ctx.partition_id,
          first = ?batch.first_position(),
          last = ?batch.last_position(),
          "dispatching batch"
        );
        if !self.dispatch(&batch, cancel).await? {
          break;
        }
        if let Some(last) = batch.last_position() {
          self.pending = Some(last);
          self.last_dispatched = Some(last);
          self.events_since_checkpoint += batch.len();
          self.env.view.update(&self.ctx.partition_id, |s| s.last_dispatched = Some(last));
        }
      }
      self.position = batch.next_position;

      let elapsed = self.last_checkpoint_at.elapsed();
      if self
        .env
        .options
        .checkpoint_policy
        .is_due(self.events_since_checkpoint, elapsed)
      {
        self.checkpoint().await;
      }
    }
    Ok(())
  }

  /// Fetches the next batch, retrying transient failures. `None` once cancelled.
  async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<EventBatch>, Fault> {
    let options = &self.env.options;
    let retry = options.source_retry;
    let mut attempt = 0u32;
    loop {
      attempt += 1;
      let fetch = self.env.source.fetch(
        &self.ctx.partition_id,
        self.position,
        options.max_batch_size,
        options.max_wait_time,
      );
      let result = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        result = tokio::time::timeout(options.fetch_timeout, fetch) => result,
      };
      let err = match result {
        Ok(Ok(batch)) => return Ok(Some(batch)),
        Ok(Err(e)) if !e.is_transient() => {
          return Err(ProcessorError::PermanentSource(e).into());
        }
        Ok(Err(e)) => e,
        Err(_) => SourceError::Transient(format!("fetch timed out after {:?}", options.fetch_timeout)),
      };

      if attempt >= retry.max_attempts {
        return Err(
          ProcessorError::TransientSource {
            attempts: attempt,
            last: err,
          }
          .into(),
        );
      }
      let delay = retry.backoff(attempt);
      warn!(
        partition_id = %self.ctx.partition_id,
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "transient source error, retrying"
      );
      tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }

  /// Hands a batch to the handler under the configured failure policy.
  ///
  /// Returns `false` if the batch was abandoned because the worker is
  /// draining; it is then neither counted as processed nor checkpointed.
  async fn dispatch(&self, batch: &EventBatch, cancel: &CancellationToken) -> Result<bool, Fault> {
    let mut retries = 0;
    loop {
      let err = match self.env.handler.on_events(&self.ctx, batch).await {
        Ok(()) => return Ok(true),
        Err(e) => e,
      };
      let position = err.position.or(batch.first_position());
      match self.env.options.handler_policy.decide(&err, retries) {
        ErrorAction::Skip => {
          warn!(
            partition_id = %self.ctx.partition_id,
            position = ?position,
            error = %err,
            "handler failed, skipping batch"
          );
          self.env.report(ErrorReport::partition(self.ctx.partition_id.clone(), err).at(position));
          return Ok(true);
        }
        ErrorAction::Retry => {
          retries += 1;
          warn!(
            partition_id = %self.ctx.partition_id,
            position = ?position,
            retry = retries,
            error = %err,
            "handler failed, retrying batch"
          );
          self.env.report(ErrorReport::partition(self.ctx.partition_id.clone(), err).at(position));
          if cancel.is_cancelled() {
            return Ok(false);
          }
        }
        ErrorAction::Stop => {
          return Err(Fault {
            error: err.into(),
            position,
          });
        }
      }
    }
  }

  /// Writes the pending checkpoint, if any.
  async fn checkpoint(&mut self) {
    let Some(position) = self.pending else {
      return;
    };
    if !self.hold_lease().await {
      return;
    }
    let result = self
      .env
      .checkpoints
      .write_checkpoint(&self.env.scope, &self.ctx.partition_id, position)
      .await;
    match result {
      Ok(_) => {
        debug!(partition_id = %self.ctx.partition_id, position = position, "checkpoint written");
        self.last_checkpoint = Some(position);
        self.env.view.update(&self.ctx.partition_id, |s| s.last_checkpoint = Some(position));
        self.reset_checkpoint_progress();
      }
      Err(e @ StoreError::Regression { .. }) => {
        error!(partition_id = %self.ctx.partition_id, error = %e, "checkpoint regression");
        self.env.report(ErrorReport::partition(self.ctx.partition_id.clone(), e).at(Some(position)));
        // A higher position is already stored; retrying this one can never succeed.
        self.reset_checkpoint_progress();
      }
      Err(e) => {
        warn!(partition_id = %self.ctx.partition_id, error = %e, "checkpoint write failed");
        self.env.report(ErrorReport::partition(self.ctx.partition_id.clone(), e).at(Some(position)));
      }
    }
  }

  fn reset_checkpoint_progress(&mut self) {
    self.pending = None;
    self.events_since_checkpoint = 0;
    self.last_checkpoint_at = Instant::now();
  }

  async fn drain(&mut self) {
    self.set_state(WorkerState::Draining);
    if self.lease.is_lost() {
      info!(partition_id = %self.ctx.partition_id, "lease lost, stopping without checkpoint");
      return;
    }
    info!(partition_id = %self.ctx.partition_id, "draining partition");
    self.checkpoint().await;
    self.release().await;
  }

  async fn fault(&mut self, fault: Fault) {
    self.set_state(WorkerState::Faulted);
    error!(
      partition_id = %self.ctx.partition_id,
      position = ?fault.position,
      error = %fault.error,
      "partition worker faulted"
    );
    if !self.lease.is_lost() {
      self.checkpoint().await;
      self.release().await;
    }
    self.env.report(
      ErrorReport::partition(self.ctx.partition_id.clone(), fault.error)
        .at(fault.position)
        .faulted(),
    );
  }

  /// Renews the lease before touching the partition. `false` once it is lost.
  async fn hold_lease(&self) -> bool {
    match self.lease.renew(&self.env).await {
      Renewal::Renewed => true,
      Renewal::Failed(e) => {
        warn!(partition_id = %self.ctx.partition_id, error = %e, "lease renewal failed");
        self.env.report(ErrorReport::partition(self.ctx.partition_id.clone(), e));
        true
      }
      Renewal::Lost(reason) => {
        lease_lost(&self.env, &self.lease, &self.ctx.partition_id, reason);
        false
      }
    }
  }

  async fn release(&self) {
    let record = self.lease.record().await;
    match self
      .env
      .ownership
      .claim_ownership(&record.released(), record.version.as_ref())
      .await
    {
      Ok(_) => debug!(partition_id = %self.ctx.partition_id, "lease released"),
      Err(e) if e.is_conflict() => {
        debug!(partition_id = %self.ctx.partition_id, "lease already taken over");
      }
      Err(e) => {
        warn!(partition_id = %self.ctx.partition_id, error = %e, "lease release failed, leaving it to expire");
      }
    }
  }

  fn set_state(&self, state: WorkerState) {
    self.env.view.set_state(&self.ctx.partition_id, state);
  }
}

/// Renews the lease every `renew_interval` until stopped.
///
/// A conflict means another instance now owns the partition; so does a lease
/// that could not be renewed before its local deadline. Either way the
/// worker is cancelled and told not to touch the partition's records again.
async fn renew_lease(
  env: Arc<WorkerEnv>,
  lease: Arc<Lease>,
  partition_id: PartitionId,
  stop: CancellationToken,
  worker: CancellationToken,
) {
  let period = env.options.renew_interval;
  let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    let deadline = lease.deadline(&env.options).await;
    tokio::select! {
      _ = stop.cancelled() => return,
      _ = ticker.tick() => {}
      _ = tokio::time::sleep_until(deadline) => {}
    }

    match lease.renew(&env).await {
      Renewal::Renewed => trace!(partition_id = %partition_id, "lease renewed"),
      Renewal::Failed(e) => {
        warn!(partition_id = %partition_id, error = %e, "lease renewal failed");
        env.report(ErrorReport::partition(partition_id.clone(), e));
      }
      Renewal::Lost(reason) => {
        lease_lost(&env, &lease, &partition_id, reason);
        worker.cancel();
        return;
      }
    }
  }
}

fn lease_lost(env: &WorkerEnv, lease: &Lease, partition_id: &PartitionId, reason: String) {
  if !lease.lose() {
    return;
  }
  warn!(partition_id = %partition_id, reason = %reason, "lease lost");
  env.report(ErrorReport::partition(
    partition_id.clone(),
    ProcessorError::LeaseLost {
      partition_id: partition_id.clone(),
      reason,
    },
  ));
}
