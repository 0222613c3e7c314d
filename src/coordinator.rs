//! Runs one consumer-group member: the rebalance loop, the set of live
//! partition workers and the error sink.
//!
//! Each tick reaps finished workers, runs a balancing cycle, starts workers
//! for newly owned partitions and drains workers whose partitions are no
//! longer owned. Errors from every worker flow through one channel and are
//! handed to [`EventHandler::on_error`] one at a time, so the handler never
//! sees concurrent error callbacks.

use crate::balancer::LoadBalancer;
use crate::checkpoint::CheckpointStore;
use crate::config::ProcessorConfig;
use crate::error::{ErrorReport, ProcessorError};
use crate::handler::{EventHandler, ProcessorView};
use crate::ownership::{OwnershipRecord, OwnershipStore};
use crate::partition::{ConsumerInstance, HubScope, PartitionId};
use crate::source::PartitionSource;
use crate::worker::{PartitionWorker, WorkerEnv, WorkerHandle};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one reconciliation tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
  /// Partitions whose workers were started.
  pub started: Vec<PartitionId>,
  /// Partitions whose workers were asked to drain.
  pub drained: Vec<PartitionId>,
  /// Partitions owned after the tick.
  pub owned: Vec<PartitionId>,
}

/// One member of a consumer group.
pub struct ConsumerGroupCoordinator {
  instance: ConsumerInstance,
  scope: HubScope,
  env: Arc<WorkerEnv>,
  balancer: LoadBalancer,
  workers: HashMap<PartitionId, WorkerHandle>,
  reports: mpsc::UnboundedReceiver<ErrorReport>,
}

impl ConsumerGroupCoordinator {
  /// Creates a coordinator.
  ///
  /// The instance id is taken from `view`, which is the same view the
  /// application may have handed to `handler`.
  pub fn new(
    config: ProcessorConfig,
    view: ProcessorView,
    source: Arc<dyn PartitionSource>,
    ownership: Arc<dyn OwnershipStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    handler: Arc<dyn EventHandler>,
  ) -> Result<Self, ProcessorError> {
    config.options.validate()?;
    let instance = ConsumerInstance::with_id(view.instance_id());
    let (tx, reports) = mpsc::unbounded_channel();
    let balancer = LoadBalancer::new(
      instance.instance_id.clone(),
      config.scope.clone(),
      config.options.lease_duration,
      ownership.clone(),
      source.clone(),
    );
    let env = Arc::new(WorkerEnv {
      scope: config.scope.clone(),
      instance_id: instance.instance_id.clone(),
      options: config.options,
      source,
      ownership,
      checkpoints,
      handler,
      view,
      reports: tx,
    });
    Ok(Self {
      instance,
      scope: config.scope,
      env,
      balancer,
      workers: HashMap::new(),
      reports,
    })
  }

  /// Id of this instance.
  pub fn instance_id(&self) -> &str {
    &self.instance.instance_id
  }

  /// Ownership and position view of this instance.
  pub fn view(&self) -> ProcessorView {
    self.env.view.clone()
  }

  /// Partitions with a worker that has not finished yet.
  pub fn live_partitions(&self) -> Vec<PartitionId> {
    let mut live: Vec<PartitionId> = self
      .workers
      .iter()
      .filter(|(_, w)| !w.is_finished())
      .map(|(p, _)| p.clone())
      .collect();
    live.sort();
    live
  }

  /// Runs one reconciliation: reap, balance, start and drain workers.
  pub async fn tick(&mut self) -> Result<TickOutcome, ProcessorError> {
    self.reap().await;

    let live: HashSet<PartitionId> = self.workers.keys().cloned().collect();
    let rebalance = self.balancer.rebalance(&live).await?;
    let desired: HashSet<PartitionId> = rebalance.owned.iter().map(|r| r.partition_id.clone()).collect();

    let mut outcome = TickOutcome::default();
    for (partition_id, worker) in &self.workers {
      if !desired.contains(partition_id) && !worker.is_draining() {
        info!(partition_id = %partition_id, owner_id = %self.instance.instance_id, "partition no longer owned, draining");
        worker.drain();
        outcome.drained.push(partition_id.clone());
      }
    }

    // Released partitions nobody is working on still carry our owner id.
    for partition_id in &rebalance.release {
      if self.workers.contains_key(partition_id) {
        continue;
      }
      if let Some(record) = rebalance.plan.owned.iter().find(|r| &r.partition_id == partition_id) {
        self.release_record(record).await;
      }
    }

    for record in rebalance.owned {
      if self.workers.contains_key(&record.partition_id) {
        continue;
      }
      let partition_id = record.partition_id.clone();
      let stolen = rebalance.stolen.contains(&partition_id);
      info!(
        partition_id = %partition_id,
        owner_id = %self.instance.instance_id,
        stolen = stolen,
        "starting partition worker"
      );
      let mut worker = PartitionWorker::new(self.env.clone(), record);
      if stolen {
        worker = worker.with_handoff(self.env.options.handoff_delay());
      }
      let handle = worker.spawn(CancellationToken::new());
      self.workers.insert(partition_id.clone(), handle);
      outcome.started.push(partition_id);
    }

    outcome.owned = desired.into_iter().collect();
    outcome.owned.sort();
    outcome.started.sort();
    outcome.drained.sort();
    if !outcome.started.is_empty() || !outcome.drained.is_empty() {
      info!(
        hub = %self.scope,
        owner_id = %self.instance.instance_id,
        owned = outcome.owned.len(),
        started = outcome.started.len(),
        drained = outcome.drained.len(),
        "ownership changed"
      );
    }
    Ok(outcome)
  }

  /// Hands every queued error report to the handler.
  pub async fn flush_reports(&mut self) {
    while let Ok(report) = self.reports.try_recv() {
      self.deliver(report).await;
    }
  }

  /// Runs until `cancel` fires, then shuts down.
  pub async fn run(mut self, cancel: CancellationToken) {
    info!(
      hub = %self.scope,
      owner_id = %self.instance.instance_id,
      joined_at = %self.instance.joined_at,
      "consumer group member starting"
    );
    let mut ticker = tokio::time::interval(self.env.options.rebalance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {
          if let Err(e) = self.tick().await {
            warn!(hub = %self.scope, error = %e, "rebalance failed");
            self.deliver(ErrorReport::general(e)).await;
          }
        }
        Some(report) = self.reports.recv() => self.deliver(report).await,
      }
    }

    self.shutdown().await;
  }

  /// Spawns [`run`](Self::run) and returns a handle to stop it.
  pub fn start(self) -> CoordinatorHandle {
    let cancel = CancellationToken::new();
    let view = self.view();
    let task = tokio::spawn(self.run(cancel.clone()));
    CoordinatorHandle { view, cancel, task }
  }

  /// Drains every worker, waits for them within the grace period and
  /// releases whatever leases this instance still holds.
  pub async fn shutdown(&mut self) {
    info!(hub = %self.scope, owner_id = %self.instance.instance_id, "consumer group member shutting down");
    for worker in self.workers.values() {
      worker.drain();
    }

    let deadline = Instant::now() + self.env.options.shutdown_grace;
    let workers: Vec<WorkerHandle> = self.workers.drain().map(|(_, w)| w).collect();
    join_all(workers.into_iter().map(|mut worker| async move {
      match tokio::time::timeout_at(deadline, &mut worker.task).await {
        Ok(Ok(exit)) => debug!(partition_id = %exit.partition_id, "worker stopped"),
        Ok(Err(e)) => error!(partition_id = %worker.partition_id(), error = %e, "worker task failed"),
        Err(_) => {
          warn!(partition_id = %worker.partition_id(), "worker did not drain within grace period, aborting");
          worker.task.abort();
        }
      }
    }))
    .await;

    self.flush_reports().await;

    match self.env.ownership.list_ownership(&self.scope).await {
      Ok(records) => {
        for record in records.iter().filter(|r| r.owner_id == self.instance.instance_id) {
          self.release_record(record).await;
        }
      }
      Err(e) => {
        warn!(hub = %self.scope, error = %e, "could not list leases to release");
        self.deliver(ErrorReport::general(e)).await;
      }
    }
    info!(hub = %self.scope, owner_id = %self.instance.instance_id, "consumer group member stopped");
  }

  /// Drops finished workers.
  async fn reap(&mut self) {
    let finished: Vec<PartitionId> = self
      .workers
      .iter()
      .filter(|(_, w)| w.is_finished())
      .map(|(p, _)| p.clone())
      .collect();
    for partition_id in finished {
      if let Some(worker) = self.workers.remove(&partition_id) {
        match worker.join().await {
          Some(exit) => debug!(
            partition_id = %partition_id,
            faulted = exit.faulted,
            lease_lost = exit.lease_lost,
            "worker reaped"
          ),
          None => error!(partition_id = %partition_id, "worker task failed"),
        }
      }
    }
  }

  async fn release_record(&self, record: &OwnershipRecord) {
    match self
      .env
      .ownership
      .claim_ownership(&record.released(), record.version.as_ref())
      .await
    {
      Ok(_) => debug!(partition_id = %record.partition_id, "lease released"),
      Err(e) if e.is_conflict() => debug!(partition_id = %record.partition_id, "lease already taken over"),
      Err(e) => warn!(partition_id = %record.partition_id, error = %e, "lease release failed"),
    }
  }

  async fn deliver(&self, report: ErrorReport) {
    if report.faulted {
      error!(
        partition_id = ?report.partition_id,
        position = ?report.position,
        error = %report.error,
        "partition faulted"
      );
    } else {
      debug!(
        partition_id = ?report.partition_id,
        position = ?report.position,
        error = %report.error,
        "error reported"
      );
    }
    self.env.handler.on_error(&report).await;
  }
}

impl Drop for ConsumerGroupCoordinator {
  // Workers must not outlive their coordinator; after a clean shutdown
  // there are none left.
  fn drop(&mut self) {
    for worker in self.workers.values() {
      worker.task.abort();
    }
  }
}

/// Handle to a running coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
  view: ProcessorView,
  cancel: CancellationToken,
  task: JoinHandle<()>,
}

impl CoordinatorHandle {
  /// Ownership and position view of the running instance.
  pub fn view(&self) -> &ProcessorView {
    &self.view
  }

  /// Whether the coordinator task is still running.
  pub fn is_running(&self) -> bool {
    !self.task.is_finished()
  }

  /// Stops the coordinator and waits for its shutdown to complete.
  pub async fn shutdown(self) {
    self.cancel.cancel();
    if let Err(e) = self.task.await {
      error!(owner_id = %self.view.instance_id(), error = %e, "coordinator task failed");
    }
  }

  /// Stops the coordinator without draining or releasing anything, as if
  /// the process had died.
  pub fn abort(self) {
    self.task.abort();
  }
}

/// Several named processors run and stopped together.
#[derive(Default)]
pub struct ProcessorHost {
  processors: BTreeMap<String, ConsumerGroupCoordinator>,
}

impl ProcessorHost {
  /// Creates an empty host.
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a processor under `name`, replacing any previous one.
  #[must_use]
  pub fn with_processor(mut self, name: impl Into<String>, coordinator: ConsumerGroupCoordinator) -> Self {
    self.processors.insert(name.into(), coordinator);
    self
  }

  /// Names of the configured processors.
  pub fn names(&self) -> Vec<&str> {
    self.processors.keys().map(String::as_str).collect()
  }

  /// Starts every processor.
  pub fn start(self) -> RunningHost {
    let handles = self
      .processors
      .into_iter()
      .map(|(name, coordinator)| {
        info!(processor = %name, "starting processor");
        (name, coordinator.start())
      })
      .collect();
    RunningHost { handles }
  }
}

/// Processors started by a [`ProcessorHost`].
#[derive(Debug)]
pub struct RunningHost {
  handles: BTreeMap<String, CoordinatorHandle>,
}

impl RunningHost {
  /// View of one processor.
  pub fn view(&self, name: &str) -> Option<&ProcessorView> {
    self.handles.get(name).map(CoordinatorHandle::view)
  }

  /// Names of the running processors.
  pub fn names(&self) -> Vec<&str> {
    self.handles.keys().map(String::as_str).collect()
  }

  /// Shuts every processor down concurrently.
  pub async fn shutdown(self) {
    join_all(self.handles.into_iter().map(|(name, handle)| async move {
      handle.shutdown().await;
      info!(processor = %name, "processor stopped");
    }))
    .await;
  }
}
