//! Multi-instance scenarios run against shared in-memory stores.

use async_trait::async_trait;
use hubweave::{
  CheckpointRecord, CheckpointStore, ConsumerGroupCoordinator, CoordinatorHandle, ErrorReport, Event,
  EventHandler, HandlerError, HubScope, InMemoryCheckpointStore, InMemoryOwnershipStore,
  InMemoryPartitionSource, OwnershipStore, PartitionContext, PartitionId, ProcessorError,
  ProcessorOptions, ProcessorSettings, ProcessorView, StoreResult, WorkerState,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONNECTION: &str = "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=c2VjcmV0";

// Test handler recording deliveries and errors
#[derive(Default)]
struct Recording {
  seen: Mutex<BTreeMap<PartitionId, Vec<u64>>>,
  errors: Mutex<Vec<(Option<PartitionId>, Option<u64>, bool)>>,
  regressions: AtomicUsize,
  fail_on: Option<(PartitionId, u64)>,
}

impl Recording {
  fn failing_on(partition: &str, position: u64) -> Self {
    Self {
      fail_on: Some((PartitionId::from(partition), position)),
      ..Self::default()
    }
  }

  fn seen(&self, partition: &str) -> Vec<u64> {
    self
      .seen
      .lock()
      .unwrap()
      .get(&PartitionId::from(partition))
      .cloned()
      .unwrap_or_default()
  }
}

#[async_trait]
impl EventHandler for Recording {
  async fn on_event(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
    if self.fail_on.as_ref() == Some(&(ctx.partition_id.clone(), event.position)) {
      return Err(HandlerError::new("poison event"));
    }
    self
      .seen
      .lock()
      .unwrap()
      .entry(ctx.partition_id.clone())
      .or_default()
      .push(event.position);
    Ok(())
  }

  async fn on_error(&self, report: &ErrorReport) {
    if matches!(report.error, ProcessorError::Regression { .. }) {
      self.regressions.fetch_add(1, Ordering::SeqCst);
    }
    let is_handler = matches!(report.error, ProcessorError::Handler(_));
    self
      .errors
      .lock()
      .unwrap()
      .push((report.partition_id.clone(), report.position, is_handler));
  }
}

// Checkpoint store that remembers every successful write in order
#[derive(Debug, Default)]
struct AuditedCheckpoints {
  inner: InMemoryCheckpointStore,
  writes: Mutex<Vec<(PartitionId, u64)>>,
}

#[async_trait]
impl CheckpointStore for AuditedCheckpoints {
  async fn read_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
  ) -> StoreResult<Option<CheckpointRecord>> {
    self.inner.read_checkpoint(scope, partition_id).await
  }

  async fn write_checkpoint(
    &self,
    scope: &HubScope,
    partition_id: &PartitionId,
    position: u64,
  ) -> StoreResult<CheckpointRecord> {
    let record = self.inner.write_checkpoint(scope, partition_id, position).await?;
    self.writes.lock().unwrap().push((partition_id.clone(), record.position));
    Ok(record)
  }

  async fn list_checkpoints(&self, scope: &HubScope) -> StoreResult<Vec<CheckpointRecord>> {
    self.inner.list_checkpoints(scope).await
  }
}

struct Cluster {
  source: InMemoryPartitionSource,
  ownership: InMemoryOwnershipStore,
  checkpoints: Arc<AuditedCheckpoints>,
}

impl Cluster {
  fn new(source: InMemoryPartitionSource) -> Self {
    Self {
      source,
      ownership: InMemoryOwnershipStore::new(),
      checkpoints: Arc::default(),
    }
  }

  fn join(&self, id: &str, handler: Arc<Recording>) -> CoordinatorHandle {
    let config = ProcessorSettings {
      connection_string: CONNECTION.into(),
      hub_name: "usage".into(),
      container: "memory".into(),
      options: ProcessorOptions::for_testing(),
      ..Default::default()
    }
    .validate("usage")
    .unwrap();
    ConsumerGroupCoordinator::new(
      config,
      ProcessorView::new(id),
      Arc::new(self.source.clone()),
      Arc::new(self.ownership.clone()),
      self.checkpoints.clone(),
      handler,
    )
    .unwrap()
    .start()
  }

  async fn checkpoint(&self, partition: &str) -> Option<u64> {
    self
      .checkpoints
      .read_checkpoint(&HubScope::new("usage", "$Default"), &PartitionId::from(partition))
      .await
      .unwrap()
      .map(|c| c.position)
  }

  async fn wait_for_checkpoint(&self, partition: &str, position: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
      while self.checkpoint(partition).await != Some(position) {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap_or_else(|_| panic!("partition {} never checkpointed {}", partition, position));
  }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
  tokio::time::timeout(Duration::from_secs(10), async {
    while !condition() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

fn owned(handles: &[&CoordinatorHandle]) -> Vec<usize> {
  handles.iter().map(|h| h.view().owned_partitions().len()).collect()
}

#[tokio::test]
async fn test_second_instance_converges_to_two_and_two() {
  let cluster = Cluster::new(InMemoryPartitionSource::new(4));

  let a = cluster.join("a", Arc::default());
  wait_until("a to own all partitions", || owned(&[&a]) == vec![4]).await;

  let b = cluster.join("b", Arc::default());
  wait_until("an even split", || owned(&[&a, &b]) == vec![2, 2]).await;

  let mut all: Vec<PartitionId> = a.view().owned_partitions();
  all.extend(b.view().owned_partitions());
  all.sort();
  all.dedup();
  assert_eq!(all.len(), 4, "every partition has exactly one live owner");

  a.shutdown().await;
  b.shutdown().await;
}

#[tokio::test]
async fn test_partition_never_runs_on_two_instances_during_handoff() {
  let cluster = Cluster::new(InMemoryPartitionSource::new(4));
  let publisher = cluster.source.clone();
  let publishing = tokio::spawn(async move {
    for round in 0..200u32 {
      publisher.publish_many(&PartitionId::from(round % 4), 3).await;
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  });

  let first = Arc::new(Recording::default());
  let second = Arc::new(Recording::default());
  let a = cluster.join("a", first.clone());
  wait_until("a to own all partitions", || owned(&[&a]) == vec![4]).await;
  let b = cluster.join("b", second.clone());

  let scope = HubScope::new("usage", "$Default");
  let partitions: Vec<PartitionId> = (0..4u32).map(PartitionId::from).collect();
  let mut overlaps = Vec::new();
  let mut samples = 0;
  let sampling = tokio::time::Instant::now();
  while sampling.elapsed() < Duration::from_millis(1500) {
    for partition in &partitions {
      let running = [&a, &b]
        .iter()
        .filter(|h| {
          h.view()
            .status(partition)
            .is_some_and(|s| s.state == WorkerState::Running)
        })
        .count();
      if running > 1 {
        overlaps.push(partition.clone());
      }
    }

    let records = cluster.ownership.list_ownership(&scope).await.unwrap();
    let mut held: Vec<&PartitionId> = records
      .iter()
      .filter(|r| !r.owner_id.is_empty())
      .map(|r| &r.partition_id)
      .collect();
    let leases = held.len();
    held.sort();
    held.dedup();
    assert_eq!(held.len(), leases, "a partition has two lease holders");

    samples += 1;
    tokio::time::sleep(Duration::from_millis(2)).await;
  }

  assert!(samples > 50);
  assert!(overlaps.is_empty(), "running on both instances: {:?}", overlaps);
  assert_eq!(owned(&[&a, &b]), vec![2, 2]);

  publishing.await.unwrap();
  a.shutdown().await;
  b.shutdown().await;
  let regressions = first.regressions.load(Ordering::SeqCst) + second.regressions.load(Ordering::SeqCst);
  assert_eq!(regressions, 0, "checkpoint writes raced during handoff");
}

#[tokio::test]
async fn test_handler_error_is_isolated_to_its_partition() {
  let p2 = PartitionId::from("2");
  let source = InMemoryPartitionSource::new(4).with_start_position(&p2, 100).await;
  for p in 0..4u32 {
    source.publish_many(&PartitionId::from(p), 10).await;
  }
  let cluster = Cluster::new(source);
  let handler = Arc::new(Recording::failing_on("2", 105));

  let a = cluster.join("a", handler.clone());
  for p in ["0", "1", "3"] {
    cluster.wait_for_checkpoint(p, 9).await;
  }
  cluster.wait_for_checkpoint("2", 109).await;
  a.shutdown().await;

  for p in ["0", "1", "3"] {
    assert_eq!(handler.seen(p), (0..10).collect::<Vec<u64>>());
  }
  assert_eq!(handler.seen("2"), vec![100, 101, 102, 103, 104]);
  let errors = handler.errors.lock().unwrap().clone();
  assert_eq!(errors, vec![(Some(p2), Some(105), true)]);
}

#[tokio::test]
async fn test_crashed_instance_resumes_from_checkpoint() {
  let cluster = Cluster::new(InMemoryPartitionSource::new(1));
  let p0 = PartitionId::from("0");
  cluster.source.publish_many(&p0, 10).await;

  let first = Arc::new(Recording::default());
  let a = cluster.join("a", first.clone());
  cluster.wait_for_checkpoint("0", 9).await;
  a.abort();
  // Give the runtime a moment to tear down a's tasks.
  tokio::time::sleep(Duration::from_millis(100)).await;

  cluster.source.publish_many(&p0, 10).await;
  let second = Arc::new(Recording::default());
  let b = cluster.join("b", second.clone());
  // b takes over once a's lease expires.
  cluster.wait_for_checkpoint("0", 19).await;
  b.shutdown().await;

  assert_eq!(first.seen("0"), (0..10).collect::<Vec<u64>>());
  assert_eq!(second.seen("0"), (10..20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_uneven_partitions_settle_at_floor_or_ceiling() {
  let cluster = Cluster::new(InMemoryPartitionSource::new(7));

  let a = cluster.join("a", Arc::default());
  wait_until("a to own all partitions", || owned(&[&a]) == vec![7]).await;
  let b = cluster.join("b", Arc::default());
  let c = cluster.join("c", Arc::default());

  wait_until("a 2/3 split", || {
    let counts = owned(&[&a, &b, &c]);
    counts.iter().sum::<usize>() == 7 && counts.iter().all(|n| *n == 2 || *n == 3)
  })
  .await;

  for handle in [a, b, c] {
    handle.shutdown().await;
  }
}

#[tokio::test]
async fn test_checkpoints_never_move_backwards() {
  let cluster = Cluster::new(InMemoryPartitionSource::new(4));
  let publisher = cluster.source.clone();
  let publishing = tokio::spawn(async move {
    for round in 0..40u32 {
      publisher.publish_many(&PartitionId::from(round % 4), 5).await;
      tokio::time::sleep(Duration::from_millis(15)).await;
    }
  });

  let a = cluster.join("a", Arc::default());
  tokio::time::sleep(Duration::from_millis(150)).await;
  let b = cluster.join("b", Arc::default());
  tokio::time::sleep(Duration::from_millis(150)).await;
  let c = cluster.join("c", Arc::default());

  publishing.await.unwrap();
  for p in 0..4u32 {
    let tail = cluster.source.tail(&PartitionId::from(p)).await.unwrap();
    cluster.wait_for_checkpoint(&p.to_string(), tail - 1).await;
  }
  for handle in [a, b, c] {
    handle.shutdown().await;
  }

  let writes = cluster.checkpoints.writes.lock().unwrap().clone();
  let mut last: HashMap<PartitionId, u64> = HashMap::new();
  for (partition, position) in writes {
    if let Some(previous) = last.insert(partition.clone(), position) {
      assert!(position >= previous, "partition {} went from {} to {}", partition, previous, position);
    }
  }
  assert_eq!(last.len(), 4);
}
