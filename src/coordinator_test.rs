//! Tests for tick-driven reconciliation and shutdown.

use crate::checkpoint::InMemoryCheckpointStore;
use crate::config::{ConfigError, ProcessorConfig, ProcessorOptions, ProcessorSettings};
use crate::coordinator::{ConsumerGroupCoordinator, ProcessorHost};
use crate::error::{ErrorReport, HandlerError, ProcessorError, SourceError};
use crate::handler::{EventHandler, PartitionContext, ProcessorView};
use crate::ownership::{InMemoryOwnershipStore, OwnershipStore};
use crate::partition::{HubScope, PartitionId};
use crate::source::{Event, InMemoryPartitionSource};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONNECTION: &str = "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=c2VjcmV0";

fn config(options: ProcessorOptions) -> ProcessorConfig {
  ProcessorSettings {
    connection_string: CONNECTION.into(),
    hub_name: "usage".into(),
    consumer_group: None,
    container: "memory".into(),
    options,
  }
  .validate("usage")
  .unwrap()
}

fn scope() -> HubScope {
  HubScope::new("usage", "$Default")
}

#[derive(Default)]
struct Collecting {
  errors: Mutex<Vec<(Option<PartitionId>, bool)>>,
}

#[async_trait]
impl EventHandler for Collecting {
  async fn on_event(&self, _ctx: &PartitionContext, _event: &Event) -> Result<(), HandlerError> {
    Ok(())
  }

  async fn on_error(&self, report: &ErrorReport) {
    self
      .errors
      .lock()
      .unwrap()
      .push((report.partition_id.clone(), report.faulted));
  }
}

struct Group {
  source: InMemoryPartitionSource,
  ownership: InMemoryOwnershipStore,
  checkpoints: InMemoryCheckpointStore,
}

impl Group {
  fn new(partitions: u32) -> Self {
    Self {
      source: InMemoryPartitionSource::new(partitions),
      ownership: InMemoryOwnershipStore::new(),
      checkpoints: InMemoryCheckpointStore::new(),
    }
  }

  fn member(&self, id: &str, handler: Arc<Collecting>) -> ConsumerGroupCoordinator {
    ConsumerGroupCoordinator::new(
      config(ProcessorOptions::for_testing()),
      ProcessorView::new(id),
      Arc::new(self.source.clone()),
      Arc::new(self.ownership.clone()),
      Arc::new(self.checkpoints.clone()),
      handler,
    )
    .unwrap()
  }

  async fn owners(&self) -> Vec<String> {
    self
      .ownership
      .list_ownership(&scope())
      .await
      .unwrap()
      .into_iter()
      .map(|r| r.owner_id)
      .collect()
  }
}

fn ids(list: &[&str]) -> Vec<PartitionId> {
  list.iter().map(|p| PartitionId::from(*p)).collect()
}

#[tokio::test]
async fn test_first_tick_claims_every_partition() {
  let group = Group::new(4);
  let mut a = group.member("a", Arc::default());

  let outcome = a.tick().await.unwrap();
  assert_eq!(outcome.started, ids(&["0", "1", "2", "3"]));
  assert_eq!(outcome.owned, ids(&["0", "1", "2", "3"]));
  assert_eq!(a.live_partitions().len(), 4);
  assert_eq!(a.view().owned_partitions().len(), 4);

  let again = a.tick().await.unwrap();
  assert!(again.started.is_empty());
  assert!(again.drained.is_empty());

  a.shutdown().await;
}

#[tokio::test]
async fn test_second_member_converges_to_even_split() {
  let group = Group::new(4);
  let mut a = group.member("a", Arc::default());
  let mut b = group.member("b", Arc::default());

  a.tick().await.unwrap();
  let joined = b.tick().await.unwrap();
  assert_eq!(joined.started, ids(&["0", "1"]));

  let reconciled = a.tick().await.unwrap();
  assert_eq!(reconciled.drained, ids(&["0", "1"]));
  assert_eq!(reconciled.owned, ids(&["2", "3"]));
  assert_eq!(group.owners().await, vec!["b", "b", "a", "a"]);

  a.shutdown().await;
  b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_every_lease() {
  let group = Group::new(3);
  let mut a = group.member("a", Arc::default());
  a.tick().await.unwrap();

  a.shutdown().await;

  assert_eq!(group.owners().await, vec!["", "", ""]);
  assert!(a.live_partitions().is_empty());
}

#[tokio::test]
async fn test_faulted_partition_is_reported_and_retried() {
  let group = Group::new(2);
  let p1 = PartitionId::from("1");
  group
    .source
    .inject_fault(&p1, SourceError::Permanent("unauthorized".into()))
    .await;
  let handler = Arc::new(Collecting::default());
  let mut a = group.member("a", handler.clone());

  a.tick().await.unwrap();
  let view = a.view();
  tokio::time::timeout(Duration::from_secs(5), async {
    while view.owned_partitions().contains(&p1) {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .unwrap();
  // Let the worker task finish after publishing its final state.
  tokio::time::sleep(Duration::from_millis(50)).await;

  a.flush_reports().await;
  assert_eq!(*handler.errors.lock().unwrap(), vec![(Some(p1.clone()), true)]);

  let retried = a.tick().await.unwrap();
  assert_eq!(retried.started, vec![p1]);

  a.shutdown().await;
}

#[tokio::test]
async fn test_invalid_options_are_rejected_up_front() {
  let group = Group::new(1);
  let mut cfg = config(ProcessorOptions::for_testing());
  cfg.options.renew_interval = cfg.options.lease_duration;
  let result = ConsumerGroupCoordinator::new(
    cfg,
    ProcessorView::new("a"),
    Arc::new(group.source.clone()),
    Arc::new(group.ownership.clone()),
    Arc::new(group.checkpoints.clone()),
    Arc::new(Collecting::default()),
  );
  match result {
    Err(err @ ProcessorError::Config(ConfigError::InvalidOption { .. })) => assert!(err.is_fatal()),
    Err(other) => panic!("unexpected error: {}", other),
    Ok(_) => panic!("invalid options accepted"),
  }
}

#[tokio::test]
async fn test_host_starts_and_stops_processors_together() {
  let plan = Group::new(2);
  let usage = Group::new(2);
  let host = ProcessorHost::new()
    .with_processor("plan", plan.member("a", Arc::default()))
    .with_processor("usage", usage.member("a", Arc::default()));
  assert_eq!(host.names(), vec!["plan", "usage"]);

  let running = host.start();
  let plan_view = running.view("plan").unwrap().clone();
  tokio::time::timeout(Duration::from_secs(5), async {
    while plan_view.owned_partitions().len() < 2 {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .unwrap();

  running.shutdown().await;
  assert_eq!(plan.owners().await, vec!["", ""]);
  assert_eq!(usage.owners().await, vec!["", ""]);
}
