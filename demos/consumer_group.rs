//! Runs a `plan` and a `usage` processor side by side against in-memory
//! event sources, persisting leases and checkpoints to a local directory.
//!
//! Settings come from the usual environment variables
//! (`EVENT_HUB_PLAN_CONNECTION_STRING`, `EVENT_HUB_PLAN_NAME`, ...,
//! `BLOB_CONTAINER`); anything unset falls back to a demo value.
//!
//! Run it twice at once to watch two instances split the partitions.

use async_trait::async_trait;
use hubweave::{
  ConsumerGroupCoordinator, ConsumerInstance, ErrorReport, Event, EventHandler, FileStore,
  HandlerError, HostSettings, InMemoryPartitionSource, PartitionContext, PartitionId,
  ProcessorHost, ProcessorOptions, ProcessorView,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEMO_CONNECTION: &str =
  "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=ZGVtbw==";
const PARTITIONS: u32 = 4;

#[derive(Debug, Serialize, Deserialize)]
struct Reading {
  account: String,
  units: u32,
}

struct LoggingHandler {
  stream: String,
  view: ProcessorView,
}

#[async_trait]
impl EventHandler for LoggingHandler {
  async fn on_event(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
    let reading: Reading = event.body_json().map_err(HandlerError::new)?;
    info!(
      stream = %self.stream,
      partition_id = %ctx.partition_id,
      position = event.position,
      account = %reading.account,
      units = reading.units,
      "event"
    );
    Ok(())
  }

  async fn on_error(&self, report: &ErrorReport) {
    warn!(
      stream = %self.stream,
      owner_id = %self.view.instance_id(),
      faulted = report.faulted,
      "{}",
      report
    );
  }
}

fn demo_default(key: &str, container: &Path) -> Option<String> {
  match key {
    "BLOB_CONTAINER" => Some(container.display().to_string()),
    "EVENT_HUB_PLAN_NAME" => Some("plan".into()),
    "EVENT_HUB_USAGE_NAME" => Some("usage".into()),
    k if k.ends_with("_CONNECTION_STRING") => Some(DEMO_CONNECTION.into()),
    _ => None,
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();

  let fallback = std::env::temp_dir().join("hubweave-demo");
  let settings = HostSettings::from_lookup(&["plan", "usage"], |key| {
    std::env::var(key).ok().or_else(|| demo_default(key, &fallback))
  });
  let store = Arc::new(FileStore::new(&settings.container));
  let configs = settings
    .with_options(
      ProcessorOptions::default()
        .with_rebalance_interval(Duration::from_secs(1))
        .with_lease(Duration::from_secs(6), Duration::from_secs(2)),
    )
    .validate()?;

  let mut host = ProcessorHost::new();
  let mut sources = Vec::new();
  for (name, config) in configs {
    info!(stream = %name, hub = %config.scope, namespace = %config.connection.namespace(), "configured");
    let source = InMemoryPartitionSource::new(PARTITIONS);
    let view = ProcessorView::new(ConsumerInstance::generate().instance_id);
    let handler = Arc::new(LoggingHandler {
      stream: name.clone(),
      view: view.clone(),
    });
    let coordinator = ConsumerGroupCoordinator::new(
      config,
      view,
      Arc::new(source.clone()),
      store.clone(),
      store.clone(),
      handler,
    )?;
    host = host.with_processor(name.clone(), coordinator);
    sources.push((name, source));
  }

  let running = host.start();

  for (name, source) in &sources {
    for p in 0..PARTITIONS {
      for units in 1..=5 {
        let reading = Reading {
          account: format!("{}-account-{}", name, p),
          units,
        };
        source.publish(&PartitionId::from(p), serde_json::to_vec(&reading)?).await;
      }
    }
    // One malformed event to show the error path.
    source.publish(&PartitionId::from(0), "not json").await;
  }

  tokio::time::sleep(Duration::from_secs(3)).await;

  for name in running.names() {
    if let Some(view) = running.view(name) {
      for (partition, status) in view.snapshot() {
        println!(
          "{:>6} partition {}: {} (dispatched {:?}, checkpoint {:?})",
          name, partition, status.state, status.last_dispatched, status.last_checkpoint
        );
      }
    }
  }

  running.shutdown().await;
  println!("checkpoints stored under {}", store.path().display());
  Ok(())
}
