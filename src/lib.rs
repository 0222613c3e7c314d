//! # hubweave
//!
//! Partitioned event-stream consumption with lease-based ownership.
//!
//! A consumer group is a set of cooperating processes reading one event
//! stream. Each partition of the stream is owned by at most one member at a
//! time through a renewable lease held in an [`OwnershipStore`]; members
//! rebalance leases among themselves, process their partitions in strict
//! position order and record progress in a [`CheckpointStore`] so that a
//! partition picks up where it left off when ownership moves.
//!
//! ## Key Features
//!
//! - **Lease-based ownership** built on conditional writes, no in-process locks
//! - **Greedy fair-share balancing** with partition stealing for new members
//! - **Per-partition workers** with checkpointing and drain on ownership loss
//! - **Single error sink** aggregating handler failures and worker faults
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hubweave::{
//!   ConsumerGroupCoordinator, ConsumerInstance, EventHandler, Event, FileStore, HandlerError,
//!   InMemoryPartitionSource, PartitionContext, ProcessorSettings, ProcessorView,
//! };
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Print {
//!   async fn on_event(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
//!     println!("{} @{}: {:?}", ctx.partition_id, event.position, event.body_as_str());
//!     Ok(())
//!   }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProcessorSettings {
//!   connection_string: "Endpoint=sb://ns.example.net/;SharedAccessKeyName=listen;SharedAccessKey=k".into(),
//!   hub_name: "usage".into(),
//!   container: "/var/lib/hubweave".into(),
//!   ..Default::default()
//! }
//! .validate("usage")?;
//!
//! let store = Arc::new(FileStore::new(&config.container));
//! let view = ProcessorView::new(ConsumerInstance::generate().instance_id);
//! let coordinator = ConsumerGroupCoordinator::new(
//!   config,
//!   view,
//!   Arc::new(InMemoryPartitionSource::new(4)),
//!   store.clone(),
//!   store,
//!   Arc::new(Print),
//! )?;
//! let handle = coordinator.start();
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Partition lease balancing.
pub mod balancer;
/// Checkpoint records and storage.
pub mod checkpoint;
/// Startup configuration and validation.
pub mod config;
/// Consumer group coordinator and multi-processor host.
pub mod coordinator;
/// Error taxonomy, error reports and handler failure policy.
pub mod error;
/// Durable JSON-file store.
pub mod file_store;
/// Application handler interface and the processor view.
pub mod handler;
/// Ownership records and storage.
pub mod ownership;
/// Partition identifiers, hub scopes and instance identity.
pub mod partition;
/// Read positions and checkpoint policy.
pub mod position;
/// Partitioned event sources.
pub mod source;
/// Per-partition worker state machine.
pub mod worker;

#[cfg(test)]
mod coordinator_test;

pub use balancer::{BalancePlan, LoadBalancer, RebalanceOutcome, plan_ownership};
pub use checkpoint::{CheckpointRecord, CheckpointStore, InMemoryCheckpointStore};
pub use config::{
  ConfigError, ConnectionString, HostSettings, ProcessorConfig, ProcessorOptions, ProcessorSettings,
  RetryPolicy,
};
pub use coordinator::{
  ConsumerGroupCoordinator, CoordinatorHandle, ProcessorHost, RunningHost, TickOutcome,
};
pub use error::{
  BoxError, ErrorAction, ErrorReport, HandlerError, HandlerPolicy, ProcessorError, SourceError,
  StoreError, StoreResult,
};
pub use file_store::FileStore;
pub use handler::{EventHandler, PartitionContext, PartitionStatus, ProcessorView, WorkerState};
pub use ownership::{InMemoryOwnershipStore, OwnershipRecord, OwnershipStore, VersionToken};
pub use partition::{ConsumerInstance, DEFAULT_CONSUMER_GROUP, HubScope, Namespace, PartitionId};
pub use position::{CheckpointPolicy, ReadPosition, StartPosition};
pub use source::{Event, EventBatch, InMemoryPartitionSource, PartitionSource};
pub use worker::{PartitionWorker, WorkerEnv, WorkerExit, WorkerHandle};
