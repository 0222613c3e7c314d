//! # Error Handling
//!
//! Errors are split by the layer that raises them:
//!
//! - **ConfigError**: malformed or missing startup configuration. The only
//!   error that is fatal to the process (see [`crate::config`]).
//! - **StoreError**: ownership/checkpoint store failures. `Conflict` is the
//!   expected outcome of losing a conditional-write race; `Regression` means a
//!   caller tried to move a checkpoint backwards.
//! - **SourceError**: transient or permanent failures of the partition source.
//! - **HandlerError**: a failure returned by the application's event handler.
//!
//! Everything that happens inside a running processor is reported as a
//! [`ProcessorError`] wrapped in an [`ErrorReport`] and delivered to the
//! coordinator's error sink; none of these stop the coordinator itself.
//!
//! ## Handler policies
//!
//! What a partition does after its handler fails is decided by a
//! [`HandlerPolicy`]:
//!
//! - **Skip** (default): report the failure, move past the failed batch and
//!   checkpoint its last position.
//! - **Retry(n)**: dispatch the same batch again up to `n` times, then skip.
//! - **Stop**: fault the partition; its lease is released and the next
//!   rebalance cycle may pick it up again.
//! - **Custom**: user-defined decision based on the error and attempt count.

use crate::config::ConfigError;
use crate::partition::PartitionId;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error type returned by application code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by ownership and checkpoint stores.
#[derive(Error, Debug)]
pub enum StoreError {
  /// A conditional write lost against a concurrent writer.
  #[error("conditional write conflict on {key}")]
  Conflict {
    /// Record key.
    key: String,
  },
  /// A checkpoint write tried to move the position backwards.
  #[error("checkpoint regression on {key}: stored {stored}, attempted {attempted}")]
  Regression {
    /// Record key.
    key: String,
    /// Position already stored.
    stored: u64,
    /// Rejected position.
    attempted: u64,
  },
  /// I/O error in a durable store.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Record encoding failed.
  #[error("serialization error: {0}")]
  Serialization(String),
  /// The store could not be reached or refused the request.
  #[error("store unavailable: {0}")]
  Unavailable(String),
}

impl StoreError {
  /// Returns true for conditional-write conflicts.
  pub fn is_conflict(&self) -> bool {
    matches!(self, StoreError::Conflict { .. })
  }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a partition source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
  /// Worth retrying: timeouts, throttling, dropped connections.
  #[error("transient source error: {0}")]
  Transient(String),
  /// Retrying cannot help: invalid position, revoked credentials, missing hub.
  #[error("permanent source error: {0}")]
  Permanent(String),
}

impl SourceError {
  /// Returns true if the operation may succeed when retried.
  pub fn is_transient(&self) -> bool {
    matches!(self, SourceError::Transient(_))
  }
}

/// Failure returned by an [`EventHandler`](crate::handler::EventHandler).
#[derive(Error, Debug)]
#[error("handler error{}: {source}", position_suffix(.position))]
pub struct HandlerError {
  /// Position of the event that failed, when known.
  pub position: Option<u64>,
  /// The application's error.
  #[source]
  pub source: BoxError,
}

fn position_suffix(position: &Option<u64>) -> String {
  position.map(|p| format!(" at position {}", p)).unwrap_or_default()
}

impl HandlerError {
  /// Wraps an application error.
  pub fn new(source: impl Into<BoxError>) -> Self {
    Self {
      position: None,
      source: source.into(),
    }
  }

  /// Attributes the failure to the event at `position`.
  #[must_use]
  pub fn at(mut self, position: u64) -> Self {
    self.position = Some(position);
    self
  }
}

/// Errors delivered to the coordinator's error sink.
#[derive(Error, Debug)]
pub enum ProcessorError {
  /// Startup configuration was rejected.
  #[error("configuration error: {0}")]
  Config(#[from] ConfigError),
  /// A conditional ownership write lost a race.
  #[error("ownership conflict on {key}")]
  Conflict {
    /// Record key.
    key: String,
  },
  /// A checkpoint write tried to move backwards.
  #[error("checkpoint regression on {key}: stored {stored}, attempted {attempted}")]
  Regression {
    /// Record key.
    key: String,
    /// Position already stored.
    stored: u64,
    /// Rejected position.
    attempted: u64,
  },
  /// The source kept failing transiently until retries were exhausted.
  #[error("source failed after {attempts} attempts: {last}")]
  TransientSource {
    /// Number of attempts made.
    attempts: u32,
    /// The final error.
    last: SourceError,
  },
  /// The source failed in a way retries cannot fix.
  #[error("{0}")]
  PermanentSource(SourceError),
  /// The application handler failed.
  #[error(transparent)]
  Handler(#[from] HandlerError),
  /// Lease renewal failed; the partition is no longer owned by this instance.
  #[error("lease lost for partition {partition_id}: {reason}")]
  LeaseLost {
    /// Partition whose lease was lost.
    partition_id: PartitionId,
    /// Why renewal failed.
    reason: String,
  },
  /// Any other store failure.
  #[error("store error: {0}")]
  Store(StoreError),
}

impl ProcessorError {
  /// Only configuration errors stop the process.
  pub fn is_fatal(&self) -> bool {
    matches!(self, ProcessorError::Config(_))
  }
}

impl From<StoreError> for ProcessorError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::Conflict { key } => ProcessorError::Conflict { key },
      StoreError::Regression {
        key,
        stored,
        attempted,
      } => ProcessorError::Regression {
        key,
        stored,
        attempted,
      },
      other => ProcessorError::Store(other),
    }
  }
}

impl From<SourceError> for ProcessorError {
  fn from(err: SourceError) -> Self {
    match err {
      SourceError::Permanent(_) => ProcessorError::PermanentSource(err),
      SourceError::Transient(_) => ProcessorError::TransientSource {
        attempts: 1,
        last: err,
      },
    }
  }
}

/// A reported error together with where and when it happened.
#[derive(Debug)]
pub struct ErrorReport {
  /// When the error was observed.
  pub timestamp: DateTime<Utc>,
  /// Partition the error is scoped to, if any.
  pub partition_id: Option<PartitionId>,
  /// Event position the error refers to, if any.
  pub position: Option<u64>,
  /// Whether the reporting worker entered the `Faulted` state.
  pub faulted: bool,
  /// The error.
  pub error: ProcessorError,
}

impl ErrorReport {
  /// Creates a report scoped to a partition.
  pub fn partition(partition_id: PartitionId, error: impl Into<ProcessorError>) -> Self {
    Self {
      timestamp: Utc::now(),
      partition_id: Some(partition_id),
      position: None,
      faulted: false,
      error: error.into(),
    }
  }

  /// Creates a report not tied to any partition.
  pub fn general(error: impl Into<ProcessorError>) -> Self {
    Self {
      timestamp: Utc::now(),
      partition_id: None,
      position: None,
      faulted: false,
      error: error.into(),
    }
  }

  /// Attaches an event position.
  #[must_use]
  pub fn at(mut self, position: Option<u64>) -> Self {
    self.position = position;
    self
  }

  /// Marks the report as a worker fault.
  #[must_use]
  pub fn faulted(mut self) -> Self {
    self.faulted = true;
    self
  }
}

impl fmt::Display for ErrorReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.partition_id {
      Some(p) => write!(f, "[partition {}] {}", p, self.error),
      None => write!(f, "{}", self.error),
    }
  }
}

/// Action to take after a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
  /// Fault the partition.
  Stop,
  /// Move past the failed batch.
  Skip,
  /// Dispatch the same batch again.
  Retry,
}

type CustomHandlerPolicy = Arc<dyn Fn(&HandlerError, usize) -> ErrorAction + Send + Sync>;

/// Policy applied when the event handler fails on a batch.
#[derive(Default)]
pub enum HandlerPolicy {
  /// Report and continue after the failed batch.
  #[default]
  Skip,
  /// Retry the batch up to this many times, then skip.
  Retry(usize),
  /// Fault the partition.
  Stop,
  /// Decide from the error and the number of retries already made.
  Custom(CustomHandlerPolicy),
}

impl HandlerPolicy {
  /// Creates a custom policy.
  pub fn custom<F>(f: F) -> Self
  where
    F: Fn(&HandlerError, usize) -> ErrorAction + Send + Sync + 'static,
  {
    HandlerPolicy::Custom(Arc::new(f))
  }

  /// Decides what to do after `retries` retries of a batch have already failed.
  pub fn decide(&self, error: &HandlerError, retries: usize) -> ErrorAction {
    match self {
      HandlerPolicy::Skip => ErrorAction::Skip,
      HandlerPolicy::Retry(n) if retries < *n => ErrorAction::Retry,
      HandlerPolicy::Retry(_) => ErrorAction::Skip,
      HandlerPolicy::Stop => ErrorAction::Stop,
      HandlerPolicy::Custom(f) => f(error, retries),
    }
  }
}

impl Clone for HandlerPolicy {
  fn clone(&self) -> Self {
    match self {
      HandlerPolicy::Skip => HandlerPolicy::Skip,
      HandlerPolicy::Retry(n) => HandlerPolicy::Retry(*n),
      HandlerPolicy::Stop => HandlerPolicy::Stop,
      HandlerPolicy::Custom(f) => HandlerPolicy::Custom(f.clone()),
    }
  }
}

impl fmt::Debug for HandlerPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HandlerPolicy::Skip => write!(f, "HandlerPolicy::Skip"),
      HandlerPolicy::Retry(n) => write!(f, "HandlerPolicy::Retry({})", n),
      HandlerPolicy::Stop => write!(f, "HandlerPolicy::Stop"),
      HandlerPolicy::Custom(_) => write!(f, "HandlerPolicy::Custom"),
    }
  }
}
