//! The event transport as seen by the processor: an ordered log per
//! partition that can be read in batches from a position.

use crate::error::SourceError;
use crate::partition::PartitionId;
use crate::position::ReadPosition;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// One event read from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
  /// Sequence position within the partition.
  pub position: u64,
  /// When the transport accepted the event.
  pub enqueued_time: DateTime<Utc>,
  /// Key the publisher used to pick the partition, if any.
  pub partition_key: Option<String>,
  /// Application properties.
  pub properties: HashMap<String, String>,
  /// Payload.
  pub body: Bytes,
}

impl Event {
  /// Creates an event with a body and no properties.
  pub fn new(position: u64, body: impl Into<Bytes>) -> Self {
    Self {
      position,
      enqueued_time: Utc::now(),
      partition_key: None,
      properties: HashMap::new(),
      body: body.into(),
    }
  }

  /// Adds an application property.
  #[must_use]
  pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.properties.insert(key.into(), value.into());
    self
  }

  /// Body as UTF-8, if it is valid UTF-8.
  pub fn body_as_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.body).ok()
  }

  /// Deserializes a JSON body.
  pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_slice(&self.body)
  }
}

/// Ordered events from one partition plus where the next read resumes.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
  /// Partition the events belong to.
  pub partition_id: PartitionId,
  /// Events in position order.
  pub events: Vec<Event>,
  /// Position to pass to the next fetch.
  pub next_position: ReadPosition,
}

impl EventBatch {
  /// Whether the batch carries no events.
  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }

  /// Number of events.
  pub fn len(&self) -> usize {
    self.events.len()
  }

  /// Position of the first event.
  pub fn first_position(&self) -> Option<u64> {
    self.events.first().map(|e| e.position)
  }

  /// Position of the last event; what a checkpoint after this batch records.
  pub fn last_position(&self) -> Option<u64> {
    self.events.last().map(|e| e.position)
  }
}

/// Read access to a partitioned event stream.
#[async_trait]
pub trait PartitionSource: Send + Sync + fmt::Debug {
  /// Lists the partitions of the stream.
  async fn partition_ids(&self) -> Result<Vec<PartitionId>, SourceError>;

  /// Reads up to `max_events` events starting at `from`, waiting up to
  /// `max_wait` for at least one. Returns an empty batch if none arrive.
  async fn fetch(
    &self,
    partition_id: &PartitionId,
    from: ReadPosition,
    max_events: usize,
    max_wait: Duration,
  ) -> Result<EventBatch, SourceError>;
}

#[derive(Debug, Default)]
struct PartitionLog {
  events: Vec<Event>,
  next_position: u64,
  faults: VecDeque<SourceError>,
  fetches: usize,
}

impl PartitionLog {
  fn resolve(&self, from: ReadPosition) -> u64 {
    match from {
      ReadPosition::Earliest => self.events.first().map(|e| e.position).unwrap_or(self.next_position),
      ReadPosition::Latest => self.next_position,
      ReadPosition::Sequence(n) => n,
    }
  }

  fn read(&self, start: u64, max_events: usize) -> Vec<Event> {
    let idx = self.events.partition_point(|e| e.position < start);
    self.events[idx..].iter().take(max_events).cloned().collect()
  }
}

/// In-memory partition source.
///
/// Clones share state. Events are numbered per partition starting at zero
/// (or at the value given to [`with_start_position`](Self::with_start_position)).
/// Errors queued with [`inject_fault`](Self::inject_fault) are returned by the
/// next fetches of that partition, one per fetch.
#[derive(Debug, Clone)]
pub struct InMemoryPartitionSource {
  logs: Arc<Mutex<BTreeMap<PartitionId, PartitionLog>>>,
  notify: Arc<Notify>,
}

impl InMemoryPartitionSource {
  /// Creates a source with partitions `"0"..count`.
  pub fn new(count: u32) -> Self {
    Self::with_partitions((0..count).map(PartitionId::from))
  }

  /// Creates a source with the given partitions.
  pub fn with_partitions(ids: impl IntoIterator<Item = PartitionId>) -> Self {
    let logs = ids.into_iter().map(|id| (id, PartitionLog::default())).collect();
    Self {
      logs: Arc::new(Mutex::new(logs)),
      notify: Arc::new(Notify::new()),
    }
  }

  /// Makes the next published event of `partition_id` get `position`.
  pub async fn with_start_position(self, partition_id: &PartitionId, position: u64) -> Self {
    if let Some(log) = self.logs.lock().await.get_mut(partition_id) {
      log.next_position = position;
    }
    self
  }

  /// Appends an event; returns its position, or `None` for an unknown partition.
  pub async fn publish(&self, partition_id: &PartitionId, body: impl Into<Bytes>) -> Option<u64> {
    let position = {
      let mut logs = self.logs.lock().await;
      let log = logs.get_mut(partition_id)?;
      let position = log.next_position;
      log.events.push(Event::new(position, body));
      log.next_position += 1;
      position
    };
    self.notify.notify_waiters();
    Some(position)
  }

  /// Appends `count` events with bodies `"<partition>-<position>"`.
  pub async fn publish_many(&self, partition_id: &PartitionId, count: usize) {
    for _ in 0..count {
      let next = {
        let logs = self.logs.lock().await;
        logs.get(partition_id).map(|l| l.next_position)
      };
      match next {
        Some(n) => {
          self.publish(partition_id, format!("{}-{}", partition_id, n)).await;
        }
        None => return,
      }
    }
  }

  /// Queues an error for the next fetch of `partition_id`.
  pub async fn inject_fault(&self, partition_id: &PartitionId, error: SourceError) {
    if let Some(log) = self.logs.lock().await.get_mut(partition_id) {
      log.faults.push_back(error);
    }
  }

  /// Number of fetches issued against `partition_id`.
  pub async fn fetch_count(&self, partition_id: &PartitionId) -> usize {
    self.logs.lock().await.get(partition_id).map(|l| l.fetches).unwrap_or(0)
  }

  /// Position the next published event of `partition_id` will get.
  pub async fn tail(&self, partition_id: &PartitionId) -> Option<u64> {
    self.logs.lock().await.get(partition_id).map(|l| l.next_position)
  }
}

#[async_trait]
impl PartitionSource for InMemoryPartitionSource {
  async fn partition_ids(&self) -> Result<Vec<PartitionId>, SourceError> {
    Ok(self.logs.lock().await.keys().cloned().collect())
  }

  async fn fetch(
    &self,
    partition_id: &PartitionId,
    from: ReadPosition,
    max_events: usize,
    max_wait: Duration,
  ) -> Result<EventBatch, SourceError> {
    let deadline = tokio::time::Instant::now() + max_wait;
    let start = {
      let mut logs = self.logs.lock().await;
      let log = logs
        .get_mut(partition_id)
        .ok_or_else(|| SourceError::Permanent(format!("unknown partition {}", partition_id)))?;
      log.fetches += 1;
      if let Some(fault) = log.faults.pop_front() {
        return Err(fault);
      }
      log.resolve(from)
    };

    loop {
      // Register interest before checking so a publish in between is not missed.
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let events = {
        let logs = self.logs.lock().await;
        logs
          .get(partition_id)
          .map(|log| log.read(start, max_events))
          .unwrap_or_default()
      };
      if !events.is_empty() || tokio::time::Instant::now() >= deadline {
        let next_position = events
          .last()
          .map(|e| ReadPosition::after(e.position))
          .unwrap_or(ReadPosition::Sequence(start));
        return Ok(EventBatch {
          partition_id: partition_id.clone(),
          events,
          next_position,
        });
      }
      let _ = tokio::time::timeout_at(deadline, notified).await;
    }
  }
}
