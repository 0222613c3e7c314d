//! Startup configuration.
//!
//! Raw settings ([`ProcessorSettings`], [`HostSettings`]) are plain strings
//! as they arrive from the environment or a config file. They are turned into
//! validated [`ProcessorConfig`] values by a single pure `validate` call that
//! runs before any component starts; a malformed connection string or a
//! missing name fails startup with a [`ConfigError`] naming the field.

use crate::error::HandlerPolicy;
use crate::partition::{DEFAULT_CONSUMER_GROUP, HubScope};
use crate::position::{CheckpointPolicy, StartPosition};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the shared storage container name.
pub const CONTAINER_VAR: &str = "BLOB_CONTAINER";

/// Configuration errors. Always fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  /// A required setting is absent or blank.
  #[error("configuration error: {field} is not configured")]
  Missing {
    /// Setting name.
    field: String,
  },
  /// A connection string could not be used.
  #[error("invalid connection string for {field}: {reason}")]
  MalformedConnectionString {
    /// Setting name.
    field: String,
    /// What is wrong with it.
    reason: String,
  },
  /// A tuning option is out of range.
  #[error("invalid option {field}: {reason}")]
  InvalidOption {
    /// Option name.
    field: String,
    /// What is wrong with it.
    reason: String,
  },
}

fn malformed(field: &str, reason: impl Into<String>) -> ConfigError {
  ConfigError::MalformedConnectionString {
    field: field.to_string(),
    reason: reason.into(),
  }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
  ConfigError::InvalidOption {
    field: field.to_string(),
    reason: reason.into(),
  }
}

/// A parsed `Endpoint=…;SharedAccessKeyName=…;SharedAccessKey=…` descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
  /// Service endpoint URI.
  pub endpoint: String,
  /// Shared access policy name.
  pub shared_access_key_name: String,
  /// Shared access key.
  pub shared_access_key: String,
  /// Hub name embedded in the descriptor, if any.
  pub entity_path: Option<String>,
}

impl ConnectionString {
  /// Parses a descriptor. `field` names the setting in error messages.
  pub fn parse(field: &str, raw: &str) -> Result<Self, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(ConfigError::Missing {
        field: field.to_string(),
      });
    }

    let mut parts: BTreeMap<String, String> = BTreeMap::new();
    for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
      let (key, value) = segment
        .split_once('=')
        .ok_or_else(|| malformed(field, "expected Key=Value segments separated by ';'"))?;
      parts.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let mut take = |key: &str, display: &str| -> Result<String, ConfigError> {
      parts
        .remove(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| malformed(field, format!("missing {}", display)))
    };

    let endpoint = take("endpoint", "Endpoint")?;
    let shared_access_key_name = take("sharedaccesskeyname", "SharedAccessKeyName")?;
    let shared_access_key = take("sharedaccesskey", "SharedAccessKey")?;
    let entity_path = parts.remove("entitypath").filter(|v| !v.is_empty());

    match endpoint.split_once("://") {
      Some((scheme, host)) if !scheme.is_empty() && !host.trim_end_matches('/').is_empty() => {}
      _ => return Err(malformed(field, "Endpoint must be a URI such as sb://<namespace>/")),
    }

    Ok(Self {
      endpoint,
      shared_access_key_name,
      shared_access_key,
      entity_path,
    })
  }

  /// Host part of the endpoint, e.g. `ns.servicebus.windows.net`.
  pub fn namespace(&self) -> &str {
    self
      .endpoint
      .split_once("://")
      .map(|(_, rest)| rest.trim_end_matches('/'))
      .unwrap_or(&self.endpoint)
  }
}

impl fmt::Debug for ConnectionString {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionString")
      .field("endpoint", &self.endpoint)
      .field("shared_access_key_name", &self.shared_access_key_name)
      .field("shared_access_key", &"<redacted>")
      .field("entity_path", &self.entity_path)
      .finish()
  }
}

/// Retry behaviour for transient source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts before the partition faults, including the first.
  pub max_attempts: u32,
  /// Delay before the first retry; doubles on each further retry.
  pub base_backoff: Duration,
  /// Upper bound on any single delay.
  pub max_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_backoff: Duration::from_millis(200),
      max_backoff: Duration::from_secs(5),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (1-based), with up to 20% jitter.
  pub fn backoff(&self, retry: u32) -> Duration {
    let exp = self
      .base_backoff
      .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
    let capped = exp.min(self.max_backoff);
    let jitter = rand::random::<f64>() * 0.2;
    capped.mul_f64(1.0 - jitter)
  }
}

/// Tunables shared by every processor. All have working defaults.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
  /// Time between rebalance cycles.
  pub rebalance_interval: Duration,
  /// How long an unrenewed lease stays valid.
  pub lease_duration: Duration,
  /// Time between lease renewals; must be shorter than `lease_duration`.
  pub renew_interval: Duration,
  /// Maximum events per batch.
  pub max_batch_size: usize,
  /// How long a fetch waits for events before returning an empty batch.
  pub max_wait_time: Duration,
  /// Hard bound on a single fetch call.
  pub fetch_timeout: Duration,
  /// Where partitions without a checkpoint start.
  pub start_position: StartPosition,
  /// When checkpoints are written.
  pub checkpoint_policy: CheckpointPolicy,
  /// What happens after a handler failure.
  pub handler_policy: HandlerPolicy,
  /// Retry behaviour for transient source errors.
  pub source_retry: RetryPolicy,
  /// How long shutdown waits for workers to drain.
  pub shutdown_grace: Duration,
}

impl Default for ProcessorOptions {
  fn default() -> Self {
    Self {
      rebalance_interval: Duration::from_secs(10),
      lease_duration: Duration::from_secs(30),
      renew_interval: Duration::from_secs(10),
      max_batch_size: 100,
      max_wait_time: Duration::from_secs(1),
      fetch_timeout: Duration::from_secs(5),
      start_position: StartPosition::Earliest,
      checkpoint_policy: CheckpointPolicy::EveryBatch,
      handler_policy: HandlerPolicy::Skip,
      source_retry: RetryPolicy::default(),
      shutdown_grace: Duration::from_secs(30),
    }
  }
}

impl ProcessorOptions {
  /// Sets the rebalance interval.
  #[must_use]
  pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
    self.rebalance_interval = interval;
    self
  }

  /// Sets lease duration and renewal interval together.
  #[must_use]
  pub fn with_lease(mut self, duration: Duration, renew_interval: Duration) -> Self {
    self.lease_duration = duration;
    self.renew_interval = renew_interval;
    self
  }

  /// Sets batch size and wait time.
  #[must_use]
  pub fn with_batch(mut self, max_batch_size: usize, max_wait_time: Duration) -> Self {
    self.max_batch_size = max_batch_size;
    self.max_wait_time = max_wait_time;
    self
  }

  /// Sets the start position.
  #[must_use]
  pub fn with_start_position(mut self, start: StartPosition) -> Self {
    self.start_position = start;
    self
  }

  /// Sets the checkpoint policy.
  #[must_use]
  pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
    self.checkpoint_policy = policy;
    self
  }

  /// Sets the handler failure policy.
  #[must_use]
  pub fn with_handler_policy(mut self, policy: HandlerPolicy) -> Self {
    self.handler_policy = policy;
    self
  }

  /// Sets the source retry policy.
  #[must_use]
  pub fn with_source_retry(mut self, retry: RetryPolicy) -> Self {
    self.source_retry = retry;
    self
  }

  /// Sets the shutdown grace period.
  #[must_use]
  pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  /// Options suited to tests: millisecond intervals, short leases.
  pub fn for_testing() -> Self {
    Self {
      rebalance_interval: Duration::from_millis(50),
      lease_duration: Duration::from_millis(600),
      renew_interval: Duration::from_millis(100),
      max_batch_size: 10,
      max_wait_time: Duration::from_millis(20),
      fetch_timeout: Duration::from_millis(500),
      source_retry: RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
      },
      shutdown_grace: Duration::from_secs(5),
      ..Self::default()
    }
  }

  /// How long a worker for a partition taken from a live owner waits before
  /// it starts reading.
  ///
  /// The previous owner notices the loss on its next renewal tick, and that
  /// renewal may itself run for up to one renew interval.
  pub fn handoff_delay(&self) -> Duration {
    self.renew_interval.saturating_mul(2)
  }

  /// Checks option ranges.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let nonzero = [
      ("rebalance_interval", self.rebalance_interval),
      ("lease_duration", self.lease_duration),
      ("renew_interval", self.renew_interval),
      ("fetch_timeout", self.fetch_timeout),
    ];
    for (field, value) in nonzero {
      if value.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
      }
    }
    if self.renew_interval >= self.lease_duration {
      return Err(invalid("renew_interval", "must be shorter than lease_duration"));
    }
    if self.max_batch_size == 0 {
      return Err(invalid("max_batch_size", "must be at least 1"));
    }
    if self.source_retry.max_attempts == 0 {
      return Err(invalid("source_retry.max_attempts", "must be at least 1"));
    }
    if let CheckpointPolicy::Periodic { events: 0, .. } = self.checkpoint_policy {
      return Err(invalid("checkpoint_policy.events", "must be at least 1"));
    }
    Ok(())
  }
}

/// Unvalidated settings for one processor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessorSettings {
  /// Event source connection string.
  #[serde(default)]
  pub connection_string: String,
  /// Event hub name.
  #[serde(default)]
  pub hub_name: String,
  /// Consumer group; blank means [`DEFAULT_CONSUMER_GROUP`].
  #[serde(default)]
  pub consumer_group: Option<String>,
  /// Durable store container/location.
  #[serde(default)]
  pub container: String,
  /// Tunables.
  #[serde(skip)]
  pub options: ProcessorOptions,
}

impl ProcessorSettings {
  /// Validates the settings. `name` prefixes field names in errors.
  pub fn validate(&self, name: &str) -> Result<ProcessorConfig, ConfigError> {
    let field = |f: &str| {
      if name.is_empty() {
        f.to_string()
      } else {
        format!("{}.{}", name, f)
      }
    };

    let connection = ConnectionString::parse(&field("connection_string"), &self.connection_string)?;
    let hub_name = required(&field("hub_name"), &self.hub_name)?;
    let container = required(&field("container"), &self.container)?;
    let consumer_group = self
      .consumer_group
      .as_deref()
      .map(str::trim)
      .filter(|g| !g.is_empty())
      .unwrap_or(DEFAULT_CONSUMER_GROUP)
      .to_string();

    if let Some(entity) = &connection.entity_path {
      if entity != &hub_name {
        return Err(malformed(
          &field("connection_string"),
          format!("EntityPath '{}' does not match hub name '{}'", entity, hub_name),
        ));
      }
    }
    self.options.validate()?;

    Ok(ProcessorConfig {
      connection,
      scope: HubScope::new(hub_name, consumer_group),
      container,
      options: self.options.clone(),
    })
  }
}

fn required(field: &str, value: &str) -> Result<String, ConfigError> {
  let value = value.trim();
  if value.is_empty() {
    Err(ConfigError::Missing {
      field: field.to_string(),
    })
  } else {
    Ok(value.to_string())
  }
}

/// Validated configuration for one processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
  /// Parsed connection string.
  pub connection: ConnectionString,
  /// Hub and consumer group.
  pub scope: HubScope,
  /// Durable store container/location.
  pub container: String,
  /// Tunables.
  pub options: ProcessorOptions,
}

/// Unvalidated settings for a host running several processors that share
/// one storage container.
#[derive(Debug, Clone, Default)]
pub struct HostSettings {
  /// Shared container.
  pub container: String,
  /// Per-stream settings keyed by stream name.
  pub streams: BTreeMap<String, ProcessorSettings>,
}

impl HostSettings {
  /// Reads settings for `streams` from process environment variables.
  ///
  /// For a stream named `plan` this reads `EVENT_HUB_PLAN_CONNECTION_STRING`
  /// and `EVENT_HUB_PLAN_NAME`; the container comes from `BLOB_CONTAINER`.
  pub fn from_env(streams: &[&str]) -> Self {
    Self::from_lookup(streams, |key| std::env::var(key).ok())
  }

  /// Like [`from_env`](Self::from_env) but reads through `lookup`.
  pub fn from_lookup<F>(streams: &[&str], lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let container = lookup(CONTAINER_VAR).unwrap_or_default();
    let streams = streams
      .iter()
      .map(|name| {
        let upper = name.to_ascii_uppercase();
        let settings = ProcessorSettings {
          connection_string: lookup(&format!("EVENT_HUB_{}_CONNECTION_STRING", upper)).unwrap_or_default(),
          hub_name: lookup(&format!("EVENT_HUB_{}_NAME", upper)).unwrap_or_default(),
          consumer_group: lookup(&format!("EVENT_HUB_{}_CONSUMER_GROUP", upper)),
          container: container.clone(),
          options: ProcessorOptions::default(),
        };
        (name.to_string(), settings)
      })
      .collect();
    Self { container, streams }
  }

  /// Applies the same options to every stream.
  #[must_use]
  pub fn with_options(mut self, options: ProcessorOptions) -> Self {
    for settings in self.streams.values_mut() {
      settings.options = options.clone();
    }
    self
  }

  /// Validates every stream, failing on the first problem.
  pub fn validate(&self) -> Result<BTreeMap<String, ProcessorConfig>, ConfigError> {
    if self.streams.is_empty() {
      return Err(ConfigError::Missing {
        field: "streams".to_string(),
      });
    }
    required(CONTAINER_VAR, &self.container)?;
    self
      .streams
      .iter()
      .map(|(name, settings)| Ok((name.clone(), settings.validate(name)?)))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  const VALID: &str =
    "Endpoint=sb://telecom.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=c2VjcmV0";

  fn settings(connection: &str, hub: &str) -> ProcessorSettings {
    ProcessorSettings {
      connection_string: connection.to_string(),
      hub_name: hub.to_string(),
      consumer_group: None,
      container: "checkpoints".to_string(),
      options: ProcessorOptions::default(),
    }
  }

  #[test]
  fn test_parse_valid_connection_string() {
    let conn = ConnectionString::parse("conn", VALID).unwrap();
    assert_eq!(conn.endpoint, "sb://telecom.servicebus.windows.net/");
    assert_eq!(conn.shared_access_key_name, "listen");
    assert_eq!(conn.namespace(), "telecom.servicebus.windows.net");
    assert_eq!(conn.entity_path, None);
  }

  #[test]
  fn test_parse_is_case_insensitive_on_keys() {
    let conn = ConnectionString::parse(
      "conn",
      "endpoint=sb://ns/;sharedaccesskeyname=a;sharedaccesskey=b;entitypath=usage",
    )
    .unwrap();
    assert_eq!(conn.entity_path.as_deref(), Some("usage"));
  }

  #[test]
  fn test_missing_fields_are_rejected() {
    let err = ConnectionString::parse("planConnectionString", "Endpoint=sb://ns/;SharedAccessKey=x").unwrap_err();
    assert_eq!(
      err,
      ConfigError::MalformedConnectionString {
        field: "planConnectionString".into(),
        reason: "missing SharedAccessKeyName".into(),
      }
    );

    let err = ConnectionString::parse("c", "SharedAccessKeyName=a;SharedAccessKey=b").unwrap_err();
    assert!(err.to_string().contains("missing Endpoint"));
  }

  #[test]
  fn test_blank_and_garbage_connection_strings() {
    assert!(matches!(
      ConnectionString::parse("c", "   "),
      Err(ConfigError::Missing { .. })
    ));
    assert!(matches!(
      ConnectionString::parse("c", "not a connection string"),
      Err(ConfigError::MalformedConnectionString { .. })
    ));
    assert!(matches!(
      ConnectionString::parse("c", "Endpoint=ns;SharedAccessKeyName=a;SharedAccessKey=b"),
      Err(ConfigError::MalformedConnectionString { .. })
    ));
  }

  #[test]
  fn test_debug_redacts_key() {
    let conn = ConnectionString::parse("c", VALID).unwrap();
    let debug = format!("{:?}", conn);
    assert!(!debug.contains("c2VjcmV0"));
    assert!(debug.contains("<redacted>"));
  }

  #[test]
  fn test_settings_default_consumer_group() {
    let config = settings(VALID, "usage").validate("usage").unwrap();
    assert_eq!(config.scope.consumer_group, DEFAULT_CONSUMER_GROUP);
    assert_eq!(config.scope.hub_name, "usage");
    assert_eq!(config.container, "checkpoints");
  }

  #[test]
  fn test_settings_missing_hub_name() {
    let err = settings(VALID, " ").validate("plan").unwrap_err();
    assert_eq!(
      err,
      ConfigError::Missing {
        field: "plan.hub_name".into()
      }
    );
  }

  #[test]
  fn test_entity_path_must_match_hub() {
    let conn = format!("{};EntityPath=plan", VALID);
    assert!(settings(&conn, "plan").validate("").is_ok());
    assert!(matches!(
      settings(&conn, "usage").validate(""),
      Err(ConfigError::MalformedConnectionString { .. })
    ));
  }

  #[test]
  fn test_options_validation() {
    assert!(ProcessorOptions::default().validate().is_ok());
    assert!(ProcessorOptions::for_testing().validate().is_ok());

    let bad = ProcessorOptions::default().with_lease(Duration::from_secs(10), Duration::from_secs(10));
    assert!(matches!(bad.validate(), Err(ConfigError::InvalidOption { .. })));

    let bad = ProcessorOptions::default().with_batch(0, Duration::from_secs(1));
    assert!(bad.validate().is_err());
  }

  #[test]
  fn test_retry_backoff_is_capped() {
    let retry = RetryPolicy {
      max_attempts: 10,
      base_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_millis(300),
    };
    assert!(retry.backoff(1) <= Duration::from_millis(100));
    assert!(retry.backoff(1) >= Duration::from_millis(80));
    assert!(retry.backoff(8) <= Duration::from_millis(300));
  }

  #[test]
  fn test_host_settings_from_lookup() {
    let env: HashMap<&str, &str> = HashMap::from([
      ("EVENT_HUB_PLAN_CONNECTION_STRING", VALID),
      ("EVENT_HUB_USAGE_CONNECTION_STRING", VALID),
      ("EVENT_HUB_PLAN_NAME", "phone-plan"),
      ("EVENT_HUB_USAGE_NAME", "usage"),
      ("BLOB_CONTAINER", "checkpoints"),
    ]);
    let host = HostSettings::from_lookup(&["plan", "usage"], |k| env.get(k).map(|v| v.to_string()));
    let configs = host.validate().unwrap();
    assert_eq!(configs.len(), 2);
    assert_eq!(configs["plan"].scope.hub_name, "phone-plan");
    assert_eq!(configs["usage"].container, "checkpoints");
  }

  #[test]
  fn test_host_settings_fail_fast_on_missing_container() {
    let env: HashMap<&str, &str> = HashMap::from([
      ("EVENT_HUB_PLAN_CONNECTION_STRING", VALID),
      ("EVENT_HUB_PLAN_NAME", "phone-plan"),
    ]);
    let host = HostSettings::from_lookup(&["plan"], |k| env.get(k).map(|v| v.to_string()));
    assert_eq!(
      host.validate().unwrap_err(),
      ConfigError::Missing {
        field: CONTAINER_VAR.into()
      }
    );
  }

  #[test]
  fn test_settings_deserialize() {
    let json = r#"{"connection_string": "x", "hub_name": "usage", "container": "c"}"#;
    let settings: ProcessorSettings = serde_json::from_str(json).unwrap();
    assert_eq!(settings.hub_name, "usage");
    assert!(settings.consumer_group.is_none());
  }
}
