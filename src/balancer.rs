//! Greedy fair-share load balancing over ownership records.
//!
//! Each cycle reads every lease, works out this instance's fair share and
//! closes the gap: claiming available partitions, stealing from overloaded
//! owners when nothing is available, or releasing partitions it holds beyond
//! its share. Every claim is a single conditional write; losing a race is
//! normal and simply moves on to the next candidate.
//!
//! Instances only know about each other through leases, so the instance
//! count is estimated as the distinct owners of unexpired leases plus self.

use crate::error::{ProcessorError, StoreError};
use crate::ownership::{OwnershipRecord, OwnershipStore};
use crate::partition::{HubScope, PartitionId};
use crate::source::PartitionSource;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one balancing cycle intends to do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BalancePlan {
  /// Partitions in the stream.
  pub total_partitions: usize,
  /// Estimated number of active instances, self included.
  pub active_instances: usize,
  /// Number of partitions this instance should end up with.
  pub target: usize,
  /// Leases this instance currently holds.
  pub owned: Vec<OwnershipRecord>,
  /// Unowned or expired partitions, in claim order.
  pub candidates: Vec<OwnershipRecord>,
  /// How many of `candidates` to claim.
  pub claim_budget: usize,
  /// Leases to take over from overloaded owners.
  pub steals: Vec<OwnershipRecord>,
  /// Owned partitions to give up.
  pub release: Vec<PartitionId>,
}

/// Computes a balancing plan from the current leases.
///
/// `live` lists partitions this instance is actively processing; their
/// records count as owned even if a renewal is running late.
pub fn plan_ownership(
  scope: &HubScope,
  instance_id: &str,
  partition_ids: &[PartitionId],
  records: &[OwnershipRecord],
  live: &HashSet<PartitionId>,
  now: DateTime<Utc>,
  lease_duration: Duration,
) -> BalancePlan {
  let total = partition_ids.len();
  if total == 0 {
    return BalancePlan::default();
  }

  let known: HashSet<&PartitionId> = partition_ids.iter().collect();
  let by_partition: BTreeMap<&PartitionId, &OwnershipRecord> = records
    .iter()
    .filter(|r| known.contains(&r.partition_id))
    .map(|r| (&r.partition_id, r))
    .collect();

  let mut owned = Vec::new();
  let mut others: BTreeMap<&str, Vec<OwnershipRecord>> = BTreeMap::new();
  let mut candidates = Vec::new();

  for partition_id in partition_ids {
    match by_partition.get(partition_id) {
      Some(record)
        if record.owner_id == instance_id
          && (live.contains(partition_id) || record.is_fresh(now, lease_duration)) =>
      {
        owned.push((*record).clone());
      }
      Some(record) if record.is_active(now, lease_duration) => {
        others.entry(record.owner_id.as_str()).or_default().push((*record).clone());
      }
      Some(record) => candidates.push((*record).clone()),
      None => candidates.push(OwnershipRecord::claim(scope.clone(), partition_id.clone(), "")),
    }
  }

  // Longest-untouched first, then ascending partition id.
  candidates.sort_by(|a, b| {
    a.last_modified
      .cmp(&b.last_modified)
      .then_with(|| a.partition_id.cmp(&b.partition_id))
  });

  let active = others.len() + 1;
  let min_share = total / active;
  let extra = total % active;
  let others_above_min = others.values().filter(|v| v.len() > min_share).count();
  let target = if extra > others_above_min { min_share + 1 } else { min_share };
  let max_share = if extra > 0 { min_share + 1 } else { min_share };

  let mut plan = BalancePlan {
    total_partitions: total,
    active_instances: active,
    target,
    ..BalancePlan::default()
  };

  let mine = owned.len();
  if mine > target {
    let mut release: Vec<PartitionId> = owned.iter().map(|r| r.partition_id.clone()).collect();
    release.sort_by(|a, b| b.cmp(a));
    release.truncate(mine - target);
    plan.release = release;
  } else if mine < target {
    let deficit = target - mine;
    plan.claim_budget = deficit.min(candidates.len());
    let mut projected = mine + plan.claim_budget;

    // Victims lose their least recently renewed partitions first.
    for leases in others.values_mut() {
      leases.sort_by(|a, b| {
        b.last_modified
          .cmp(&a.last_modified)
          .then_with(|| b.partition_id.cmp(&a.partition_id))
      });
    }
    while projected < target {
      let limit = if projected < min_share { min_share } else { max_share };
      let victim = others
        .iter_mut()
        .filter(|(_, leases)| leases.len() > limit)
        .max_by(|(a_id, a), (b_id, b)| a.len().cmp(&b.len()).then_with(|| b_id.cmp(a_id)));
      match victim.and_then(|(_, leases)| leases.pop()) {
        Some(record) => {
          plan.steals.push(record);
          projected += 1;
        }
        None => break,
      }
    }
  }

  plan.owned = owned;
  plan.candidates = candidates;
  plan
}

/// Result of executing a plan against the store.
#[derive(Debug, Clone, Default)]
pub struct RebalanceOutcome {
  /// The plan that was executed.
  pub plan: BalancePlan,
  /// Leases held after the cycle, including new claims and steals, excluding
  /// partitions to release.
  pub owned: Vec<OwnershipRecord>,
  /// Leases newly acquired this cycle.
  pub claimed: Vec<OwnershipRecord>,
  /// Claimed partitions that were taken from a live owner.
  pub stolen: Vec<PartitionId>,
  /// Partitions to give up.
  pub release: Vec<PartitionId>,
}

/// Runs balancing cycles for one instance.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
  instance_id: String,
  scope: HubScope,
  lease_duration: Duration,
  ownership: Arc<dyn OwnershipStore>,
  source: Arc<dyn PartitionSource>,
}

impl LoadBalancer {
  /// Creates a balancer.
  pub fn new(
    instance_id: impl Into<String>,
    scope: HubScope,
    lease_duration: Duration,
    ownership: Arc<dyn OwnershipStore>,
    source: Arc<dyn PartitionSource>,
  ) -> Self {
    Self {
      instance_id: instance_id.into(),
      scope,
      lease_duration,
      ownership,
      source,
    }
  }

  /// Runs one cycle: read leases, plan, claim.
  pub async fn rebalance(&self, live: &HashSet<PartitionId>) -> Result<RebalanceOutcome, ProcessorError> {
    let partition_ids = self.source.partition_ids().await?;
    let records = self.ownership.list_ownership(&self.scope).await?;
    let plan = plan_ownership(
      &self.scope,
      &self.instance_id,
      &partition_ids,
      &records,
      live,
      Utc::now(),
      self.lease_duration,
    );

    debug!(
      hub = %self.scope,
      owner_id = %self.instance_id,
      partitions = plan.total_partitions,
      instances = plan.active_instances,
      owned = plan.owned.len(),
      target = plan.target,
      "balancing"
    );

    let mut claimed = Vec::new();
    for candidate in &plan.candidates {
      if claimed.len() >= plan.claim_budget {
        break;
      }
      match self.try_claim(candidate).await? {
        Some(record) => claimed.push(record),
        None => continue,
      }
    }
    let mut stolen = Vec::new();
    for victim in &plan.steals {
      if let Some(record) = self.try_claim(victim).await? {
        info!(
          partition_id = %record.partition_id,
          previous_owner = %victim.owner_id,
          "stole partition from overloaded owner"
        );
        stolen.push(record.partition_id.clone());
        claimed.push(record);
      }
    }

    let release: HashSet<&PartitionId> = plan.release.iter().collect();
    let owned = plan
      .owned
      .iter()
      .filter(|r| !release.contains(&r.partition_id))
      .chain(claimed.iter())
      .cloned()
      .collect();

    Ok(RebalanceOutcome {
      release: plan.release.clone(),
      plan,
      owned,
      claimed,
      stolen,
    })
  }

  /// One conditional claim. Conflicts yield `None`; other store errors end the cycle.
  async fn try_claim(&self, record: &OwnershipRecord) -> Result<Option<OwnershipRecord>, ProcessorError> {
    let request = record.with_owner(self.instance_id.clone());
    match self
      .ownership
      .claim_ownership(&request, record.version.as_ref())
      .await
    {
      Ok(written) => {
        debug!(partition_id = %written.partition_id, owner_id = %self.instance_id, "claimed partition");
        Ok(Some(written))
      }
      Err(StoreError::Conflict { key }) => {
        debug!(key = %key, "claim lost to another instance");
        Ok(None)
      }
      Err(e) => {
        warn!(partition_id = %record.partition_id, error = %e, "claim failed");
        Err(e.into())
      }
    }
  }
}
