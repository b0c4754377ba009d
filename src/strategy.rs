//! Replication strategies: given the candidate instances for a key, decide
//! which are usable and how many failures the caller may tolerate.

use crate::error::{Error, Result};
use crate::model::InstanceDesc;
use crate::operation::Operation;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Filters a candidate replica set down to its healthy members.
///
/// Implementations retain the healthy instances in `instances` (in their
/// original order) and return the number of failures the caller can
/// tolerate while still reaching quorum.
pub trait ReplicationStrategy: Send + Sync {
    fn filter(
        &self,
        instances: &mut Vec<InstanceDesc>,
        op: Operation,
        replication_factor: usize,
        heartbeat_timeout: Duration,
        zone_awareness_enabled: bool,
        storage_last_update: DateTime<Utc>,
    ) -> Result<usize>;
}

/// Quorum-based strategy: requires `RF/2 + 1` healthy instances, where RF is
/// grown to the candidate count when the replica set was extended.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultReplicationStrategy;

impl ReplicationStrategy for DefaultReplicationStrategy {
    fn filter(
        &self,
        instances: &mut Vec<InstanceDesc>,
        op: Operation,
        replication_factor: usize,
        heartbeat_timeout: Duration,
        _zone_awareness_enabled: bool,
        storage_last_update: DateTime<Utc>,
    ) -> Result<usize> {
        // The actual replica set might be bigger than the replication factor
        // when instances were joining or leaving, so quorum is computed over
        // the bigger of the two.
        let replication_factor = replication_factor.max(instances.len());
        let min_success = replication_factor / 2 + 1;

        // Unhealthy instances still count towards min_success, so too many of
        // them fail the whole operation.
        instances.retain(|i| i.is_healthy(op, heartbeat_timeout, storage_last_update));

        if instances.len() < min_success {
            return Err(Error::TooManyUnhealthyInstances);
        }

        Ok(instances.len() - min_success)
    }
}

/// Strategy that succeeds as long as a single candidate is healthy. Used by
/// rings whose callers can make progress with any one live instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreUnhealthyInstancesReplicationStrategy;

impl ReplicationStrategy for IgnoreUnhealthyInstancesReplicationStrategy {
    fn filter(
        &self,
        instances: &mut Vec<InstanceDesc>,
        op: Operation,
        _replication_factor: usize,
        heartbeat_timeout: Duration,
        _zone_awareness_enabled: bool,
        storage_last_update: DateTime<Utc>,
    ) -> Result<usize> {
        instances.retain(|i| i.is_healthy(op, heartbeat_timeout, storage_last_update));

        if instances.is_empty() {
            return Err(Error::TooManyUnhealthyInstances);
        }

        Ok(instances.len() - 1)
    }
}
