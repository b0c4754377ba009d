//! Ring descriptor model: instances, their states and tokens, plus the
//! derived views the ring core is built on.

use crate::operation::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle state of a ring member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Registered but not yet serving
    Pending = 0,
    /// Transferring in tokens/data
    Joining = 1,
    /// Fully serving reads and writes
    Active = 2,
    /// Transferring out before shutdown
    Leaving = 3,
    /// Tombstoned; never part of any replica set
    Left = 4,
    /// Serving reads only
    ReadOnly = 5,
}

impl InstanceState {
    /// Every state, in discriminant order.
    pub const ALL: [InstanceState; 6] = [
        InstanceState::Pending,
        InstanceState::Joining,
        InstanceState::Active,
        InstanceState::Leaving,
        InstanceState::Left,
        InstanceState::ReadOnly,
    ];

    /// Upper-case state name, used as a metrics label value.
    pub fn name(self) -> &'static str {
        match self {
            InstanceState::Pending => "PENDING",
            InstanceState::Joining => "JOINING",
            InstanceState::Active => "ACTIVE",
            InstanceState::Leaving => "LEAVING",
            InstanceState::Left => "LEFT",
            InstanceState::ReadOnly => "READONLY",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single ring member: its address, state, zone, timestamps and the
/// tokens it owns on the hash ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    pub state: InstanceState,
    pub zone: String,
    /// Unix seconds at which the instance first registered.
    pub registered_timestamp: i64,
    /// Unix seconds of the last heartbeat written by the instance.
    pub heartbeat_timestamp: i64,
    /// Ring positions owned by this instance, sorted ascending.
    pub tokens: Vec<u32>,
}

impl InstanceDesc {
    /// Returns whether the instance can serve the given operation: its state
    /// must be healthy for the op and its heartbeat must be fresh.
    pub fn is_healthy(
        &self,
        op: Operation,
        heartbeat_timeout: Duration,
        storage_last_update: DateTime<Utc>,
    ) -> bool {
        op.is_instance_in_state_healthy(self.state)
            && self.is_heartbeat_healthy(heartbeat_timeout, storage_last_update)
    }

    /// Returns whether the heartbeat is within the timeout. A zero timeout
    /// disables the check. The heartbeat is compared against
    /// `max(heartbeat, storage_last_update)` so that a KV store which just
    /// resynchronized after an outage doesn't make the whole fleet look stale.
    pub fn is_heartbeat_healthy(
        &self,
        heartbeat_timeout: Duration,
        storage_last_update: DateTime<Utc>,
    ) -> bool {
        if heartbeat_timeout.is_zero() {
            return true;
        }
        let last_seen = self.heartbeat_timestamp.max(storage_last_update.timestamp());
        Utc::now().timestamp() - last_seen <= heartbeat_timeout.as_secs() as i64
    }
}

/// Owner of a token: the instance id and its zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub zone: String,
}

/// Outcome of comparing two descriptors, used to decide how much derived
/// state must be rebuilt after a KV update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    /// Nothing changed
    Equal,
    /// Only states and heartbeat timestamps changed
    EqualButStatesAndTimestamps,
    /// Same topology, but an instance moved into or out of READONLY
    EqualButReadOnly,
    /// Instance set, addresses, zones or tokens changed
    Different,
}

/// The authoritative ring descriptor: every registered instance keyed by id.
///
/// The descriptor is what the KV store holds; the ring core only reads it
/// through the accessors below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Desc {
    ingesters: HashMap<String, InstanceDesc>,
}

impl Desc {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_instances(ingesters: HashMap<String, InstanceDesc>) -> Self {
        Self { ingesters }
    }

    /// Registers an instance with the given tokens, stamping the heartbeat
    /// with the current time.
    pub fn add_ingester(
        &mut self,
        id: impl Into<String>,
        addr: impl Into<String>,
        zone: impl Into<String>,
        tokens: Vec<u32>,
        state: InstanceState,
        registered_timestamp: i64,
    ) {
        let id = id.into();
        self.ingesters.insert(
            id.clone(),
            InstanceDesc {
                id,
                addr: addr.into(),
                state,
                zone: zone.into(),
                registered_timestamp,
                heartbeat_timestamp: Utc::now().timestamp(),
                tokens,
            },
        );
    }

    /// Inserts a fully specified instance, keyed by its id.
    pub fn insert(&mut self, instance: InstanceDesc) {
        self.ingesters.insert(instance.id.clone(), instance);
    }

    pub fn remove_ingester(&mut self, id: &str) -> Option<InstanceDesc> {
        self.ingesters.remove(id)
    }

    /// Drops every instance for which the predicate returns false.
    pub fn retain(&mut self, mut f: impl FnMut(&InstanceDesc) -> bool) {
        self.ingesters.retain(|_, instance| f(instance));
    }

    pub fn get(&self, id: &str) -> Option<&InstanceDesc> {
        self.ingesters.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ingesters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ingesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ingesters.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceDesc> {
        self.ingesters.values()
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &String> {
        self.ingesters.keys()
    }

    pub(crate) fn instances_mut(&mut self) -> impl Iterator<Item = &mut InstanceDesc> {
        self.ingesters.values_mut()
    }

    /// The union of every instance's tokens, sorted ascending. Token
    /// uniqueness across instances is the writer's responsibility.
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self
            .ingesters
            .values()
            .flat_map(|i| i.tokens.iter().copied())
            .collect();
        tokens.sort_unstable();
        tokens
    }

    /// Per-zone sorted token lists.
    pub fn tokens_by_zone(&self) -> HashMap<String, Vec<u32>> {
        let mut by_zone: HashMap<String, Vec<u32>> = HashMap::new();
        for instance in self.ingesters.values() {
            by_zone
                .entry(instance.zone.clone())
                .or_default()
                .extend(instance.tokens.iter().copied());
        }
        for tokens in by_zone.values_mut() {
            tokens.sort_unstable();
        }
        by_zone
    }

    /// Maps every token to its owning instance. Every token returned by
    /// [`Desc::tokens`] is a key of this map.
    pub fn tokens_info(&self) -> HashMap<u32, InstanceInfo> {
        let mut info = HashMap::new();
        for (id, instance) in &self.ingesters {
            for token in &instance.tokens {
                info.insert(
                    *token,
                    InstanceInfo {
                        instance_id: id.clone(),
                        zone: instance.zone.clone(),
                    },
                );
            }
        }
        info
    }

    /// Maps instance addresses back to instance ids.
    pub fn instances_by_addr(&self) -> HashMap<String, String> {
        self.ingesters
            .iter()
            .map(|(id, instance)| (instance.addr.clone(), id.clone()))
            .collect()
    }

    /// Classifies the difference between `self` and `next`, so callers can
    /// skip rebuilding token views when the topology is unchanged. State and
    /// heartbeat changes don't count as topology; READONLY transitions are
    /// reported separately because they change replica-set extension.
    pub fn ring_compare(&self, next: &Desc) -> CompareResult {
        if self.ingesters.len() != next.ingesters.len() {
            return CompareResult::Different;
        }

        let mut equal_states_and_timestamps = true;
        let mut equal_read_only = true;

        for (id, instance) in &self.ingesters {
            let Some(other) = next.ingesters.get(id) else {
                return CompareResult::Different;
            };

            if instance.addr != other.addr
                || instance.zone != other.zone
                || instance.registered_timestamp != other.registered_timestamp
                || instance.tokens != other.tokens
            {
                return CompareResult::Different;
            }

            if instance.heartbeat_timestamp != other.heartbeat_timestamp {
                equal_states_and_timestamps = false;
            }
            if instance.state != other.state {
                equal_states_and_timestamps = false;
                if instance.state == InstanceState::ReadOnly
                    || other.state == InstanceState::ReadOnly
                {
                    equal_read_only = false;
                }
            }
        }

        if equal_states_and_timestamps {
            CompareResult::Equal
        } else if !equal_read_only {
            CompareResult::EqualButReadOnly
        } else {
            CompareResult::EqualButStatesAndTimestamps
        }
    }
}

/// Returns the zones with at least one instance, sorted alphabetically.
/// Shuffle sharding iterates zones in this order for determinism.
pub(crate) fn zones_of(tokens_by_zone: &HashMap<String, Vec<u32>>) -> Vec<String> {
    let mut zones: Vec<String> = tokens_by_zone.keys().cloned().collect();
    zones.sort();
    zones
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, zone: &str, tokens: Vec<u32>) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: format!("10.0.0.{}:9095", id.len()),
            state: InstanceState::Active,
            zone: zone.to_string(),
            registered_timestamp: 100,
            heartbeat_timestamp: Utc::now().timestamp(),
            tokens,
        }
    }

    fn three_instance_desc() -> Desc {
        let mut desc = Desc::new();
        desc.insert(instance("ing-1", "zone-a", vec![10, 40]));
        desc.insert(instance("ing-2", "zone-b", vec![20, 50]));
        desc.insert(instance("ing-3", "zone-a", vec![30]));
        desc
    }

    #[test]
    fn tokens_are_sorted_union() {
        let desc = three_instance_desc();
        assert_eq!(desc.tokens(), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn tokens_by_zone_sorted_per_zone() {
        let desc = three_instance_desc();
        let by_zone = desc.tokens_by_zone();

        assert_eq!(by_zone["zone-a"], vec![10, 30, 40]);
        assert_eq!(by_zone["zone-b"], vec![20, 50]);
        assert_eq!(zones_of(&by_zone), vec!["zone-a", "zone-b"]);
    }

    #[test]
    fn tokens_info_covers_every_token() {
        let desc = three_instance_desc();
        let info = desc.tokens_info();

        for token in desc.tokens() {
            assert!(info.contains_key(&token), "token {token} has no owner");
        }
        assert_eq!(info[&30].instance_id, "ing-3");
        assert_eq!(info[&30].zone, "zone-a");
    }

    #[test]
    fn instances_by_addr_maps_back_to_ids() {
        let mut desc = Desc::new();
        let mut a = instance("ing-1", "zone-a", vec![1]);
        a.addr = "10.0.0.1:9095".to_string();
        desc.insert(a);

        assert_eq!(desc.instances_by_addr()["10.0.0.1:9095"], "ing-1");
    }

    #[test]
    fn ring_compare_equal() {
        let desc = three_instance_desc();
        assert_eq!(desc.ring_compare(&desc.clone()), CompareResult::Equal);
    }

    #[test]
    fn ring_compare_states_and_timestamps() {
        let desc = three_instance_desc();

        let mut heartbeat_changed = desc.clone();
        heartbeat_changed.ingesters.get_mut("ing-1").unwrap().heartbeat_timestamp += 5;
        assert_eq!(
            desc.ring_compare(&heartbeat_changed),
            CompareResult::EqualButStatesAndTimestamps
        );

        let mut state_changed = desc.clone();
        state_changed.ingesters.get_mut("ing-2").unwrap().state = InstanceState::Leaving;
        assert_eq!(
            desc.ring_compare(&state_changed),
            CompareResult::EqualButStatesAndTimestamps
        );
    }

    #[test]
    fn ring_compare_read_only_transition() {
        let desc = three_instance_desc();

        let mut to_read_only = desc.clone();
        to_read_only.ingesters.get_mut("ing-2").unwrap().state = InstanceState::ReadOnly;
        assert_eq!(
            desc.ring_compare(&to_read_only),
            CompareResult::EqualButReadOnly
        );
        // And back out of READONLY.
        assert_eq!(
            to_read_only.ring_compare(&desc),
            CompareResult::EqualButReadOnly
        );
    }

    #[test]
    fn ring_compare_topology_changes() {
        let desc = three_instance_desc();

        let mut added = desc.clone();
        added.insert(instance("ing-4", "zone-b", vec![60]));
        assert_eq!(desc.ring_compare(&added), CompareResult::Different);

        let mut tokens_changed = desc.clone();
        tokens_changed.ingesters.get_mut("ing-3").unwrap().tokens = vec![31];
        assert_eq!(desc.ring_compare(&tokens_changed), CompareResult::Different);

        let mut zone_changed = desc.clone();
        zone_changed.ingesters.get_mut("ing-3").unwrap().zone = "zone-c".to_string();
        assert_eq!(desc.ring_compare(&zone_changed), CompareResult::Different);

        let mut registered_changed = desc.clone();
        registered_changed
            .ingesters
            .get_mut("ing-1")
            .unwrap()
            .registered_timestamp += 1;
        assert_eq!(
            desc.ring_compare(&registered_changed),
            CompareResult::Different
        );
    }

    #[test]
    fn heartbeat_timeout_zero_disables_staleness() {
        let mut stale = instance("ing-1", "zone-a", vec![1]);
        stale.heartbeat_timestamp = 0;

        assert!(stale.is_heartbeat_healthy(Duration::ZERO, DateTime::UNIX_EPOCH));
        assert!(!stale.is_heartbeat_healthy(Duration::from_secs(60), DateTime::UNIX_EPOCH));
    }

    #[test]
    fn kv_resync_absorbs_stale_heartbeats() {
        let mut stale = instance("ing-1", "zone-a", vec![1]);
        stale.heartbeat_timestamp = 0;

        // The KV store synced just now, so the instance is not considered stale
        // even though its own heartbeat is ancient.
        assert!(stale.is_heartbeat_healthy(Duration::from_secs(60), Utc::now()));
    }

    #[test]
    fn is_healthy_requires_both_state_and_heartbeat() {
        let now = Utc::now();
        let mut inst = instance("ing-1", "zone-a", vec![1]);

        assert!(inst.is_healthy(Operation::write(), Duration::from_secs(60), now));

        inst.state = InstanceState::Joining;
        assert!(!inst.is_healthy(Operation::write(), Duration::from_secs(60), now));
        assert!(inst.is_healthy(Operation::read(), Duration::from_secs(60), now));

        inst.state = InstanceState::Active;
        inst.heartbeat_timestamp = 0;
        assert!(!inst.is_healthy(
            Operation::write(),
            Duration::from_secs(60),
            DateTime::UNIX_EPOCH
        ));
    }
}
