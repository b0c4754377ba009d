//! The membership ring core: consistent-hash replica selection, fleet-wide
//! replication sets and shuffle sharding over a shared descriptor snapshot.

use crate::error::{Error, Result};
use crate::kv::KvClient;
use crate::model::{zones_of, CompareResult, Desc, InstanceDesc, InstanceInfo, InstanceState};
use crate::operation::Operation;
use crate::shard::{shuffle_shard_expected_instances_per_zone, shuffle_shard_seed};
use crate::strategy::{DefaultReplicationStrategy, ReplicationStrategy};
use crate::telemetry;
use crate::tokens::{search_token, token_distance};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Suggested capacity for the instance buffers passed to [`Ring::get_with_buffers`].
/// Based on a typical replication factor 3, plus room for a JOINING and a
/// LEAVING instance.
pub const GET_BUFFER_SIZE: usize = 5;

/// Suggested capacity for the zone map passed to [`Ring::get_with_buffers`].
pub const GET_ZONE_SIZE: usize = 3;

const UNHEALTHY: &str = "Unhealthy";

/// Ring configuration.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Instances whose heartbeat is older than this are skipped for reads and
    /// writes. Zero disables the staleness check.
    pub heartbeat_timeout: Duration,
    /// Number of distinct instances each key is replicated to.
    pub replication_factor: usize,
    /// Spread replicas across availability zones.
    pub zone_awareness_enabled: bool,
    /// Instances in these zones are stripped from the descriptor before any
    /// derived view is built.
    pub excluded_zones: Vec<String>,
    /// Emit per-member token-count and ownership gauges.
    pub detailed_metrics_enabled: bool,
    /// Disables the shuffle-shard subring cache. Set internally and by tests.
    pub subring_cache_disabled: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            replication_factor: 3,
            zone_awareness_enabled: false,
            excluded_zones: Vec::new(),
            detailed_metrics_enabled: true,
            subring_cache_disabled: false,
        }
    }
}

/// The set of instances a caller must contact for an operation, with the
/// failure budget the quorum math allows.
#[derive(Debug, Clone, Default)]
pub struct ReplicationSet {
    pub instances: Vec<InstanceDesc>,
    /// Number of instances that may fail while the operation still succeeds.
    /// Mutually exclusive with `max_unavailable_zones`.
    pub max_errors: usize,
    /// Number of zones that may become unavailable while the operation still
    /// succeeds. Only set by zone-aware fleet-wide resolution.
    pub max_unavailable_zones: usize,
}

/// Caller-owned buffers reused across [`Ring::get_with_buffers`] calls to keep
/// the hot path allocation-free. Buffers are reset, never shrunk.
#[derive(Debug, Default)]
pub struct GetBuffers {
    descs: Vec<InstanceDesc>,
    hosts: Vec<String>,
    zones: HashMap<String, usize>,
}

impl GetBuffers {
    pub fn new() -> Self {
        Self {
            descs: Vec::with_capacity(GET_BUFFER_SIZE),
            hosts: Vec::with_capacity(GET_BUFFER_SIZE),
            zones: HashMap::with_capacity(GET_ZONE_SIZE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubringCacheKey {
    identifier: String,
    shard_size: usize,
    zone_stable_sharding: bool,
}

struct RingState {
    desc: Desc,
    tokens: Vec<u32>,
    tokens_by_zone: HashMap<String, Vec<u32>>,
    /// Maps each token to the instance holding it. Immutable once published:
    /// subrings reference it as-is, so updates must build a new map and swap
    /// the pointer instead of mutating in place.
    instance_by_token: Arc<HashMap<u32, InstanceInfo>>,
    instance_id_by_addr: HashMap<String, String>,
    /// Zones with at least one instance, sorted alphabetically.
    zones: Vec<String>,
    previous_zones: Vec<String>,
    /// When the instance set, zones or tokens last changed. State and
    /// heartbeat updates don't move this; it keys subring-cache validity.
    last_topology_change: DateTime<Utc>,
    /// Cached shuffle-shard subrings per identifier, invalidated wholesale on
    /// topology changes. `None` disables caching (subrings never cache).
    subring_cache: Option<HashMap<SubringCacheKey, Arc<Ring>>>,
    reported_owners: HashSet<String>,
}

impl RingState {
    fn empty() -> Self {
        Self {
            desc: Desc::new(),
            tokens: Vec::new(),
            tokens_by_zone: HashMap::new(),
            instance_by_token: Arc::new(HashMap::new()),
            instance_id_by_addr: HashMap::new(),
            zones: Vec::new(),
            previous_zones: Vec::new(),
            last_topology_change: DateTime::UNIX_EPOCH,
            subring_cache: Some(HashMap::new()),
            reported_owners: HashSet::new(),
        }
    }
}

/// Read side of the membership ring.
///
/// A single `Ring` is shared across query threads; the KV watch installs new
/// descriptors on one logical task while readers resolve replica sets
/// concurrently under the read half of the snapshot lock. Every call observes
/// one consistent snapshot of the descriptor and all its derived views.
pub struct Ring {
    name: String,
    key: String,
    cfg: RingConfig,
    kv: Arc<dyn KvClient>,
    strategy: Arc<dyn ReplicationStrategy>,
    state: RwLock<RingState>,
    /// Self-reference, so shuffle sharding can hand back the parent ring
    /// unchanged when the requested shard is not smaller than the ring.
    me: Weak<Ring>,
}

impl Ring {
    /// Creates a ring with the quorum-based default replication strategy.
    pub fn new(
        cfg: RingConfig,
        name: impl Into<String>,
        key: impl Into<String>,
        kv: Arc<dyn KvClient>,
    ) -> Result<Arc<Ring>> {
        Self::with_strategy(cfg, name, key, kv, Arc::new(DefaultReplicationStrategy))
    }

    pub fn with_strategy(
        cfg: RingConfig,
        name: impl Into<String>,
        key: impl Into<String>,
        kv: Arc<dyn KvClient>,
        strategy: Arc<dyn ReplicationStrategy>,
    ) -> Result<Arc<Ring>> {
        if cfg.replication_factor == 0 {
            return Err(Error::Config(
                "replication factor must be greater than zero".to_string(),
            ));
        }

        let name = name.into();
        let key = key.into();
        Ok(Arc::new_cyclic(|me| Ring {
            name,
            key,
            cfg,
            kv,
            strategy,
            state: RwLock::new(RingState::empty()),
            me: me.clone(),
        }))
    }

    /// Handle to this ring. The upgrade cannot fail: a caller invoking a
    /// method on the ring is keeping its `Arc` alive.
    fn self_arc(&self) -> Arc<Ring> {
        self.me.upgrade().expect("ring dropped while still borrowed")
    }

    /// Fetches the initial descriptor from the KV store, so the in-memory
    /// ring is populated before the first watch callback fires.
    pub async fn start(&self) -> Result<()> {
        match self.kv.get(&self.key).await? {
            Some(desc) => self.update_ring_state(desc),
            None => info!(ring = %self.name, key = %self.key, "ring does not exist in KV store yet"),
        }
        Ok(())
    }

    /// Watches the KV store and installs every new descriptor until
    /// `shutdown` is cancelled. Run on a dedicated task; the previous
    /// descriptor stays in force across watch failures.
    pub async fn watch(self: Arc<Self>, shutdown: CancellationToken) {
        {
            let mut state = self.state.write();
            self.update_ring_metrics(&mut state, CompareResult::Different);
        }

        let ring = Arc::clone(&self);
        let key = self.key.clone();
        let mut cb = move |value: Option<Desc>| {
            match value {
                Some(desc) => ring.update_ring_state(desc),
                None => {
                    info!(ring = %ring.name, key = %ring.key, "ring does not exist in KV store yet")
                }
            }
            true
        };
        self.kv.watch_key(&key, shutdown, &mut cb).await;
    }

    pub(crate) fn update_ring_state(&self, mut ring_desc: Desc) {
        if !self.cfg.excluded_zones.is_empty() {
            ring_desc.retain(|instance| !self.cfg.excluded_zones.contains(&instance.zone));
        }

        let rc = self.state.read().desc.ring_compare(&ring_desc);

        if matches!(
            rc,
            CompareResult::Equal
                | CompareResult::EqualButStatesAndTimestamps
                | CompareResult::EqualButReadOnly
        ) {
            // Topology unchanged: swap the descriptor and keep the token views.
            let mut state = self.state.write();
            state.desc = ring_desc;
            if rc == CompareResult::EqualButReadOnly && state.subring_cache.is_some() {
                // READONLY transitions change which instances extend replica
                // sets, so cached subrings are stale even though tokens are not.
                state.subring_cache = Some(HashMap::new());
            }
            self.update_ring_metrics(&mut state, rc);
            return;
        }

        debug!(ring = %self.name, "ring topology changed, rebuilding derived views");

        let now = Utc::now();
        let ring_tokens = ring_desc.tokens();
        let ring_tokens_by_zone = ring_desc.tokens_by_zone();
        let ring_instance_by_token = Arc::new(ring_desc.tokens_info());
        let ring_instance_id_by_addr = ring_desc.instances_by_addr();
        let ring_zones = zones_of(&ring_tokens_by_zone);

        let mut state = self.state.write();
        state.desc = ring_desc;
        state.tokens = ring_tokens;
        state.tokens_by_zone = ring_tokens_by_zone;
        state.instance_by_token = ring_instance_by_token;
        state.instance_id_by_addr = ring_instance_id_by_addr;
        state.previous_zones = std::mem::replace(&mut state.zones, ring_zones);
        state.last_topology_change = now;
        if state.subring_cache.is_some() {
            state.subring_cache = Some(HashMap::new());
        }
        self.update_ring_metrics(&mut state, rc);
    }

    /// Returns the replicas for `key`: `replication_factor` distinct
    /// instances, or more when the operation extends the set.
    ///
    /// Guarantees, for a fixed descriptor:
    /// - stability: the same `(key, op)` always yields the same set;
    /// - consistency: adding or removing one instance changes the set for any
    ///   key by at most one replica slot.
    pub fn get(&self, key: u32, op: Operation) -> Result<ReplicationSet> {
        let mut buffers = GetBuffers::new();
        self.get_with_buffers(key, op, &mut buffers)
    }

    /// Like [`Ring::get`], but reuses caller-owned buffers to avoid
    /// allocations on the hot path.
    pub fn get_with_buffers(
        &self,
        key: u32,
        op: Operation,
        buffers: &mut GetBuffers,
    ) -> Result<ReplicationSet> {
        let state = self.state.read();
        if state.tokens.is_empty() {
            return Err(Error::EmptyRing);
        }

        let mut replication_factor = self.cfg.replication_factor;
        let max_instances_per_zone = replication_factor / state.zones.len();
        let mut zones_with_extra_instance = replication_factor % state.zones.len();

        let GetBuffers {
            descs: instances,
            hosts: distinct_hosts,
            zones: instances_by_zone,
        } = buffers;
        instances.clear();
        distinct_hosts.clear();
        instances_by_zone.clear();

        let mut iterations = 0;
        let mut i = search_token(&state.tokens, key);
        while distinct_hosts.len() < replication_factor && iterations < state.tokens.len() {
            iterations += 1;
            // Wrap around in the ring.
            i %= state.tokens.len();
            let token = state.tokens[i];
            i += 1;

            let info = state
                .instance_by_token
                .get(&token)
                .ok_or(Error::InconsistentTokensInfo)?;

            // Replicas must be distinct instances. A linear scan beats a map
            // lookup for the handful of hosts involved.
            if distinct_hosts.iter().any(|h| h == &info.instance_id) {
                continue;
            }

            // Instances without a zone set are not subject to the zone quota.
            if self.cfg.zone_awareness_enabled && !info.zone.is_empty() {
                let mut max_for_zone = max_instances_per_zone;
                if zones_with_extra_instance > 0 {
                    max_for_zone += 1;
                }
                if instances_by_zone.get(&info.zone).copied().unwrap_or(0) >= max_for_zone {
                    continue;
                }
            }

            distinct_hosts.push(info.instance_id.clone());
            let instance = state
                .desc
                .get(&info.instance_id)
                .ok_or(Error::InconsistentTokensInfo)?
                .clone();

            if op.should_extend_replica_set_on_state(instance.state) {
                // The replacement for this replica is looked for in the same
                // zone, so the selection doesn't consume zone quota.
                replication_factor += 1;
            } else if self.cfg.zone_awareness_enabled && !info.zone.is_empty() {
                match instances_by_zone.entry(info.zone.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(1);
                    }
                    Entry::Occupied(mut slot) => {
                        *slot.get_mut() += 1;
                        if *slot.get() > max_instances_per_zone {
                            // This zone took one of the extra instances.
                            zones_with_extra_instance =
                                zones_with_extra_instance.saturating_sub(1);
                        }
                    }
                }
            }

            instances.push(instance);
        }

        let max_errors = self.strategy.filter(
            instances,
            op,
            self.cfg.replication_factor,
            self.cfg.heartbeat_timeout,
            self.cfg.zone_awareness_enabled,
            self.kv.last_update_time(&self.key),
        )?;

        Ok(ReplicationSet {
            instances: instances.clone(),
            max_errors,
            max_unavailable_zones: 0,
        })
    }

    /// Returns every healthy instance for the operation, without checking
    /// whether quorum is honored.
    pub fn get_all_healthy(&self, op: Operation) -> Result<ReplicationSet> {
        let state = self.state.read();
        if state.desc.is_empty() {
            return Err(Error::EmptyRing);
        }

        let storage_last_update = self.kv.last_update_time(&self.key);
        let instances: Vec<InstanceDesc> = state
            .desc
            .instances()
            .filter(|i| i.is_healthy(op, self.cfg.heartbeat_timeout, storage_last_update))
            .cloned()
            .collect();

        Ok(ReplicationSet {
            instances,
            max_errors: 0,
            max_unavailable_zones: 0,
        })
    }

    /// Partitions every registered instance into healthy and unhealthy for
    /// the operation.
    pub fn get_all_instance_descs(
        &self,
        op: Operation,
    ) -> Result<(Vec<InstanceDesc>, Vec<InstanceDesc>)> {
        let state = self.state.read();
        if state.desc.is_empty() {
            return Err(Error::EmptyRing);
        }

        let storage_last_update = self.kv.last_update_time(&self.key);
        let (healthy, unhealthy) = state
            .desc
            .instances()
            .cloned()
            .partition(|i| i.is_healthy(op, self.cfg.heartbeat_timeout, storage_last_update));

        Ok((healthy, unhealthy))
    }

    /// Returns the healthy instances for the operation, keyed by instance id.
    pub fn get_instance_descs_for_operation(
        &self,
        op: Operation,
    ) -> Result<HashMap<String, InstanceDesc>> {
        let state = self.state.read();
        if state.desc.is_empty() {
            return Err(Error::EmptyRing);
        }

        let storage_last_update = self.kv.last_update_time(&self.key);
        Ok(state
            .desc
            .instances()
            .filter(|i| i.is_healthy(op, self.cfg.heartbeat_timeout, storage_last_update))
            .map(|i| (i.id.clone(), i.clone()))
            .collect())
    }

    /// Returns every instance that must be contacted for a fleet-wide
    /// operation, together with the failure budget.
    ///
    /// The result doesn't necessarily contain all healthy instances: with
    /// zone-awareness enabled, a zone with any failing instance is dropped
    /// entirely, because replication across zones makes its healthy
    /// instances redundant.
    pub fn get_replication_set_for_operation(&self, op: Operation) -> Result<ReplicationSet> {
        let state = self.state.read();
        if state.tokens.is_empty() {
            return Err(Error::EmptyRing);
        }

        let storage_last_update = self.kv.last_update_time(&self.key);
        let mut healthy: Vec<InstanceDesc> = Vec::with_capacity(state.desc.len());
        let mut zone_failures: HashSet<String> = HashSet::new();
        for instance in state.desc.instances() {
            if instance.is_healthy(op, self.cfg.heartbeat_timeout, storage_last_update) {
                healthy.push(instance.clone());
            } else {
                zone_failures.insert(instance.zone.clone());
            }
        }

        // Max errors and max unavailable zones are mutually exclusive.
        let mut max_errors = 0;
        let mut max_unavailable_zones = 0;

        if self.cfg.zone_awareness_enabled {
            // Data is replicated to RF different zones, so a minority of
            // zones may fail; guard against rings with fewer zones than RF.
            let num_replicated_zones = state.zones.len().min(self.cfg.replication_factor);
            let min_success_zones = num_replicated_zones / 2 + 1;
            max_unavailable_zones = min_success_zones - 1;

            if zone_failures.len() > max_unavailable_zones {
                return Err(Error::TooManyUnhealthyInstances);
            }

            if !zone_failures.is_empty() {
                // A zone with a single failing instance is treated as fully
                // unavailable; drop its healthy instances too.
                healthy.retain(|i| !zone_failures.contains(&i.zone));
                max_unavailable_zones -= zone_failures.len();
            }
        } else {
            let num_required = state.desc.len().max(self.cfg.replication_factor)
                - self.cfg.replication_factor / 2;

            if healthy.len() < num_required {
                return Err(Error::TooManyUnhealthyInstances);
            }

            max_errors = healthy.len() - num_required;
        }

        Ok(ReplicationSet {
            instances: healthy,
            max_errors,
            max_unavailable_zones,
        })
    }

    pub fn replication_factor(&self) -> usize {
        self.cfg.replication_factor
    }

    /// Number of instances registered in the ring.
    pub fn instances_count(&self) -> usize {
        self.state.read().desc.len()
    }

    /// Current state of an instance, or [`Error::InstanceNotFound`].
    pub fn get_instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        let state = self.state.read();
        state
            .desc
            .get(instance_id)
            .map(|i| i.state)
            .ok_or(Error::InstanceNotFound)
    }

    /// Resolves an instance id from its address.
    pub fn get_instance_id_by_addr(&self, addr: &str) -> Result<String> {
        let state = self.state.read();
        state
            .instance_id_by_addr
            .get(addr)
            .cloned()
            .ok_or(Error::InstanceNotFound)
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.state.read().desc.contains(instance_id)
    }

    /// Returns a deterministic subring of `size` instances for the
    /// identifier (e.g. a tenant id), balanced across zones.
    ///
    /// Each zone is treated as an independent ring and walked from
    /// pseudo-random but predictable starting points, so that:
    /// - the same ring and identifier always produce the same subring;
    /// - adding or removing one instance changes the subring by at most one
    ///   instance;
    /// - different identifiers get probabilistically disjoint subrings.
    ///
    /// The size is expected to be a multiple of the number of zones; it is
    /// rounded up per zone otherwise.
    pub fn shuffle_shard(&self, identifier: &str, size: usize) -> Arc<Ring> {
        self.shuffle_shard_with_cache(identifier, size, false)
    }

    /// Like [`Ring::shuffle_shard`], but distributes `size % zones` extra
    /// instances to the first zones instead of rounding up, so that growing
    /// or shrinking the shard by one changes exactly one instance.
    pub fn shuffle_shard_with_zone_stability(&self, identifier: &str, size: usize) -> Arc<Ring> {
        self.shuffle_shard_with_cache(identifier, size, true)
    }

    /// Like [`Ring::shuffle_shard`], but also includes every instance that
    /// joined the shard within `[now - lookback_period, now]`, keeping
    /// recently replaced instances visible to readers.
    ///
    /// The result may be bigger than `size` and unbalanced across zones; it
    /// must only be used for read operations. Never cached, because the
    /// output depends on `now`.
    pub fn shuffle_shard_with_lookback(
        &self,
        identifier: &str,
        size: usize,
        lookback_period: Duration,
        now: DateTime<Utc>,
    ) -> Arc<Ring> {
        if size == 0 || self.instances_count() <= size {
            return self.self_arc();
        }

        self.do_shuffle_shard(identifier, size, Some(lookback_period), now, false)
    }

    /// Drops every cached subring for the identifier.
    pub fn cleanup_shuffle_shard_cache(&self, identifier: &str) {
        if self.cfg.subring_cache_disabled {
            return;
        }

        let mut state = self.state.write();
        if let Some(cache) = state.subring_cache.as_mut() {
            cache.retain(|k, _| k.identifier != identifier);
        }
    }

    fn shuffle_shard_with_cache(
        &self,
        identifier: &str,
        size: usize,
        zone_stable_sharding: bool,
    ) -> Arc<Ring> {
        // Nothing to do if the shard is not smaller than the ring itself.
        if size == 0 || self.instances_count() <= size {
            return self.self_arc();
        }

        if let Some(cached) = self.get_cached_shuffled_subring(identifier, size, zone_stable_sharding)
        {
            return cached;
        }

        let result = self.do_shuffle_shard(identifier, size, None, Utc::now(), zone_stable_sharding);
        self.set_cached_shuffled_subring(identifier, size, zone_stable_sharding, &result);
        result
    }

    fn do_shuffle_shard(
        &self,
        identifier: &str,
        size: usize,
        lookback_period: Option<Duration>,
        now: DateTime<Utc>,
        zone_stable_sharding: bool,
    ) -> Arc<Ring> {
        let lookback_until = lookback_period
            .filter(|p| !p.is_zero())
            .map(|p| now.timestamp() - p.as_secs() as i64);

        let state = self.state.read();

        let (num_instances_per_zone, actual_zones, mut zones_with_extra_instance) =
            if self.cfg.zone_awareness_enabled {
                if zone_stable_sharding {
                    (
                        size / state.zones.len(),
                        state.zones.clone(),
                        size % state.zones.len(),
                    )
                } else {
                    (
                        shuffle_shard_expected_instances_per_zone(size, state.zones.len()),
                        state.zones.clone(),
                        0,
                    )
                }
            } else {
                // Without zone-awareness there's one synthetic zone holding
                // every token in the ring.
                (size, vec![String::new()], 0)
            };

        let mut shard: HashMap<String, InstanceDesc> = HashMap::with_capacity(size);

        // Zones are iterated in their stable sorted order for determinism.
        for zone in &actual_zones {
            let zone_tokens: &[u32] = if self.cfg.zone_awareness_enabled {
                state
                    .tokens_by_zone
                    .get(zone)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
            } else {
                &state.tokens
            };

            // Every zone gets a dedicated generator seeded from (identifier,
            // zone), so resizing the shard or adding a zone never reshuffles
            // the selections made in other zones.
            let mut random = StdRng::seed_from_u64(shuffle_shard_seed(identifier, zone));

            let mut instances_to_pick = num_instances_per_zone;
            if zones_with_extra_instance > 0 {
                zones_with_extra_instance -= 1;
                instances_to_pick += 1;
            }

            for _ in 0..instances_to_pick {
                let mut p = search_token(zone_tokens, random.next_u32());
                let mut iterations = 0;
                let mut found = false;

                while iterations < zone_tokens.len() {
                    iterations += 1;
                    // Wrap around in the zone's ring.
                    p %= zone_tokens.len();
                    let token = zone_tokens[p];
                    p += 1;

                    let info = state.instance_by_token.get(&token).unwrap_or_else(|| {
                        // A token without an owner means the snapshot is
                        // corrupted; failing loudly beats serving a shard
                        // that silently lost instances.
                        panic!("{}", Error::InconsistentTokensInfo)
                    });

                    // Resolve collisions with already selected instances by
                    // continuing to walk the ring.
                    if shard.contains_key(&info.instance_id) {
                        continue;
                    }

                    let instance = state
                        .desc
                        .get(&info.instance_id)
                        .unwrap_or_else(|| panic!("{}", Error::InconsistentTokensInfo))
                        .clone();
                    let instance_state = instance.state;
                    let registered_timestamp = instance.registered_timestamp;
                    shard.insert(info.instance_id.clone(), instance);

                    // An instance registered within the lookback window joins
                    // the shard but leaves its slot open for the older
                    // instance it replaced. READONLY instances always extend:
                    // the write path filters them out, while reads must also
                    // reach whichever instance took over their writes.
                    if lookback_until.is_some_and(|until| registered_timestamp >= until)
                        || instance_state == InstanceState::ReadOnly
                    {
                        continue;
                    }

                    found = true;
                    break;
                }

                // The zone has no selectable instances left.
                if !found {
                    break;
                }
            }
        }

        let shard_desc = Desc::from_instances(shard);
        let shard_tokens = shard_desc.tokens();
        let shard_tokens_by_zone = shard_desc.tokens_by_zone();
        let shard_zones = zones_of(&shard_tokens_by_zone);
        let shard_instance_id_by_addr = shard_desc.instances_by_addr();

        Arc::new_cyclic(|me| Ring {
            name: self.name.clone(),
            key: self.key.clone(),
            cfg: self.cfg.clone(),
            kv: Arc::clone(&self.kv),
            strategy: Arc::clone(&self.strategy),
            me: me.clone(),
            state: RwLock::new(RingState {
                desc: shard_desc,
                tokens: shard_tokens,
                tokens_by_zone: shard_tokens_by_zone,
                // Shared as-is rather than copied: the parent's map is
                // immutable and a superset of the shard's instances.
                instance_by_token: Arc::clone(&state.instance_by_token),
                instance_id_by_addr: shard_instance_id_by_addr,
                zones: shard_zones,
                previous_zones: Vec::new(),
                // Inherited so the cache can verify the subring still matches
                // the parent topology when storing it.
                last_topology_change: state.last_topology_change,
                subring_cache: None,
                reported_owners: HashSet::new(),
            }),
        })
    }

    fn get_cached_shuffled_subring(
        &self,
        identifier: &str,
        size: usize,
        zone_stable_sharding: bool,
    ) -> Option<Arc<Ring>> {
        if self.cfg.subring_cache_disabled {
            return None;
        }

        let state = self.state.read();
        let cache_key = SubringCacheKey {
            identifier: identifier.to_string(),
            shard_size: size,
            zone_stable_sharding,
        };
        let cached = Arc::clone(state.subring_cache.as_ref()?.get(&cache_key)?);

        {
            // The topology is known equal, so tokens and zones are still
            // valid; only states and heartbeats need refreshing.
            let mut cached_state = cached.state.write();
            for instance in cached_state.desc.instances_mut() {
                if let Some(current) = state.desc.get(&instance.id) {
                    instance.state = current.state;
                    instance.heartbeat_timestamp = current.heartbeat_timestamp;
                }
            }
        }

        Some(cached)
    }

    fn set_cached_shuffled_subring(
        &self,
        identifier: &str,
        size: usize,
        zone_stable_sharding: bool,
        subring: &Arc<Ring>,
    ) {
        if self.cfg.subring_cache_disabled {
            return;
        }

        let subring_topology = subring.state.read().last_topology_change;

        let mut state = self.state.write();
        let last_topology_change = state.last_topology_change;
        if let Some(cache) = state.subring_cache.as_mut() {
            // Only store the subring if the ring hasn't changed between
            // computing it (under the read lock) and re-acquiring the write
            // lock here.
            if last_topology_change == subring_topology {
                cache.insert(
                    SubringCacheKey {
                        identifier: identifier.to_string(),
                        shard_size: size,
                        zone_stable_sharding,
                    },
                    Arc::clone(subring),
                );
            }
        }
    }

    /// Computes, for each instance, how many tokens it holds and the arc
    /// length it owns. Call with the state lock held.
    fn count_tokens(
        tokens: &[u32],
        instance_by_token: &HashMap<u32, InstanceInfo>,
        desc: &Desc,
    ) -> (HashMap<String, u32>, HashMap<String, u64>) {
        let mut num_tokens: HashMap<String, u32> = HashMap::new();
        let mut owned: HashMap<String, u64> = HashMap::new();

        for i in 1..=tokens.len() {
            let index = i % tokens.len();
            let distance = token_distance(tokens[i - 1], tokens[index]);
            if let Some(info) = instance_by_token.get(&tokens[index]) {
                *num_tokens.entry(info.instance_id.clone()).or_insert(0) += 1;
                *owned.entry(info.instance_id.clone()).or_insert(0) += distance;
            }
        }

        // Instances without tokens yet still get a zero entry.
        for id in desc.instance_ids() {
            owned.entry(id.clone()).or_insert(0);
            num_tokens.entry(id.clone()).or_insert(0);
        }

        (num_tokens, owned)
    }

    /// Refreshes the ring gauges. Call with the state write lock held.
    fn update_ring_metrics(&self, state: &mut RingState, compare_result: CompareResult) {
        if compare_result == CompareResult::Equal {
            return;
        }

        let storage_last_update = self.kv.last_update_time(&self.key);
        let mut num_by_state_by_zone: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut oldest_timestamp_by_state: HashMap<String, i64> = HashMap::new();

        // Zero-initialise so empty states and removed zones emit zeroes
        // instead of lingering at their last value.
        for state_name in InstanceState::ALL.map(InstanceState::name).into_iter().chain([UNHEALTHY]) {
            let zones = num_by_state_by_zone.entry(state_name.to_string()).or_default();
            for zone in state.previous_zones.iter().chain(state.zones.iter()) {
                zones.insert(zone.clone(), 0);
            }
            oldest_timestamp_by_state.insert(state_name.to_string(), 0);
        }

        for instance in state.desc.instances() {
            let state_name = if instance.is_healthy(
                Operation::reporting(),
                self.cfg.heartbeat_timeout,
                storage_last_update,
            ) {
                instance.state.name().to_string()
            } else {
                UNHEALTHY.to_string()
            };

            *num_by_state_by_zone
                .entry(state_name.clone())
                .or_default()
                .entry(instance.zone.clone())
                .or_insert(0) += 1;

            let oldest = oldest_timestamp_by_state.entry(state_name).or_insert(0);
            if *oldest == 0 || instance.heartbeat_timestamp < *oldest {
                *oldest = instance.heartbeat_timestamp;
            }
        }

        for (state_name, zones) in &num_by_state_by_zone {
            for (zone, count) in zones {
                telemetry::record_members(&self.name, state_name, zone, *count as u64);
            }
        }
        for (state_name, timestamp) in &oldest_timestamp_by_state {
            telemetry::record_oldest_member_timestamp(&self.name, state_name, *timestamp);
        }

        if compare_result == CompareResult::EqualButStatesAndTimestamps {
            return;
        }

        if self.cfg.detailed_metrics_enabled {
            let (num_tokens, owned) =
                Self::count_tokens(&state.tokens, &state.instance_by_token, &state.desc);
            let mut previous_owners = std::mem::take(&mut state.reported_owners);

            for (id, total_owned) in &owned {
                telemetry::record_member_ownership(
                    &self.name,
                    id,
                    *total_owned as f64 / (1u64 << 32) as f64,
                );
                telemetry::record_tokens_owned(
                    &self.name,
                    id,
                    u64::from(num_tokens.get(id).copied().unwrap_or(0)),
                );
                previous_owners.remove(id);
                state.reported_owners.insert(id.clone());
            }

            // Members gone from the ring: zero their gauges so stale values
            // don't linger.
            for id in previous_owners {
                telemetry::record_member_ownership(&self.name, &id, 0.0);
                telemetry::record_tokens_owned(&self.name, &id, 0);
            }
        }

        telemetry::record_tokens_total(&self.name, state.tokens.len() as u64);
    }
}
