//! Shuffle-sharding behavior exercised through the public API.

use chrono::Utc;
use ringleader::{Desc, InstanceDesc, InstanceState, MemoryKvStore, Operation, Ring, RingConfig};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

fn cluster_desc(zones: &[&str], instances_per_zone: usize, tokens_per_instance: usize) -> Desc {
    let now = Utc::now().timestamp();
    let mut desc = Desc::new();
    let mut global = 0u32;
    for zone in zones {
        for i in 0..instances_per_zone {
            let id = format!("{zone}-{i}");
            let tokens: Vec<u32> = (0..tokens_per_instance as u32)
                .map(|k| global + k * 1_000_003)
                .collect();
            desc.insert(InstanceDesc {
                id: id.clone(),
                addr: format!("{id}:9095"),
                state: InstanceState::Active,
                zone: zone.to_string(),
                registered_timestamp: now - 7200,
                heartbeat_timestamp: now,
                tokens,
            });
            global += 1;
        }
    }
    desc
}

async fn started_ring(kv: Arc<MemoryKvStore>, cfg: RingConfig) -> Arc<Ring> {
    let ring = Ring::new(cfg, "ingester", "collectors/ring", kv).unwrap();
    ring.start().await.unwrap();
    ring
}

fn member_ids(ring: &Ring) -> BTreeSet<String> {
    ring.get_all_healthy(Operation::reporting())
        .unwrap()
        .instances
        .into_iter()
        .map(|i| i.id)
        .collect()
}

fn zone_aware_cfg() -> RingConfig {
    RingConfig {
        zone_awareness_enabled: true,
        ..RingConfig::default()
    }
}

#[tokio::test]
async fn tenant_shards_survive_ring_restarts() {
    let desc = cluster_desc(&["zone-a", "zone-b", "zone-c"], 10, 4);

    let kv1 = Arc::new(MemoryKvStore::new());
    kv1.put("collectors/ring", desc.clone());
    let ring1 = started_ring(kv1, zone_aware_cfg()).await;

    let kv2 = Arc::new(MemoryKvStore::new());
    kv2.put("collectors/ring", desc);
    let ring2 = started_ring(kv2, zone_aware_cfg()).await;

    for tenant in ["tenant-a", "tenant-b", "tenant-c"] {
        assert_eq!(
            member_ids(&ring1.shuffle_shard(tenant, 6)),
            member_ids(&ring2.shuffle_shard(tenant, 6)),
            "shard for {tenant} must not depend on which process computed it"
        );
    }
}

#[tokio::test]
async fn tenant_shards_are_zone_balanced() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.put(
        "collectors/ring",
        cluster_desc(&["zone-a", "zone-b", "zone-c"], 10, 4),
    );
    let ring = started_ring(kv, zone_aware_cfg()).await;

    for tenant in 0..20 {
        let shard = ring.shuffle_shard(&format!("tenant-{tenant}"), 6);
        let members = shard.get_all_healthy(Operation::reporting()).unwrap().instances;
        assert_eq!(members.len(), 6);

        let mut per_zone: HashMap<String, usize> = HashMap::new();
        for member in &members {
            *per_zone.entry(member.zone.clone()).or_insert(0) += 1;
        }
        assert!(
            per_zone.values().all(|&count| count == 2),
            "tenant-{tenant} shard is not zone balanced: {per_zone:?}"
        );
    }
}

#[tokio::test]
async fn different_tenants_get_different_shards() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.put(
        "collectors/ring",
        cluster_desc(&["zone-a", "zone-b", "zone-c"], 10, 4),
    );
    let ring = started_ring(kv, zone_aware_cfg()).await;

    let shard_a = member_ids(&ring.shuffle_shard("tenant-a", 6));
    let shard_b = member_ids(&ring.shuffle_shard("tenant-b", 6));
    assert_ne!(shard_a, shard_b);
}

#[tokio::test]
async fn subring_replicas_are_shard_members() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.put(
        "collectors/ring",
        cluster_desc(&["zone-a", "zone-b", "zone-c"], 10, 4),
    );
    let ring = started_ring(kv, zone_aware_cfg()).await;

    let shard = ring.shuffle_shard("tenant-a", 6);
    let members = member_ids(&shard);

    for key in [0u32, 1 << 20, 1 << 28, u32::MAX - 5] {
        let set = shard.get(key, Operation::write()).unwrap();
        assert_eq!(set.instances.len(), 3);
        for replica in &set.instances {
            assert!(
                members.contains(&replica.id),
                "replica {} is not a member of the tenant shard",
                replica.id
            );
        }
    }
}

#[tokio::test]
async fn zone_stable_sharding_scales_smoothly() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.put(
        "collectors/ring",
        cluster_desc(&["zone-a", "zone-b", "zone-c"], 10, 4),
    );
    let ring = started_ring(kv, zone_aware_cfg()).await;

    let mut previous = member_ids(&ring.shuffle_shard_with_zone_stability("tenant-a", 1));
    for size in 2..=12 {
        let current = member_ids(&ring.shuffle_shard_with_zone_stability("tenant-a", size));
        assert_eq!(current.len(), size);
        assert_eq!(
            current.difference(&previous).count(),
            1,
            "scaling from {} to {size} must add exactly one instance",
            size - 1
        );
        previous = current;
    }
}
