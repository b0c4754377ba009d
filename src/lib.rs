//! # ringleader
//!
//! The membership ring at the heart of a horizontally scaled time-series
//! platform. It tracks the live fleet of worker instances (ingesters, store
//! gateways, rulers), maps every data key to a deterministic set of replica
//! instances, and carves stable per-tenant subrings via shuffle sharding.
//!
//! ## Key properties
//!
//! - **Consistent hashing**: replica selection walks a token ring, so
//!   adding or removing an instance moves at most one replica per key
//! - **Zone awareness**: replicas are spread across availability zones and
//!   quorum is reasoned about in zones, not instances
//! - **Shuffle sharding**: each tenant gets a deterministic subring that
//!   bounds its blast radius, with a topology-scoped cache
//! - **Read-side only**: the ring consumes descriptors published to a KV
//!   store by the write path; it never mutates the authoritative state
//!
//! ## Architecture
//!
//! A KV watch task installs descriptor updates and rebuilds the derived
//! token views; query threads resolve replica sets concurrently against the
//! current snapshot under a read-write lock. Published views are immutable,
//! so subrings share them without copying.

pub mod error;
pub mod forget;
pub mod kv;
pub mod model;
pub mod operation;
pub mod ring;
pub mod shard;
pub mod strategy;

mod telemetry;
mod tokens;

pub use error::{Error, Result};
pub use forget::auto_forget_from_ring;
pub use kv::{KvClient, MemoryKvStore};
pub use model::{CompareResult, Desc, InstanceDesc, InstanceInfo, InstanceState};
pub use operation::Operation;
pub use ring::{
    GetBuffers, ReplicationSet, Ring, RingConfig, GET_BUFFER_SIZE, GET_ZONE_SIZE,
};
pub use strategy::{
    DefaultReplicationStrategy, IgnoreUnhealthyInstancesReplicationStrategy, ReplicationStrategy,
};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::kv::{KvClient, MemoryKvStore};
    pub use crate::model::{Desc, InstanceDesc, InstanceState};
    pub use crate::operation::Operation;
    pub use crate::ring::{ReplicationSet, Ring, RingConfig};
    pub use crate::{Error, Result};
}
