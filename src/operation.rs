//! Compact encoding of per-operation instance-state policies.

use crate::model::InstanceState;

/// Describes which instances can be included in a replica set, based on
/// their state.
///
/// Implemented as a bitmap: the lower 16 bits mark states that are healthy
/// for the operation, the upper 16 bits mark states that extend the replica
/// set by one when encountered in a replica slot. Both properties are tested
/// on the hot path with a single mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation(u32);

impl Operation {
    /// All states are healthy, no state extends the replica set.
    pub(crate) const ALL_STATES_HEALTHY: Operation = Operation(0x0000ffff);

    /// Constructs an operation with the given healthy states and a predicate
    /// deciding which states extend the replica set.
    pub fn new<F>(healthy_states: &[InstanceState], should_extend_replica_set: F) -> Self
    where
        F: Fn(InstanceState) -> bool,
    {
        let mut op = 0u32;
        for s in healthy_states {
            op |= 1 << (*s as u32);
        }
        for s in InstanceState::ALL {
            if should_extend_replica_set(s) {
                op |= 0x10000 << (s as u32);
            }
        }
        Operation(op)
    }

    /// Write operation. Only ACTIVE instances are healthy, but a replica in
    /// any other state still consumes a slot, so the set is extended to place
    /// the extra replica somewhere. Unhealthy instances are filtered later by
    /// the replication strategy.
    pub fn write() -> Self {
        Self::new(&[InstanceState::Active], |s| s != InstanceState::Active)
    }

    /// Like [`Operation::write`], but extends the replica set only when a
    /// replica is READONLY.
    pub fn write_no_extend() -> Self {
        Self::new(&[InstanceState::Active], |s| s == InstanceState::ReadOnly)
    }

    /// Read operation. Reads are served by LEAVING, JOINING and READONLY
    /// instances too; the set is extended for the remaining states to match
    /// writes that were extended.
    pub fn read() -> Self {
        Self::new(
            &[
                InstanceState::Active,
                InstanceState::Pending,
                InstanceState::Leaving,
                InstanceState::Joining,
                InstanceState::ReadOnly,
            ],
            |s| {
                !matches!(
                    s,
                    InstanceState::Active
                        | InstanceState::Leaving
                        | InstanceState::Joining
                        | InstanceState::ReadOnly
                )
            },
        )
    }

    /// Sentinel operation for health inquiries: every state is healthy and
    /// the replica set is never extended.
    pub fn reporting() -> Self {
        Self::ALL_STATES_HEALTHY
    }

    /// Returns whether an instance in state `s` is healthy for this operation.
    pub fn is_instance_in_state_healthy(self, s: InstanceState) -> bool {
        self.0 & (1 << (s as u32)) > 0
    }

    /// Returns whether selecting an instance in state `s` should grow the
    /// replica set by one more instance.
    pub fn should_extend_replica_set_on_state(self, s: InstanceState) -> bool {
        self.0 & (0x10000 << (s as u32)) > 0
    }
}
