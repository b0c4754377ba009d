//! Auto-forget: drop instances whose heartbeat aged past a threshold.

use crate::model::Desc;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Removes from `desc` every instance whose last heartbeat is older than
/// `now - forget_period`, logging a warning per removal. Idempotent: running
/// it again with the same inputs removes nothing further.
pub fn auto_forget_from_ring(desc: &mut Desc, forget_period: Duration) {
    let now = Utc::now().timestamp();
    let cutoff = now - forget_period.as_secs() as i64;

    let expired: Vec<String> = desc
        .instances()
        .filter(|i| i.heartbeat_timestamp < cutoff)
        .map(|i| i.id.clone())
        .collect();

    for id in expired {
        if let Some(instance) = desc.remove_ingester(&id) {
            warn!(
                instance = %id,
                last_heartbeat = %DateTime::<Utc>::from_timestamp(instance.heartbeat_timestamp, 0)
                    .unwrap_or(DateTime::UNIX_EPOCH),
                forget_period_secs = forget_period.as_secs(),
                "auto-forgetting instance from the ring because it has been unhealthy for a long time"
            );
        }
    }
}
