//! KV store contract consumed by the ring, plus an in-process
//! implementation for development and tests.

use crate::error::Result;
use crate::model::Desc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Client for the key-value store holding the authoritative ring descriptor.
///
/// This trait abstracts the KV backend. The ring only ever reads through it;
/// writers (lifecyclers, admin tooling) mutate the descriptor out of band.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Fetch the current descriptor under `key`, or `None` if the key has
    /// never been written.
    async fn get(&self, key: &str) -> Result<Option<Desc>>;

    /// Invoke `cb` with every subsequent value of `key` until `cb` returns
    /// `false` or `shutdown` is cancelled. Callbacks are serialized: the next
    /// value is not delivered before `cb` returns.
    async fn watch_key(
        &self,
        key: &str,
        shutdown: CancellationToken,
        cb: &mut (dyn FnMut(Option<Desc>) -> bool + Send),
    );

    /// Wall-clock time of the most recent successful sync of `key`. Must be
    /// cheap: the ring calls this on its hot path while holding a lock.
    fn last_update_time(&self, key: &str) -> DateTime<Utc>;
}

struct Entry {
    value: Desc,
    updated_at: DateTime<Utc>,
}

/// In-process KV store backed by a mutex-guarded map.
///
/// Suitable for development, testing and single-process deployments; real
/// deployments plug a consul/etcd-backed [`KvClient`] in instead.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    changes: ChangeBus,
}

struct ChangeBus(broadcast::Sender<String>);

impl Default for ChangeBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self(tx)
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` and wake every watcher of that key.
    pub fn put(&self, key: &str, value: Desc) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                updated_at: Utc::now(),
            },
        );
        let _ = self.changes.0.send(key.to_string());
    }

    /// Atomically update `key`: `f` receives the current value and returns
    /// the new one, or `None` to leave the key untouched. The store lock is
    /// held across `f`, so no retry loop is needed.
    pub fn cas(
        &self,
        key: &str,
        f: impl FnOnce(Option<Desc>) -> Result<Option<Desc>>,
    ) -> Result<()> {
        let changed = {
            let mut entries = self.entries.lock();
            let current = entries.get(key).map(|e| e.value.clone());
            match f(current)? {
                Some(next) => {
                    entries.insert(
                        key.to_string(),
                        Entry {
                            value: next,
                            updated_at: Utc::now(),
                        },
                    );
                    true
                }
                None => false,
            }
        };
        if changed {
            let _ = self.changes.0.send(key.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl KvClient for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Desc>> {
        Ok(self.entries.lock().get(key).map(|e| e.value.clone()))
    }

    async fn watch_key(
        &self,
        key: &str,
        shutdown: CancellationToken,
        cb: &mut (dyn FnMut(Option<Desc>) -> bool + Send),
    ) {
        let mut rx = self.changes.0.subscribe();

        // Deliver the value present at subscription time, so a write racing
        // with watcher startup is never missed.
        let current = self.entries.lock().get(key).map(|e| e.value.clone());
        if let Some(value) = current {
            if !cb(Some(value)) {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = rx.recv() => match changed {
                    Ok(changed_key) if changed_key == key => {
                        let value = self.entries.lock().get(key).map(|e| e.value.clone());
                        if !cb(value) {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    // The receiver lagged behind; deliver the latest value so
                    // the watcher converges instead of missing it.
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let value = self.entries.lock().get(key).map(|e| e.value.clone());
                        if !cb(value) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    fn last_update_time(&self, key: &str) -> DateTime<Utc> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.updated_at)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceState;
    use std::sync::Arc;
    use std::time::Duration;

    fn desc_with(ids: &[&str]) -> Desc {
        let mut desc = Desc::new();
        for (i, id) in ids.iter().enumerate() {
            desc.add_ingester(
                *id,
                format!("{id}:9095"),
                "zone-a",
                vec![1000 + i as u32],
                InstanceState::Active,
                0,
            );
        }
        desc
    }

    #[tokio::test]
    async fn get_returns_latest_put() {
        let store = MemoryKvStore::new();
        assert!(store.get("ring").await.unwrap().is_none());

        store.put("ring", desc_with(&["ing-1"]));
        let desc = store.get("ring").await.unwrap().unwrap();
        assert!(desc.contains("ing-1"));
    }

    #[tokio::test]
    async fn cas_applies_atomic_update() {
        let store = MemoryKvStore::new();
        store.put("ring", desc_with(&["ing-1"]));

        store
            .cas("ring", |current| {
                let mut desc = current.unwrap();
                desc.add_ingester("ing-2", "ing-2:9095", "zone-b", vec![2], InstanceState::Active, 0);
                Ok(Some(desc))
            })
            .unwrap();

        let desc = store.get("ring").await.unwrap().unwrap();
        assert_eq!(desc.len(), 2);
    }

    #[tokio::test]
    async fn last_update_time_advances_on_write() {
        let store = MemoryKvStore::new();
        assert_eq!(store.last_update_time("ring"), DateTime::UNIX_EPOCH);

        store.put("ring", desc_with(&["ing-1"]));
        let first = store.last_update_time("ring");
        assert!(first > DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn watch_delivers_updates_until_cancelled() {
        let store = Arc::new(MemoryKvStore::new());
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let watcher = {
            let store = Arc::clone(&store);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut cb = move |value: Option<Desc>| {
                    tx.send(value).is_ok()
                };
                store.watch_key("ring", shutdown, &mut cb).await;
            })
        };

        store.put("ring", desc_with(&["ing-1"]));
        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watch timed out")
            .expect("watch channel closed");
        assert!(seen.unwrap().contains("ing-1"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn watch_ignores_other_keys() {
        let store = Arc::new(MemoryKvStore::new());
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let watcher = {
            let store = Arc::clone(&store);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut cb = move |value: Option<Desc>| tx.send(value).is_ok();
                store.watch_key("ring", shutdown, &mut cb).await;
            })
        };

        store.put("other", desc_with(&["ing-9"]));
        store.put("ring", desc_with(&["ing-1"]));

        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watch timed out")
            .expect("watch channel closed")
            .unwrap();
        assert!(seen.contains("ing-1"));
        assert!(!seen.contains("ing-9"));

        shutdown.cancel();
        watcher.await.unwrap();
    }
}
