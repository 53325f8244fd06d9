//! In-memory [`StoreClient`] double for tests.
//!
//! Keeps a revision history so watches can replay from an arbitrary
//! start revision, mirroring the store semantics the keeper depends on.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::lease::{LeaseId, NO_LEASE_ID};

use super::{PrefixView, StoreClient, WatchEvent, WatchKind};

const WATCH_CHAN_CAPACITY: usize = 256;

#[derive(Default)]
struct MemInner {
    kvs: BTreeMap<String, String>,
    /// Every change ever applied, tagged with its revision.
    history: Vec<(i64, WatchEvent)>,
    revision: i64,
    leases: HashMap<LeaseId, i64>,
    next_lease: LeaseId,
    watchers: Vec<MemWatcher>,
}

struct MemWatcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
    cas_attempts: AtomicUsize,
    cas_delay: Mutex<Option<Duration>>,
}

impl MemStore {
    pub fn new() -> Self {
        let mut inner = MemInner::default();
        inner.next_lease = 100;
        Self {
            inner: Mutex::new(inner),
            cas_attempts: AtomicUsize::new(0),
            cas_delay: Mutex::new(None),
        }
    }

    /// Number of conditional writes attempted, successful or not.
    pub fn cas_attempts(&self) -> usize {
        self.cas_attempts.load(Ordering::SeqCst)
    }

    /// Make every conditional write pause first, so tests can observe
    /// in-flight publishes deterministically.
    pub fn set_cas_delay(&self, delay: Duration) {
        *self.cas_delay.lock().expect("lock") = Some(delay);
    }

    /// Current value of a key, if any.
    pub fn value_of(&self, key: &str) -> Option<String> {
        self.inner.lock().expect("lock").kvs.get(key).cloned()
    }

    /// Force a granted lease into the expired state.
    pub fn expire_lease(&self, lease: LeaseId) {
        self.inner
            .lock()
            .expect("lock")
            .leases
            .insert(lease, -1);
    }

    fn apply(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Option<(WatchEvent, Vec<mpsc::Sender<WatchEvent>>)> {
        let mut inner = self.inner.lock().expect("lock");
        Self::apply_locked(&mut inner, key, value)
    }

    fn apply_locked(
        inner: &mut MemInner,
        key: &str,
        value: Option<&str>,
    ) -> Option<(WatchEvent, Vec<mpsc::Sender<WatchEvent>>)> {
        let prev = inner.kvs.get(key).cloned();
        let event = match value {
            Some(value) => {
                let kind = if prev.is_some() {
                    WatchKind::Modify
                } else {
                    WatchKind::Create
                };
                inner.kvs.insert(key.to_string(), value.to_string());
                WatchEvent {
                    kind,
                    key: key.to_string(),
                    value: value.to_string(),
                    prev_value: prev,
                }
            }
            None => {
                // Deleting a missing key is a no-op with no event.
                prev.as_ref()?;
                inner.kvs.remove(key);
                WatchEvent {
                    kind: WatchKind::Delete,
                    key: key.to_string(),
                    value: String::new(),
                    prev_value: prev,
                }
            }
        };

        inner.revision += 1;
        let revision = inner.revision;
        inner.history.push((revision, event.clone()));

        inner
            .watchers
            .retain(|watcher| !watcher.tx.is_closed());
        let targets = inner
            .watchers
            .iter()
            .filter(|watcher| event.key.starts_with(&watcher.prefix))
            .map(|watcher| watcher.tx.clone())
            .collect();
        Some((event, targets))
    }

    async fn notify(&self, applied: Option<(WatchEvent, Vec<mpsc::Sender<WatchEvent>>)>) {
        if let Some((event, targets)) = applied {
            for tx in targets {
                let _ = tx.send(event.clone()).await;
            }
        }
    }
}

#[async_trait]
impl StoreClient for MemStore {
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixView> {
        let inner = self.inner.lock().expect("lock");
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(PrefixView {
            kvs,
            revision: inner.revision,
        })
    }

    async fn compare_and_swap(&self, key: &str, expect: &str, value: &str) -> Result<()> {
        self.cas_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.cas_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let applied = {
            let mut inner = self.inner.lock().expect("lock");
            let matches = inner.kvs.get(key).map(|v| v == expect).unwrap_or(false);
            if !matches {
                return Err(Error::ValueMismatch {
                    key: key.to_string(),
                });
            }
            Self::apply_locked(&mut inner, key, Some(value))
        };
        self.notify(applied).await;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, _lease: LeaseId) -> Result<()> {
        let applied = self.apply(key, Some(value));
        self.notify(applied).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let applied = self.apply(key, None);
        self.notify(applied).await;
        Ok(())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut inner = self.inner.lock().expect("lock");
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(id, ttl_secs);
        Ok(id)
    }

    async fn lease_ttl(&self, lease: LeaseId) -> Result<i64> {
        if lease == NO_LEASE_ID {
            return Ok(-1);
        }
        let inner = self.inner.lock().expect("lock");
        Ok(inner.leases.get(&lease).copied().unwrap_or(-1))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_rev: i64,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_CHAN_CAPACITY);
        let mut inner = self.inner.lock().expect("lock");
        // Replay history from start_rev, then go live; both happen under
        // the lock so no concurrent change can be lost or reordered.
        for (revision, event) in &inner.history {
            if *revision >= start_rev && event.key.starts_with(prefix) {
                let _ = tx.try_send(event.clone());
            }
        }
        inner.watchers.push(MemWatcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
