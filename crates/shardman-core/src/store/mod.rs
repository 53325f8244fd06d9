//! Consistent-store client abstraction.
//!
//! Names exactly the store surface the shard manager relies on:
//! conditional writes, prefix reads, revision-anchored watches and lease
//! primitives. [`EtcdStore`] is the production implementation; the `mem`
//! module provides a faithful in-memory double for tests.

pub mod etcd;
#[cfg(any(test, feature = "test-utils"))]
pub mod mem;

pub use etcd::EtcdStore;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::lease::LeaseId;

/// Kind of change observed on a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Create,
    Modify,
    Delete,
}

/// A single change delivered by a prefix watch, in revision order.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub key: String,
    /// Current value; empty for deletes.
    pub value: String,
    /// Value before the change, when the store captured it.
    pub prev_value: Option<String>,
}

/// A prefix read together with the store revision it observed.
#[derive(Debug, Clone, Default)]
pub struct PrefixView {
    pub kvs: Vec<(String, String)>,
    pub revision: i64,
}

/// The consistent-store surface consumed by the coordinator and the
/// shard keeper.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Range-read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixView>;

    /// Atomically replace `expect` with `value` at `key`;
    /// [`crate::Error::ValueMismatch`] when the current value differs.
    async fn compare_and_swap(&self, key: &str, expect: &str, value: &str) -> Result<()>;

    /// Write `key`, bound to `lease` unless it is the no-lease sentinel.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Remaining TTL in seconds; zero or negative when expired or unknown.
    async fn lease_ttl(&self, lease: LeaseId) -> Result<i64>;

    /// Watch `prefix` from `start_rev`, delivering events in revision
    /// order until the receiver is dropped.
    async fn watch_prefix(&self, prefix: &str, start_rev: i64)
        -> Result<mpsc::Receiver<WatchEvent>>;
}
