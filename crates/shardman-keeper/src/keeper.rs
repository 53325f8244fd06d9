//! Client-side shard ownership controller.
//!
//! The keeper recovers its durable log at startup, adopts the service's
//! guard lease and then follows the lease keys through a store watch:
//! a bridge creation opens a rebalance round, the matching guard update
//! closes it. All lease events are handled by a single worker in store
//! revision order; the sync loop pushes the resulting log state into the
//! application.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shardman_core::keys;
use shardman_core::lease::{Lease, ShardLease, NO_LEASE};
use shardman_core::shard::ShardSpec;
use shardman_core::store::StoreClient;
use shardman_core::{Error, Result};

use crate::storage::ShardLog;

/// Application callbacks through which shard ownership is applied.
///
/// Both must be idempotent: `add` of a live shard returns
/// [`Error::AlreadyExists`], `drop` of an unknown one [`Error::NotExist`];
/// the keeper treats both as success.
#[async_trait]
pub trait ShardPrimitives: Send + Sync {
    async fn add(&self, id: &str, spec: &ShardSpec) -> Result<()>;
    async fn drop(&self, id: &str) -> Result<()>;
}

/// Immutable keeper configuration.
#[derive(Clone)]
pub struct KeeperOptions {
    pub service: String,
    pub container_id: String,
    /// When set, a guard lease that has already expired at startup is
    /// not adopted and the local shards are released. When unset the
    /// stale lease is kept, trading safety for availability under a
    /// slow coordinator.
    pub drop_expired_shard: bool,
}

pub(crate) struct LeaseState {
    pub(crate) bridge: Lease,
    pub(crate) guard: Lease,
    /// First full sync pass completed.
    pub(crate) initialized: bool,
}

pub struct ShardKeeper {
    pub(crate) opts: KeeperOptions,
    pub(crate) store: Arc<dyn StoreClient>,
    pub(crate) log: Arc<dyn ShardLog>,
    pub(crate) app: Arc<dyn ShardPrimitives>,
    pub(crate) leases: RwLock<LeaseState>,
    start_rev: i64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ShardKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardKeeper")
            .field("service", &self.opts.service)
            .field("container_id", &self.opts.container_id)
            .finish()
    }
}

impl ShardKeeper {
    /// Recover the local log, adopt the current guard lease and start
    /// the sync loop. Fails with [`Error::NotExist`] when the service
    /// was never initialized in the store.
    pub async fn new(
        opts: KeeperOptions,
        store: Arc<dyn StoreClient>,
        log: Arc<dyn ShardLog>,
        app: Arc<dyn ShardPrimitives>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        // The application restarted with us and holds nothing: replay
        // every journaled shard on the first sync passes.
        log.reset()?;

        let prefix = keys::lease_prefix(&opts.service);
        let view = store.get_prefix(&prefix).await?;
        if view.kvs.is_empty() {
            error!(prefix = %prefix, "guard lease missing, service not initialized");
            return Err(Error::NotExist);
        }

        let mut guard = NO_LEASE;
        if view.kvs.len() == 1 {
            // A compaction may hide the last lease event from the watch,
            // so the startup read is authoritative for the guard.
            let lease: ShardLease = serde_json::from_str(&view.kvs[0].1)?;
            if !opts.drop_expired_shard {
                guard = lease.lease;
                info!(
                    service = %opts.service,
                    guard = lease.lease.id,
                    "adopted guard lease, expiry unchecked"
                );
            } else {
                match store.lease_ttl(lease.lease.id).await {
                    Ok(ttl) if ttl > 0 => {
                        guard = lease.lease;
                        info!(service = %opts.service, guard = lease.lease.id, ttl, "guard lease live");
                    }
                    Ok(_) => {
                        warn!(
                            service = %opts.service,
                            guard = lease.lease.id,
                            "guard lease expired, local shards will be released"
                        );
                    }
                    Err(e) => {
                        error!(
                            service = %opts.service,
                            guard = lease.lease.id,
                            error = %e,
                            "guard lease ttl query failed"
                        );
                    }
                }
            }
        }

        let keeper = Arc::new(Self {
            start_rev: view.revision + 1,
            leases: RwLock::new(LeaseState {
                bridge: NO_LEASE,
                guard,
                initialized: false,
            }),
            opts,
            store,
            log,
            app,
            cancel,
        });

        keeper.start_sync_loop();
        Ok(keeper)
    }

    /// Follow the lease prefix from the startup revision. Events are
    /// consumed by one worker so rounds are handled strictly serially.
    pub async fn watch_lease(self: &Arc<Self>) -> Result<()> {
        let prefix = keys::lease_prefix(&self.opts.service);
        let mut events = self.store.watch_prefix(&prefix, self.start_rev).await?;

        let keeper = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = keeper.cancel.cancelled() => {
                        info!(service = %keeper.opts.service, "lease watch exit");
                        return;
                    }
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => {
                            warn!(service = %keeper.opts.service, "lease watch stream closed");
                            return;
                        }
                    },
                };

                if let Err(e) = keeper.handle_lease_event(event).await {
                    error!(service = %keeper.opts.service, error = %e, "lease event failed");
                }
            }
        });
        Ok(())
    }

    /// Accept a shard handed over by the coordinator. The spec must
    /// carry the current guard lease.
    pub async fn add(&self, id: &str, spec: ShardSpec) -> Result<()> {
        let guard = self.leases.read().await.guard;
        if spec.lease_id() != guard.id {
            warn!(
                service = %self.opts.service,
                shard = %id,
                local_guard = guard.id,
                shard_lease = spec.lease_id(),
                "shard lease does not match guard"
            );
            return Err(Error::LeaseMismatch {
                shard: id.to_string(),
                expected: guard.id,
                actual: spec.lease_id(),
            });
        }
        self.log.add(spec)
    }

    /// Schedule a shard for release. Idempotent.
    pub async fn drop_shard(&self, id: &str) -> Result<()> {
        self.log.mark_drop(&[id.to_string()])
    }

    /// Current guard lease, for introspection.
    pub async fn guard_lease(&self) -> Lease {
        self.leases.read().await.guard
    }

    /// Current bridge lease; the no-lease sentinel outside a round.
    pub async fn bridge_lease(&self) -> Lease {
        self.leases.read().await.bridge
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        info!(service = %self.opts.service, "keeper shut down");
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
