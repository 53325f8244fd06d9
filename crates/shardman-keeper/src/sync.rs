//! Periodic reconciliation of the durable log with the application.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use shardman_core::shard::ShardSpec;
use shardman_core::{Error, Result};

use crate::keeper::ShardKeeper;
use crate::storage::ShardRecord;

/// Cadence of the log → application reconciliation.
const SYNC_INTERVAL: Duration = Duration::from_millis(300);

impl ShardKeeper {
    pub(crate) fn start_sync_loop(self: &Arc<Self>) {
        let keeper = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNC_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = keeper.cancel_token().cancelled() => {
                        info!(service = %keeper.opts.service, "sync loop exit");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                if let Err(e) = keeper.sync_once().await {
                    error!(service = %keeper.opts.service, error = %e, "sync pass failed");
                }
            }
        });
    }

    /// One reconciliation pass. Per-shard failures are logged and
    /// retried on the next tick; only log I/O fails the pass.
    pub(crate) async fn sync_once(&self) -> Result<()> {
        let (guard, bridge, initialized) = {
            let state = self.leases.read().await;
            (state.guard, state.bridge, state.initialized)
        };

        let mut removals: Vec<String> = Vec::new();
        let mut updates: Vec<(String, ShardRecord)> = Vec::new();

        for (id, mut record) in self.log.entries()? {
            let lease = record.lease_id();

            // Only holders of the guard (or mid-round bridge) lease may
            // stay; anything else was assigned by a dead round.
            if lease != guard.id && lease != bridge.id {
                warn!(
                    shard = %id,
                    lease,
                    guard = guard.id,
                    "record under a foreign lease, dropping"
                );
                if self.drop_from_app(&id).await {
                    removals.push(id);
                }
                continue;
            }

            if record.dispatched && initialized {
                continue;
            }

            if record.pending_drop {
                info!(service = %self.opts.service, shard = %id, "dropping shard from application");
                if self.drop_from_app(&id).await {
                    removals.push(id);
                }
                continue;
            }

            info!(service = %self.opts.service, shard = %id, "adding shard to application");
            if self.add_to_app(&id, &record.spec).await {
                record.dispatched = true;
                updates.push((id, record));
            }
        }

        for id in &removals {
            self.log.remove(id)?;
        }
        for (id, record) in &updates {
            self.log.put(id, record)?;
        }

        if !initialized {
            self.leases.write().await.initialized = true;
        }
        Ok(())
    }

    async fn drop_from_app(&self, id: &str) -> bool {
        match crate::keeper::ShardPrimitives::drop(&*self.app, id).await {
            Ok(()) | Err(Error::NotExist) => true,
            Err(e) => {
                error!(
                    service = %self.opts.service,
                    shard = %id,
                    error = %e,
                    "application drop failed"
                );
                false
            }
        }
    }

    async fn add_to_app(&self, id: &str, spec: &ShardSpec) -> bool {
        match self.app.add(id, spec).await {
            Ok(()) | Err(Error::AlreadyExists) => true,
            Err(e) => {
                error!(
                    service = %self.opts.service,
                    shard = %id,
                    error = %e,
                    "application add failed"
                );
                false
            }
        }
    }
}
