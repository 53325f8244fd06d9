//! Lease-event handling: the bridge → guard handover.

use shardman_core::keys;
use shardman_core::lease::{Lease, ShardLease, NO_LEASE, NO_LEASE_ID};
use shardman_core::store::{WatchEvent, WatchKind};
use shardman_core::{Error, Result};
use tracing::{error, info};

use crate::keeper::ShardKeeper;

/// Lease values ride on the previous KV for deletes.
fn parse_shard_lease(event: &WatchEvent) -> Result<ShardLease> {
    let raw = match event.kind {
        WatchKind::Delete => event.prev_value.as_deref().unwrap_or_default(),
        _ => event.value.as_str(),
    };
    Ok(serde_json::from_str(raw)?)
}

impl ShardKeeper {
    pub(crate) async fn handle_lease_event(&self, event: WatchEvent) -> Result<()> {
        let lease = match parse_shard_lease(&event) {
            Ok(lease) => lease,
            Err(e) => {
                // Malformed store values must not wedge the worker.
                error!(key = %event.key, error = %e, "lease value decode failed, event skipped");
                return Ok(());
            }
        };
        info!(
            key = %event.key,
            kind = ?event.kind,
            lease = lease.lease.id,
            "lease event"
        );

        let service = &self.opts.service;
        if event.key == keys::lease_bridge(service) {
            self.acquire_bridge(&event, &lease).await
        } else if event.key == keys::lease_guard(service) {
            self.acquire_guard(&event, &lease).await
        } else if event.key.starts_with(&keys::session_prefix(service)) {
            self.handle_session_event(&event).await
        } else {
            Err(Error::Unexpected(format!(
                "unexpected lease key {}",
                event.key
            )))
        }
    }

    /// A bridge key opens a round (create) or abandons one (delete).
    async fn acquire_bridge(&self, event: &WatchEvent, lease: &ShardLease) -> Result<()> {
        match event.kind {
            WatchKind::Modify => Err(Error::Unexpected(format!(
                "bridge key modified at {}",
                event.key
            ))),
            WatchKind::Delete => {
                self.log.drop_by_lease(lease.lease.id, false)?;
                info!(
                    key = %event.key,
                    bridge = lease.lease.id,
                    "bridge released, holders dropped"
                );
                Ok(())
            }
            WatchKind::Create => {
                let mut state = self.leases.write().await;
                // A fresh round always starts from a clean slate, even
                // if the previous one never saw its guard update.
                state.bridge = NO_LEASE;

                if let Some(assignment) = &lease.assignment {
                    self.log.mark_drop(&assignment.drops)?;
                }
                self.log.migrate_lease(lease.guard_lease_id, lease.lease.id)?;

                state.bridge = lease.lease;
                info!(key = %event.key, bridge = lease.lease.id, "bridge lease acquired");
                Ok(())
            }
        }
    }

    /// A guard update closes the round opened by the bridge.
    async fn acquire_guard(&self, event: &WatchEvent, lease: &ShardLease) -> Result<()> {
        if event.kind == WatchKind::Create {
            // The guard node predates every keeper; a creation means the
            // watch is not looking at a live round.
            return Err(Error::Unexpected(format!(
                "guard created after keeper startup at {}",
                event.key
            )));
        }

        let mut state = self.leases.write().await;
        if state.bridge.is_none() {
            return Err(Error::Unexpected(format!(
                "guard update without a bridge at {}",
                event.key
            )));
        }
        if lease.bridge_lease_id != NO_LEASE_ID && state.bridge.id != lease.bridge_lease_id {
            return Err(Error::Unexpected(format!(
                "bridge lease mismatch at {}: coordinator speaks of {}, local round is {}",
                event.key, lease.bridge_lease_id, state.bridge.id
            )));
        }

        // Past the preconditions the round is over either way.
        let bridge = std::mem::replace(&mut state.bridge, NO_LEASE);

        // Install the guard first so records migrate straight under it.
        state.guard = lease.lease;
        self.log.migrate_lease(bridge.id, lease.lease.id)?;
        self.log.drop_by_lease(lease.lease.id, true)?;
        drop(state);

        info!(key = %event.key, guard = lease.lease.id, "guard lease acquired");

        // Liveness node bound to the guard lease: its disappearance
        // tells every keeper this container's shards are void.
        let session = keys::session(&self.opts.service, &self.opts.container_id);
        let value = serde_json::to_string(&lease.lease)?;
        if let Err(e) = self.store.put(&session, &value, lease.lease.id).await {
            error!(
                session = %session,
                guard = lease.lease.id,
                error = %e,
                "session publish failed"
            );
        }
        Ok(())
    }

    /// A session key vanishing means its container lost the guard lease;
    /// everything held under that lease is void.
    async fn handle_session_event(&self, event: &WatchEvent) -> Result<()> {
        match event.kind {
            WatchKind::Create | WatchKind::Modify => {
                info!(key = %event.key, kind = ?event.kind, "session event ignored");
                Ok(())
            }
            WatchKind::Delete => {
                let raw = event.prev_value.as_deref().unwrap_or_default();
                let lease: Lease = match serde_json::from_str(raw) {
                    Ok(lease) => lease,
                    Err(e) => {
                        error!(
                            key = %event.key,
                            raw = raw,
                            error = %e,
                            "session value decode failed, event skipped"
                        );
                        return Ok(());
                    }
                };
                self.log.drop_by_lease(lease.id, false)?;
                info!(key = %event.key, lease = lease.id, "dead session, holders dropped");
                Ok(())
            }
        }
    }
}
