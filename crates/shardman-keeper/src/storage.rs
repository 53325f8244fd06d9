//! Durable local shard log.
//!
//! The keeper journals every shard it has been asked to own and
//! reconciles the journal with the application asynchronously, so a
//! restarting container replays ownership without the coordinator's
//! help. Two engines: an in-memory log for tests and an on-disk fjall
//! log for production containers.

use std::collections::BTreeMap;
use std::path::Path;

use fjall::PartitionCreateOptions;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use shardman_core::lease::LeaseId;
use shardman_core::shard::ShardSpec;
use shardman_core::{Error, Result};

/// One journaled shard: its spec plus delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub spec: ShardSpec,
    /// The application has acknowledged the current add.
    #[serde(rename = "disp")]
    pub dispatched: bool,
    /// Pending release; the sync loop will drop it from the application.
    #[serde(rename = "drop")]
    pub pending_drop: bool,
}

impl ShardRecord {
    pub fn new(spec: ShardSpec) -> Self {
        Self {
            spec,
            dispatched: false,
            pending_drop: false,
        }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.spec.lease_id()
    }
}

/// Contract of the per-container durable shard log. Implementations
/// provide their own locking; the keeper and the admin handlers call in
/// concurrently.
pub trait ShardLog: Send + Sync {
    /// Clear every dispatched flag so the next sync replays all shards
    /// to the (restarted) application.
    fn reset(&self) -> Result<()>;

    /// Insert or overwrite the record for `spec`, not yet dispatched.
    fn add(&self, spec: ShardSpec) -> Result<()>;

    /// Mark the given shards for release; unknown ids are ignored.
    fn mark_drop(&self, ids: &[String]) -> Result<()>;

    /// Rewrite the lease of every record holding `from` to `to`.
    fn migrate_lease(&self, from: LeaseId, to: LeaseId) -> Result<()>;

    /// Mark records for release by lease: holders of `lease` when
    /// `exclude` is false, every *other* lease holder when it is true.
    fn drop_by_lease(&self, lease: LeaseId, exclude: bool) -> Result<()>;

    /// Point-in-time snapshot of all records.
    fn entries(&self) -> Result<Vec<(String, ShardRecord)>>;

    fn get(&self, id: &str) -> Result<Option<ShardRecord>>;

    fn put(&self, id: &str, record: &ShardRecord) -> Result<()>;

    fn remove(&self, id: &str) -> Result<()>;
}

/// In-memory log for tests and throwaway containers.
#[derive(Default)]
pub struct MemShardLog {
    records: RwLock<BTreeMap<String, ShardRecord>>,
}

impl MemShardLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShardLog for MemShardLog {
    fn reset(&self) -> Result<()> {
        for record in self.records.write().values_mut() {
            record.dispatched = false;
        }
        Ok(())
    }

    fn add(&self, spec: ShardSpec) -> Result<()> {
        let id = spec.id.clone();
        self.records.write().insert(id, ShardRecord::new(spec));
        Ok(())
    }

    fn mark_drop(&self, ids: &[String]) -> Result<()> {
        let mut records = self.records.write();
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                record.pending_drop = true;
            }
        }
        Ok(())
    }

    fn migrate_lease(&self, from: LeaseId, to: LeaseId) -> Result<()> {
        for record in self.records.write().values_mut() {
            if let Some(lease) = record.spec.lease.as_mut() {
                if lease.id == from {
                    lease.id = to;
                }
            }
        }
        Ok(())
    }

    fn drop_by_lease(&self, lease: LeaseId, exclude: bool) -> Result<()> {
        for record in self.records.write().values_mut() {
            let holds = record.lease_id() == lease;
            if holds != exclude {
                record.pending_drop = true;
            }
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, ShardRecord)>> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<ShardRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn put(&self, id: &str, record: &ShardRecord) -> Result<()> {
        self.records
            .write()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.records.write().remove(id);
        Ok(())
    }
}

/// fjall-backed durable log: one partition, key = shard id, value = the
/// JSON-encoded record.
pub struct FjallShardLog {
    keyspace: fjall::Keyspace,
    shards: fjall::PartitionHandle,
}

fn log_err(e: fjall::Error) -> Error {
    Error::Log(e.to_string())
}

impl FjallShardLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = fjall::Config::new(path).open().map_err(log_err)?;
        let shards = keyspace
            .open_partition("shards", PartitionCreateOptions::default())
            .map_err(log_err)?;
        Ok(Self { keyspace, shards })
    }

    fn decode(bytes: &[u8]) -> Result<ShardRecord> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn write(&self, id: &str, record: &ShardRecord) -> Result<()> {
        let buf = serde_json::to_vec(record)?;
        self.shards.insert(id.as_bytes(), buf).map_err(log_err)
    }

    /// Rewrite every record matching `pred` in one batch.
    fn update_where(
        &self,
        pred: impl Fn(&ShardRecord) -> bool,
        mut apply: impl FnMut(&mut ShardRecord),
    ) -> Result<()> {
        let mut updates = Vec::new();
        for entry in self.shards.iter() {
            let (key, value) = entry.map_err(log_err)?;
            let mut record = Self::decode(&value)?;
            if pred(&record) {
                apply(&mut record);
                updates.push((key, serde_json::to_vec(&record)?));
            }
        }

        if updates.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for (key, value) in updates {
            batch.insert(&self.shards, key, value);
        }
        batch.commit().map_err(log_err)
    }
}

impl ShardLog for FjallShardLog {
    fn reset(&self) -> Result<()> {
        self.update_where(|record| record.dispatched, |record| record.dispatched = false)
    }

    fn add(&self, spec: ShardSpec) -> Result<()> {
        let id = spec.id.clone();
        self.write(&id, &ShardRecord::new(spec))
    }

    fn mark_drop(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            let Some(value) = self.shards.get(id).map_err(log_err)? else {
                continue;
            };
            let mut record = Self::decode(&value)?;
            record.pending_drop = true;
            self.write(id, &record)?;
        }
        Ok(())
    }

    fn migrate_lease(&self, from: LeaseId, to: LeaseId) -> Result<()> {
        self.update_where(
            |record| record.lease_id() == from && record.spec.lease.is_some(),
            |record| {
                if let Some(lease) = record.spec.lease.as_mut() {
                    lease.id = to;
                }
            },
        )
    }

    fn drop_by_lease(&self, lease: LeaseId, exclude: bool) -> Result<()> {
        self.update_where(
            |record| (record.lease_id() == lease) != exclude,
            |record| record.pending_drop = true,
        )
    }

    fn entries(&self) -> Result<Vec<(String, ShardRecord)>> {
        let mut out = Vec::new();
        for entry in self.shards.iter() {
            let (key, value) = entry.map_err(log_err)?;
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                Self::decode(&value)?,
            ));
        }
        Ok(out)
    }

    fn get(&self, id: &str) -> Result<Option<ShardRecord>> {
        match self.shards.get(id).map_err(log_err)? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn put(&self, id: &str, record: &ShardRecord) -> Result<()> {
        self.write(id, record)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.shards.remove(id.as_bytes()).map_err(log_err)
    }
}
