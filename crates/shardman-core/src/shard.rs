//! Shard specifications and move instructions.

use serde::{Deserialize, Serialize};

use crate::lease::{Lease, LeaseId, NO_LEASE_ID};

/// Specification of one shard of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    pub id: String,
    pub service: String,
    /// Application-defined work description, opaque to the manager.
    pub task: String,
    /// Ownership lease stamped by the coordinator before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    pub update_time: i64,
}

impl ShardSpec {
    pub fn lease_id(&self) -> LeaseId {
        self.lease.map(|l| l.id).unwrap_or(NO_LEASE_ID)
    }
}

/// Body of the worker admin `add-shard` / `drop-shard` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMessage {
    pub id: String,
    pub spec: ShardSpec,
}

/// One drop/add instruction within a published task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAction {
    pub service: String,
    pub shard_id: String,
    /// Endpoint currently owning the shard; absent for pure adds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_endpoint: Option<String>,
    /// Endpoint receiving the shard; absent for pure drops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_endpoint: Option<String>,
    /// Bootstrap moves may give up on a failed add instead of failing
    /// the whole task.
    #[serde(default)]
    pub allow_drop: bool,
    pub spec: ShardSpec,
}
