//! Lease identities binding shard ownership to the store.

use serde::{Deserialize, Serialize};

/// Store lease identifier. Leases are granted by the consistent store;
/// clients only ever hold the opaque 64-bit id.
pub type LeaseId = i64;

/// Sentinel id meaning "no lease held".
pub const NO_LEASE_ID: LeaseId = 0;

/// A lease as carried in shard specs, lease nodes and session keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: LeaseId,
    /// Unix second after which the lease is considered expired.
    #[serde(default)]
    pub expire_at: i64,
}

/// The "no lease" sentinel; compares unequal to any granted lease.
pub const NO_LEASE: Lease = Lease {
    id: NO_LEASE_ID,
    expire_at: 0,
};

impl Lease {
    pub fn new(id: LeaseId, expire_at: i64) -> Self {
        Self { id, expire_at }
    }

    /// Lease identity is the id alone; expiry is advisory.
    pub fn same_as(&self, other: &Lease) -> bool {
        self.id == other.id
    }

    pub fn is_none(&self) -> bool {
        self.id == NO_LEASE_ID
    }
}

/// Value stored at the bridge and guard lease keys.
///
/// The bridge value names the guard it supersedes; the guard value names
/// the bridge it expects the keeper to have seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardLease {
    #[serde(flatten)]
    pub lease: Lease,

    /// During the bridge phase, the guard lease the local shards must
    /// currently hold.
    #[serde(rename = "guardLeaseID", default)]
    pub guard_lease_id: LeaseId,

    /// During the guard phase, the bridge lease of the round being closed.
    #[serde(rename = "bridgeLeaseID", default)]
    pub bridge_lease_id: LeaseId,

    /// Shards to release in this round (bridge phase only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
}

/// Drop instructions carried by a bridge lease. Adds are still delivered
/// by the coordinator in the guard phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    pub drops: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_lease_differs_from_granted() {
        let granted = Lease::new(42, 0);
        assert!(!granted.same_as(&NO_LEASE));
        assert!(!granted.is_none());
        assert!(NO_LEASE.is_none());
    }

    #[test]
    fn shard_lease_round_trips_flattened() {
        let sl = ShardLease {
            lease: Lease::new(7, 1700000000),
            guard_lease_id: 3,
            bridge_lease_id: 0,
            assignment: Some(Assignment {
                drops: vec!["s3".into()],
            }),
        };
        let raw = serde_json::to_string(&sl).unwrap();
        assert!(raw.contains("\"id\":7"));
        assert!(raw.contains("\"guardLeaseID\":3"));

        let back: ShardLease = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.lease.id, 7);
        assert_eq!(back.assignment.unwrap().drops, vec!["s3".to_string()]);
    }

    #[test]
    fn plain_lease_parses_as_shard_lease() {
        // Session keys store a bare lease; the watch dispatcher decodes
        // every lease value with the same type.
        let raw = r#"{"id":9,"expireAt":0}"#;
        let sl: ShardLease = serde_json::from_str(raw).unwrap();
        assert_eq!(sl.lease.id, 9);
        assert_eq!(sl.guard_lease_id, NO_LEASE_ID);
    }
}
