//! Core shared types for the shardman system
//!
//! This crate contains the wire/data model (shard specs, leases, events,
//! move actions), the consistent-store key layout, the error taxonomy and
//! the store client abstraction shared between the coordinator and the
//! container-side shard keeper.

pub mod error;
pub mod event;
pub mod keys;
pub mod lease;
pub mod shard;
pub mod store;

pub use error::{Error, Result};
pub use lease::{Lease, LeaseId, ShardLease, NO_LEASE, NO_LEASE_ID};
