//! shardman coordinator
//!
//! The coordinator side of the shard manager: a per-service event queue
//! publishing rebalance tasks into the consistent store, a deadline
//! queue coalescing load signals, and the executor driving each task's
//! shard moves against the worker admin endpoints.

pub mod eq;
pub mod mover;
pub mod pq;

pub use eq::EventQueue;
pub use mover::MoveExecutor;
pub use pq::{Item, PriorityQueue};
