//! Multi-node mount coordination.
//!
//! When several processes mount the same bucket cooperatively, every path
//! has exactly one owner node, computed by a deterministic hash over the
//! static membership list. All mutations of a path are forwarded to its
//! owner over an internal JSON-over-TCP RPC and applied there, giving
//! single-writer-per-inode semantics without a distributed lock. Owners
//! broadcast short invalidation messages after mutating; a lost member
//! leaves its paths unreachable (`Stale`) until remount.

pub mod coordinator;
pub mod membership;
pub mod rpc;

pub use coordinator::Coordinator;
pub use membership::Membership;
pub use rpc::{NodeRequest, NodeResponse};
