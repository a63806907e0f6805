//! Object-store adapters for DriftFS.
//!
//! Real cloud drivers plug in from outside the core; this crate carries the
//! pieces every mount composes around a driver:
//!
//! - [`MemoryBackend`] - a full-fidelity in-memory object store used as the
//!   reference implementation in tests (paged listings, multipart sessions,
//!   conditional reads, fault injection)
//! - [`RetryingBackend`] - exponential backoff over transient failures
//! - [`GatedBackend`] - the two global parallelism gates (small vs bulk
//!   actions)
//!
//! A production mount stacks them as
//! `GatedBackend<RetryingBackend<Driver>>`.

pub mod gate;
pub mod memory;
pub mod retry;

pub use gate::GatedBackend;
pub use memory::MemoryBackend;
pub use retry::RetryingBackend;
