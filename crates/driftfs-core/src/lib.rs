//! DriftFS Core - domain types and port definitions
//!
//! This crate contains the shared vocabulary of the filesystem core:
//! - **Domain types** - `InodeId`, `ObjectKey`, `Etag`, inode attributes,
//!   and the `FsError` taxonomy surfaced as POSIX errno at the kernel edge
//! - **Port definition** - the [`ports::ObjectBackend`] trait that every
//!   object-store driver implements, together with its typed DTOs and
//!   [`ports::Capabilities`] record
//! - **Configuration** - typed mount configuration with YAML loading
//! - **Metrics** - the Prometheus registry shared by the pipeline
//!
//! The crate is deliberately free of I/O: adapters live in `driftfs-store`,
//! the data plane in `driftfs-cache` and `driftfs-flush`, and the filesystem
//! tree in `driftfs-fs`.

pub mod config;
pub mod domain;
pub mod metrics;
pub mod ports;
