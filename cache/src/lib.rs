//! Write-through cache for a replicated log.
//!
//! [LogCache] holds recently appended log entries in memory so the
//! replication layer can append and re-read them without touching disk on
//! the common path. Appends flow through the cache into a durable
//! [wal::Writer]; reads for entries older than anything resident are
//! filled asynchronously by a [wal::Reader] and reported as
//! [ReadResult::Incomplete] in the meantime. Memory is bounded by hard
//! per-instance and server-wide limits enforced through a shared
//! [budget::Registry]. See [cache] for the full contract and a worked
//! example.

pub mod budget;
pub mod cache;
pub mod entry;
pub mod mocks;
pub mod wal;

pub use cache::{Config, Error, LogCache, ReadResult, DEFAULT_SCOPE};
pub use entry::{Entry, OpId};
