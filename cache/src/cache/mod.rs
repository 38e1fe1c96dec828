//! A write-through cache in front of a replicated log.
//!
//! The replication layer appends entries as they are written to the
//! durable log and reads recent entries back without touching disk. Newly
//! appended entries are visible to readers immediately, concurrently with
//! (not after) being made durable. Entries older than anything resident
//! are filled from the log by an asynchronous reader: a miss returns
//! [ReadResult::Incomplete] right away and the caller retries once the
//! fill lands, so no read ever blocks on disk.
//!
//! # Memory
//!
//! Every cache joins a named scope in a [crate::budget::Registry], giving
//! two hard ceilings: one per instance and one across all caches in the
//! scope. An append that would breach either ceiling is rejected with
//! [Error::HardLimitExceeded] and the caller is expected to apply
//! back-pressure. What is guaranteed resident is the set of entries at or
//! above the pin point plus everything still in flight to the log;
//! entries below the pin point are evicted opportunistically.
//!
//! # Pinning
//!
//! The replication layer advances the pin point ([LogCache::set_pinned])
//! to the lowest index any consumer still needs. Entries below it become
//! evictable, except those whose durable write has not yet completed:
//! losing the in-memory copy of an entry that is not yet on disk would
//! lose data.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use commonware_runtime::{deterministic, Metrics, Runner};
//! use quorum_cache::{budget, mocks, Config, Entry, LogCache, OpId, ReadResult};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let registry = budget::Registry::new();
//!     let writer = mocks::Writer::auto_ack();
//!     let reader = mocks::Reader::new(OpId::new(0, 0), vec![]);
//!     let cache = LogCache::new(
//!         context.with_label("cache"),
//!         &registry,
//!         Config::default(),
//!         writer,
//!         reader,
//!     );
//!     cache.init(OpId::new(1, 5)).unwrap();
//!
//!     // Appends must follow the preceding id; the receiver resolves once
//!     // the entry is durable.
//!     let appended = cache
//!         .append(Entry::new(OpId::new(1, 6), Bytes::from_static(b"op")))
//!         .unwrap();
//!     appended.await.unwrap().unwrap();
//!
//!     // Reads are served from memory.
//!     match cache.read(5, 1024).unwrap() {
//!         ReadResult::Entries(run, preceding) => {
//!             assert_eq!(run.len(), 1);
//!             assert_eq!(preceding, OpId::new(1, 5));
//!         }
//!         ReadResult::Incomplete => unreachable!(),
//!     }
//!
//!     cache.close().unwrap();
//! });
//! ```

use crate::entry::{Entry, OpId};
use thiserror::Error;

mod metrics;
mod storage;
pub use storage::LogCache;

/// Default budget scope joined by every log cache on a server.
pub const DEFAULT_SCOPE: &str = "log_cache";

/// Errors that can occur when interacting with the cache.
#[derive(Debug, Error)]
pub enum Error {
    /// The cache has been closed.
    #[error("cache closed")]
    Closed,
    /// Admitting the entry would breach a hard memory limit. The cache is
    /// left unmodified; the caller should apply back-pressure and retry.
    #[error("hard limit exceeded: {requested} bytes requested, instance {instance_used}/{instance_limit}, scope {shared_used}/{shared_limit}")]
    HardLimitExceeded {
        /// Bytes the rejected entry would have charged.
        requested: u64,
        /// Bytes currently charged to this cache.
        instance_used: u64,
        /// Hard limit for this cache.
        instance_limit: u64,
        /// Bytes currently charged across the scope.
        shared_used: u64,
        /// Hard limit across the scope.
        shared_limit: u64,
    },
    /// Closed while entries were still in flight to the durable log: data
    /// visible to readers (and possibly to peers) is not yet locally
    /// durable.
    #[error("closed with {0} entries not yet durable")]
    DirtyClose(usize),
    /// The durable log failed an append or a fill.
    #[error("wal: {0}")]
    Wal(#[from] crate::wal::Error),
}

/// Outcome of [LogCache::read].
#[derive(Debug)]
pub enum ReadResult {
    /// Consecutive entries following the requested index, and the id of
    /// the entry immediately preceding the run. The run is empty only when
    /// the requested index is the highest the cache knows.
    Entries(Vec<Entry>, OpId),
    /// The requested entries are not resident. A fill has been scheduled;
    /// retry once it completes.
    Incomplete,
}

/// Configuration for [LogCache].
#[derive(Clone)]
pub struct Config {
    /// Budget scope shared by every log cache on this server.
    pub scope: String,

    /// Hard limit on bytes held by this cache.
    pub instance_limit: u64,

    /// Hard limit on bytes held across the scope.
    pub shared_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: DEFAULT_SCOPE.into(),
            instance_limit: 128 << 20,
            shared_limit: 1 << 30,
        }
    }
}
