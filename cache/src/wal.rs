//! Interfaces to the durable write-ahead log.
//!
//! The cache sits in front of a durable log owned elsewhere: accepted
//! appends are handed to a [Writer] as they enter the cache, and reads for
//! entries older than anything resident are filled by a [Reader]. Both
//! complete asynchronously and neither is assumed to be cheap; the cache
//! never awaits either while holding its lock.

use crate::entry::{Entry, OpId};
use futures::channel::oneshot;
use std::future::Future;
use thiserror::Error;

/// Errors surfaced by the durable log.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// The range read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// The log rejected the request because it is shutting down.
    #[error("log closed")]
    Closed,
}

/// Durable sink for appended entries.
pub trait Writer: Clone + Send + 'static {
    /// Hand `entry` to the durable log.
    ///
    /// The call enqueues only; entries are made durable in the order
    /// handed over. The returned receiver resolves exactly once with the
    /// write's outcome: `Ok(())` once the entry is locally durable, or an
    /// error once the write has definitively failed.
    fn append(&mut self, entry: Entry) -> oneshot::Receiver<Result<(), Error>>;
}

/// Source of entries already durable in the log.
pub trait Reader: Clone + Send + 'static {
    /// Read the consecutive run of entries with indices in `(after, until]`.
    ///
    /// Resolves exactly once per call with the id of the entry at `after`
    /// (so the caller can maintain its preceding marker) and the full run,
    /// or with an error.
    fn read(
        &mut self,
        after: u64,
        until: u64,
    ) -> impl Future<Output = Result<(OpId, Vec<Entry>), Error>> + Send;
}
