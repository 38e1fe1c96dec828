//! Log cache implementation.

use super::{metrics::Metrics, Config, Error, ReadResult};
use crate::{
    budget,
    entry::{Entry, OpId},
    wal,
};
use commonware_runtime::{Metrics as RuntimeMetrics, Spawner};
use futures::channel::oneshot;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info, warn};

/// Lifecycle of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
}

/// State protected by the cache lock.
///
/// The lock is held for short, synchronous spans only: hand-offs to the
/// durable log and to the fill reader always happen outside it.
struct Inner {
    state: State,

    /// Resident entries by index. Keys form a contiguous run starting at
    /// `preceding.index + 1`.
    entries: BTreeMap<u64, Entry>,

    /// Id of the entry immediately before the lowest resident entry, or
    /// the last known boundary when the cache is empty.
    preceding: OpId,

    /// Indices currently being written to the durable log. Never evicted:
    /// the in-memory copy is the only copy until the write completes.
    inflight: BTreeSet<u64>,

    /// Lowest index protected from eviction.
    pinned: u64,

    /// Whether a fill is outstanding. At most one at a time; concurrent
    /// misses coalesce onto it.
    fetching: bool,

    /// A failed fill, parked until the next retry of the missing range.
    fill_failed: Option<wal::Error>,
}

impl Inner {
    /// Index the next append must carry.
    fn next_index(&self) -> u64 {
        self.entries
            .last_key_value()
            .map_or(self.preceding.index + 1, |(&index, _)| index + 1)
    }

    /// Highest index known to the cache.
    fn highest_index(&self) -> u64 {
        self.entries
            .last_key_value()
            .map_or(self.preceding.index, |(&index, _)| index)
    }
}

/// Write-through cache for a replicated log.
///
/// Cloning yields another handle onto the same cache; all handles share
/// one set of entries, one budget membership and one set of metrics.
#[derive(Clone)]
pub struct LogCache<E: Spawner + RuntimeMetrics, W: wal::Writer, R: wal::Reader> {
    context: E,
    writer: W,
    reader: R,
    inner: Arc<Mutex<Inner>>,
    budget: Arc<budget::Handle>,
    metrics: Arc<Metrics>,
}

impl<E: Spawner + RuntimeMetrics, W: wal::Writer, R: wal::Reader> LogCache<E, W, R> {
    /// Create a cache attached to one durable log.
    ///
    /// Joins `cfg.scope` in `registry`; the membership lasts until the last
    /// clone of the cache is dropped. Metrics are registered under the
    /// label of `context`.
    pub fn new(context: E, registry: &budget::Registry, cfg: Config, writer: W, reader: R) -> Self {
        let metrics = Arc::new(Metrics::init(&context));
        let budget = Arc::new(registry.join(&cfg.scope, cfg.instance_limit, cfg.shared_limit));
        Self {
            context,
            writer,
            reader,
            inner: Arc::new(Mutex::new(Inner {
                state: State::Open,
                entries: BTreeMap::new(),
                preceding: OpId::default(),
                inflight: BTreeSet::new(),
                pinned: 1,
                fetching: false,
                fill_failed: None,
            })),
            budget,
            metrics,
        }
    }

    /// Establish the id immediately preceding the first entry this cache
    /// will hold. The next append must follow it.
    ///
    /// The pin point starts at `preceding.index + 1`: nothing is evictable
    /// until the replication layer first advances it.
    ///
    /// # Panics
    ///
    /// Panics if entries are already resident.
    pub fn init(&self, preceding: OpId) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return Err(Error::Closed);
        }
        assert!(inner.entries.is_empty(), "init requires an empty cache");
        inner.preceding = preceding;
        inner.pinned = preceding.index + 1;
        debug!(preceding = %preceding, "initialized");
        Ok(())
    }

    /// Append `entry` to the cache and the durable log.
    ///
    /// On success the entry is visible to [Self::read] immediately, before
    /// it is durable, and the returned receiver resolves exactly once with
    /// the durable write's outcome. "Cached" must therefore never be
    /// treated as "committed" by the replication layer.
    ///
    /// If admitting the entry would breach the instance or the scope hard
    /// limit, an eviction pass runs and the check is retried; on a second
    /// breach the append is rejected with [Error::HardLimitExceeded] and
    /// the cache is left unmodified. Rejection is the back-pressure signal:
    /// the caller still holds its (cheaply cloneable) entry and decides
    /// whether to stall writers or shed a lagging consumer.
    ///
    /// # Panics
    ///
    /// Panics if `entry.id.index` does not immediately follow the highest
    /// index known to the cache: the caller and the log disagree about
    /// ordering, which is unrecoverable.
    pub fn append(&self, entry: Entry) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let index = entry.id.index;
        let size = entry.size() as u64;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Closed {
                return Err(Error::Closed);
            }
            let next = inner.next_index();
            assert!(
                index == next,
                "out-of-order append: expected index {next}, got {index}"
            );
            if self.budget.would_exceed(size) {
                // Unpinned entries may be lingering; make room before
                // rejecting.
                self.evict_locked(&mut inner);
            }
            if self.budget.would_exceed(size) {
                debug!(index, size, "rejecting append: hard limit");
                return Err(Error::HardLimitExceeded {
                    requested: size,
                    instance_used: self.budget.used(),
                    instance_limit: self.budget.instance_limit(),
                    shared_used: self.budget.scope_used(),
                    shared_limit: self.budget.shared_limit(),
                });
            }
            inner.entries.insert(index, entry.clone());
            inner.inflight.insert(index);
            self.budget.charge(size);
            self.metrics.ops.inc();
            self.metrics.bytes.set(self.budget.used() as i64);
            self.metrics.appends.inc();
            debug!(index, size, "appended");
        }

        // Hand the entry to the durable log outside the lock. The
        // completion re-enters the lock to clear the in-flight mark, then
        // resolves the caller's receiver.
        let mut writer = self.writer.clone();
        let completion = writer.append(entry);
        let (sender, receiver) = oneshot::channel();
        let inner = self.inner.clone();
        self.context.clone().spawn(move |_| async move {
            let result = match completion.await {
                Ok(outcome) => outcome.map_err(Error::from),
                // The writer dropped the completion without resolving it.
                Err(_) => Err(Error::Wal(wal::Error::Closed)),
            };
            inner.lock().unwrap().inflight.remove(&index);
            if let Err(ref err) = result {
                warn!(index, error = %err, "durable append failed");
            }
            // The caller may have dropped its receiver; the in-flight
            // bookkeeping above is already settled either way.
            let _ = sender.send(result);
        });
        Ok(receiver)
    }

    /// Read consecutive entries following `after_index`, along with the id
    /// of the entry immediately preceding the returned run.
    ///
    /// The run's total [Entry::size] stays within `max_bytes` unless the
    /// first qualifying entry alone exceeds it, in which case exactly that
    /// one entry is returned; if any qualifying entry is resident at all,
    /// at least one is returned. An empty run means `after_index` is the
    /// highest index the cache knows.
    ///
    /// If `after_index` is older than anything resident, an asynchronous
    /// fill is scheduled (coalesced with any fill already outstanding) and
    /// [ReadResult::Incomplete] is returned immediately; retry once the
    /// fill lands. A failed fill surfaces as [Error::Wal] on the next
    /// retry, after which a fresh fill may be scheduled. This method never
    /// blocks on disk.
    ///
    /// # Panics
    ///
    /// Panics if the region following `after_index` is not protected by
    /// the pin point (pin first, then read) or if `after_index` is beyond
    /// the highest index known to the cache.
    pub fn read(&self, after_index: u64, max_bytes: usize) -> Result<ReadResult, Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return Err(Error::Closed);
        }
        assert!(
            after_index + 1 >= inner.pinned,
            "read below pin point: after {after_index}, pinned {}",
            inner.pinned
        );
        let highest = inner.highest_index();
        assert!(
            after_index <= highest,
            "read past the log tip: after {after_index}, tip {highest}"
        );

        // Older than anything resident: fill from the durable log.
        if after_index < inner.preceding.index {
            if let Some(err) = inner.fill_failed.take() {
                return Err(err.into());
            }
            if inner.fetching {
                return Ok(ReadResult::Incomplete);
            }
            inner.fetching = true;
            self.metrics.misses.inc();
            let until = inner.preceding.index;
            drop(inner);
            self.schedule_fill(after_index, until);
            return Ok(ReadResult::Incomplete);
        }

        let preceding = if after_index == inner.preceding.index {
            inner.preceding
        } else {
            inner
                .entries
                .get(&after_index)
                .map(|entry| entry.id)
                .expect("cached run is contiguous")
        };
        let mut run = Vec::new();
        let mut total = 0;
        for entry in inner.entries.range(after_index + 1..).map(|(_, entry)| entry) {
            if !run.is_empty() && total + entry.size() > max_bytes {
                break;
            }
            total += entry.size();
            run.push(entry.clone());
        }
        Ok(ReadResult::Entries(run, preceding))
    }

    /// Whether the cache currently holds the entry at `index`.
    pub fn contains(&self, index: u64) -> bool {
        self.inner.lock().unwrap().entries.contains_key(&index)
    }

    /// Move the eviction floor. Entries with index >= `index` will not be
    /// evicted; entries below it become evictable once durable.
    ///
    /// The floor may sit below the lowest resident entry (protecting
    /// entries that are not yet loaded) or above the highest (protecting
    /// nothing). Does not itself evict: the next [Self::evict] pass, or the
    /// admission check of a later append, applies the new floor.
    pub fn set_pinned(&self, index: u64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return Err(Error::Closed);
        }
        inner.pinned = index;
        debug!(pinned = index, "moved pin point");
        Ok(())
    }

    /// Evict entries below the pin point.
    ///
    /// The pass walks up from the lowest resident entry and stops at the
    /// first one it must retain, so the resident run stays contiguous. An
    /// entry still in flight to the durable log is retained regardless of
    /// the pin point and becomes evictable once its write completes.
    pub fn evict(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.evict_locked(&mut inner);
    }

    fn evict_locked(&self, inner: &mut Inner) {
        let mut freed = 0u64;
        let mut removed = 0u64;
        loop {
            let Some((&index, entry)) = inner.entries.first_key_value() else {
                break;
            };
            if index >= inner.pinned || inner.inflight.contains(&index) {
                break;
            }
            let id = entry.id;
            freed += entry.size() as u64;
            removed += 1;
            inner.entries.remove(&index);
            inner.preceding = id;
        }
        if removed > 0 {
            self.budget.release(freed);
            self.metrics.ops.set(inner.entries.len() as i64);
            self.metrics.bytes.set(self.budget.used() as i64);
            debug!(removed, freed, pinned = inner.pinned, "evicted");
        }
    }

    /// Close the cache. One-way and idempotent.
    ///
    /// Pending fills are discarded on delivery. In-flight durable writes
    /// are not cancelled: their completion receivers still resolve. If any
    /// entry is still in flight, [Error::DirtyClose] is returned: data
    /// visible to readers (and possibly already replicated to peers) is
    /// not yet locally durable, which callers must surface rather than
    /// ignore.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return Ok(());
        }
        inner.state = State::Closed;
        let dirty = inner.inflight.len();
        debug!(dirty, "closed");
        if dirty > 0 {
            error!(
                dirty,
                "closed with entries not yet durable: local log is behind replication"
            );
            return Err(Error::DirtyClose(dirty));
        }
        Ok(())
    }

    /// Bytes of entry data currently held by this cache.
    pub fn bytes_used(&self) -> u64 {
        self.budget.used()
    }

    /// One-line summary of cache occupancy.
    pub fn stats(&self) -> String {
        let inner = self.inner.lock().unwrap();
        self.stats_locked(&inner)
    }

    /// The stats line followed by one line per resident entry.
    pub fn dump(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut lines = Vec::with_capacity(inner.entries.len() + 1);
        lines.push(self.stats_locked(&inner));
        for entry in inner.entries.values() {
            let marker = if inner.inflight.contains(&entry.id.index) {
                " (in flight)"
            } else {
                ""
            };
            lines.push(format!(
                "entry {}: {} payload bytes{}",
                entry.id,
                entry.payload.len(),
                marker
            ));
        }
        lines
    }

    /// Emit the current contents to the log.
    pub fn log_dump(&self) {
        for line in self.dump() {
            info!("{line}");
        }
    }

    fn stats_locked(&self, inner: &Inner) -> String {
        format!(
            "entries: {} ({} in flight), bytes: {}/{} (scope: {}/{}), preceding: {}, pinned: {}",
            inner.entries.len(),
            inner.inflight.len(),
            self.budget.used(),
            self.budget.instance_limit(),
            self.budget.scope_used(),
            self.budget.shared_limit(),
            inner.preceding,
            inner.pinned,
        )
    }

    fn schedule_fill(&self, after: u64, until: u64) {
        debug!(after, until, "scheduling fill");
        let mut reader = self.reader.clone();
        let cache = self.clone();
        self.context.clone().spawn(move |_| async move {
            let result = reader.read(after, until).await;
            cache.complete_fill(after, until, result);
        });
    }

    fn complete_fill(
        &self,
        after: u64,
        until: u64,
        result: Result<(OpId, Vec<Entry>), wal::Error>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.fetching = false;
        if inner.state == State::Closed {
            debug!(after, until, "discarding fill: cache closed");
            return;
        }
        match result {
            Err(err) => {
                warn!(after, until, error = %err, "fill failed");
                inner.fill_failed = Some(err);
            }
            Ok((boundary, run)) => {
                // Merge from the top of the loaded run downward while it
                // still attaches to the resident run and fits the budget;
                // the remainder is dropped and a later retry re-fetches.
                let mut merged = 0u64;
                let mut iter = run.into_iter().rev().peekable();
                while let Some(loaded) = iter.next() {
                    if loaded.id != inner.preceding {
                        break;
                    }
                    let size = loaded.size() as u64;
                    if self.budget.would_exceed(size) {
                        break;
                    }
                    let below = iter.peek().map_or(boundary, |next| next.id);
                    self.budget.charge(size);
                    inner.entries.insert(loaded.id.index, loaded);
                    inner.preceding = below;
                    merged += 1;
                }
                if merged > 0 {
                    self.metrics.fills.inc();
                    self.metrics.ops.set(inner.entries.len() as i64);
                    self.metrics.bytes.set(self.budget.used() as i64);
                }
                debug!(after, until, merged, "fill completed");
            }
        }
    }
}
