//! Mock log collaborators for tests and simulation.

use crate::{
    entry::{Entry, OpId},
    wal,
};
use futures::channel::oneshot;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

/// A [wal::Writer] whose completions are released manually.
///
/// Parked appends resolve in arrival order via [Writer::release], letting
/// tests hold entries in flight deliberately. [Writer::auto_ack] builds a
/// writer that acknowledges every append immediately instead.
#[derive(Clone, Default)]
pub struct Writer {
    inner: Arc<Mutex<WriterInner>>,
}

#[derive(Default)]
struct WriterInner {
    pending: VecDeque<oneshot::Sender<Result<(), wal::Error>>>,
    auto: bool,
}

impl Writer {
    /// A writer that parks every append until released.
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer that acknowledges every append immediately.
    pub fn auto_ack() -> Self {
        let writer = Self::default();
        writer.inner.lock().unwrap().auto = true;
        writer
    }

    /// Number of appends currently parked.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Resolve the oldest parked append with `result`.
    ///
    /// # Panics
    ///
    /// Panics if no append is parked.
    pub fn release(&self, result: Result<(), wal::Error>) {
        let sender = self
            .inner
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .expect("no parked append");
        let _ = sender.send(result);
    }
}

impl wal::Writer for Writer {
    fn append(&mut self, _entry: Entry) -> oneshot::Receiver<Result<(), wal::Error>> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.auto {
            let _ = sender.send(Ok(()));
        } else {
            inner.pending.push_back(sender);
        }
        receiver
    }
}

/// A [wal::Reader] serving from a fixed durable log.
///
/// Constructed from the log's origin id and the contiguous run of entries
/// following it. Requests are counted (and the last one recorded) so tests
/// can assert coalescing, and the next request can be failed on demand.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<Mutex<ReaderInner>>,
}

struct ReaderInner {
    origin: OpId,
    entries: BTreeMap<u64, Entry>,
    fail_next: Option<wal::Error>,
    requests: usize,
    last_request: Option<(u64, u64)>,
}

impl Reader {
    /// A reader over `entries`, which must immediately follow `origin`.
    pub fn new(origin: OpId, entries: Vec<Entry>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReaderInner {
                origin,
                entries: entries
                    .into_iter()
                    .map(|entry| (entry.id.index, entry))
                    .collect(),
                fail_next: None,
                requests: 0,
                last_request: None,
            })),
        }
    }

    /// Fail the next request with `error`.
    pub fn fail_next(&self, error: wal::Error) {
        self.inner.lock().unwrap().fail_next = Some(error);
    }

    /// Number of requests served (including failures).
    pub fn requests(&self) -> usize {
        self.inner.lock().unwrap().requests
    }

    /// The most recent `(after, until)` request, if any.
    pub fn last_request(&self) -> Option<(u64, u64)> {
        self.inner.lock().unwrap().last_request
    }
}

impl wal::Reader for Reader {
    async fn read(&mut self, after: u64, until: u64) -> Result<(OpId, Vec<Entry>), wal::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests += 1;
        inner.last_request = Some((after, until));
        if let Some(error) = inner.fail_next.take() {
            return Err(error);
        }

        let boundary = if after == inner.origin.index {
            inner.origin
        } else {
            inner
                .entries
                .get(&after)
                .map(|entry| entry.id)
                .ok_or_else(|| wal::Error::ReadFailed(format!("no entry at {after}")))?
        };
        let mut run = Vec::new();
        for index in after + 1..=until {
            let entry = inner
                .entries
                .get(&index)
                .cloned()
                .ok_or_else(|| wal::Error::ReadFailed(format!("no entry at {index}")))?;
            run.push(entry);
        }
        Ok((boundary, run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::wal::{Reader as _, Writer as _};
    use futures::executor::block_on;

    fn entry(index: u64) -> Entry {
        Entry::new(OpId::new(1, index), Bytes::from_static(b"payload"))
    }

    #[test]
    fn test_reader_serves_range() {
        let mut reader = Reader::new(OpId::new(0, 0), (1..=5).map(entry).collect());
        let (boundary, run) = block_on(reader.read(2, 4)).unwrap();
        assert_eq!(boundary, OpId::new(1, 2));
        assert_eq!(
            run.iter().map(|entry| entry.id.index).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(reader.requests(), 1);
        assert_eq!(reader.last_request(), Some((2, 4)));

        // The origin bounds the readable range.
        let (boundary, run) = block_on(reader.read(0, 1)).unwrap();
        assert_eq!(boundary, OpId::new(0, 0));
        assert_eq!(run.len(), 1);

        // Requests outside the log fail.
        assert!(block_on(reader.read(5, 7)).is_err());
    }

    #[test]
    fn test_writer_parks_until_released() {
        let mut writer = Writer::new();
        let first = writer.append(entry(1));
        let second = writer.append(entry(2));
        assert_eq!(writer.pending(), 2);

        // Completions resolve in arrival order.
        writer.release(Ok(()));
        writer.release(Err(wal::Error::WriteFailed("disk".into())));
        assert!(matches!(block_on(first), Ok(Ok(()))));
        assert!(matches!(
            block_on(second),
            Ok(Err(wal::Error::WriteFailed(_)))
        ));
    }

    #[test]
    fn test_writer_auto_ack() {
        let mut writer = Writer::auto_ack();
        let appended = writer.append(entry(1));
        assert_eq!(writer.pending(), 0);
        assert!(matches!(block_on(appended), Ok(Ok(()))));
    }
}
