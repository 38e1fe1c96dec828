//! Identifiers and records for replicated log entries.

use bytes::Bytes;
use std::fmt;

/// Identifier of a single log entry: the election term it was proposed in
/// and its position in the log.
///
/// Ordering is total: term first, then index within the term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    /// Election term the entry was proposed in.
    pub term: u64,
    /// Position of the entry in the log.
    pub index: u64,
}

impl OpId {
    /// Create a new [OpId].
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// A single replicated operation.
///
/// Entries are immutable once created. Clones are cheap: the payload is a
/// refcounted [Bytes] view shared by every copy, so handing an entry to a
/// reader does not duplicate its data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Identifier of this entry.
    pub id: OpId,
    /// Opaque operation payload. The cache never inspects it.
    pub payload: Bytes,
}

impl Entry {
    /// Fixed per-entry overhead charged against cache budgets (the id).
    const ID_OVERHEAD: usize = 16;

    /// Create a new [Entry].
    pub const fn new(id: OpId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Bytes this entry counts against cache budgets.
    pub fn size(&self) -> usize {
        Self::ID_OVERHEAD + self.payload.len()
    }
}
