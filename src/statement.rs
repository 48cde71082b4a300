//! Prepared statement names and the per-session statement cache.
use std::{num::NonZeroUsize, sync::Arc, sync::atomic::Ordering};

use lru::LruCache;

use crate::{common::ByteStr, postgres::backend::ColumnInfo};

type AtomicId = std::sync::atomic::AtomicU16;

/// A server-side prepared statement name.
///
/// Generated names are process wide unique (`s` + zero padded counter), so
/// a statement prepared on one session can never collide with another
/// session's name after a reconnect.
#[derive(Clone, PartialEq, Eq)]
pub struct StatementName([u8; 6]);

impl StatementName {
    /// The unnamed prepared statement, written as an empty string.
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 6])
    }

    pub(crate) fn next() -> Self {
        static ID: AtomicId = AtomicId::new(0);
        let id = ID.fetch_add(1, Ordering::SeqCst);

        let mut buf = [b's', b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: ascii only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for StatementName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for StatementName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("StatementName").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for StatementName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Cache identity of a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StatementKey {
    pub sql: ByteStr,
    pub param_oids: Box<[u32]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementState {
    /// Parse sent, ParseComplete not yet observed.
    Preparing,
    /// ParseComplete observed; the server holds the statement.
    Complete,
    /// Parse failed; the entry is evicted on sight.
    Invalid,
}

/// Result shape learned from a portal Describe of the statement.
#[derive(Debug, Clone)]
pub(crate) enum RowLayout {
    /// The statement returns no rows.
    NoData,
    Columns(Arc<[ColumnInfo]>),
}

#[derive(Debug)]
pub(crate) struct CachedStatement {
    pub name: StatementName,
    pub state: StatementState,
    /// Known result layout; lets the write path skip Describe.
    pub row: Option<RowLayout>,
}

/// Per-session LRU of prepared statements.
///
/// Entries survive transaction rollbacks (server-side prepared statements
/// do); they die with the session. Eviction does not talk to the server
/// directly: the evicted name is queued and closed by the next command
/// written on the session.
pub(crate) struct StatementCache {
    lru: LruCache<StatementKey, CachedStatement>,
    pending_close: Vec<StatementName>,
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.lru.len())
            .field("pending_close", &self.pending_close)
            .finish()
    }
}

impl StatementCache {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self { lru: LruCache::new(capacity), pending_close: Vec::new() }
    }

    pub(crate) fn get(&mut self, key: &StatementKey) -> Option<&CachedStatement> {
        self.lru.get(key)
    }

    /// Allocate a name and record the statement as preparing.
    ///
    /// An evicted entry's server-side statement is queued for Close.
    pub(crate) fn insert_preparing(&mut self, key: StatementKey) -> StatementName {
        let name = StatementName::next();
        let entry = CachedStatement {
            name: name.clone(),
            state: StatementState::Preparing,
            row: None,
        };
        if let Some((_, old)) = self.lru.push(key, entry) {
            // an Invalid entry never made it to the server
            if old.state != StatementState::Invalid && !old.name.is_unnamed() {
                self.pending_close.push(old.name);
            }
        }
        name
    }

    /// ParseComplete observed for `key`.
    pub(crate) fn promote(&mut self, key: &StatementKey) {
        if let Some(entry) = self.lru.peek_mut(key) {
            entry.state = StatementState::Complete;
        }
    }

    /// Parse failed for `key`; evict.
    pub(crate) fn invalidate(&mut self, key: &StatementKey) {
        self.lru.pop(key);
    }

    /// Drop `key` if its Parse never completed.
    pub(crate) fn invalidate_if_preparing(&mut self, key: &StatementKey) {
        if let Some(entry) = self.lru.peek(key)
            && entry.state == StatementState::Preparing
        {
            self.lru.pop(key);
        }
    }

    pub(crate) fn set_row(&mut self, key: &StatementKey, row: RowLayout) {
        if let Some(entry) = self.lru.peek_mut(key) {
            entry.row = Some(row);
        }
    }

    /// Names evicted since the last call, to be closed server side.
    pub(crate) fn take_pending_close(&mut self) -> Vec<StatementName> {
        std::mem::take(&mut self.pending_close)
    }

    /// Put a taken name back, when the Close could not be written.
    pub(crate) fn requeue_close(&mut self, name: StatementName) {
        self.pending_close.push(name);
    }
}
