//! Server-side prepared statement cache.
//!
//! Handles are keyed by SQL text and shared behind `Arc`. A handle counts
//! its users; it is deallocated on the server when it is neither cached nor
//! in use. Deallocation is deferred: closing pushes the statement id onto a
//! [`CloseQueue`] that the session flushes (as `COM_STMT_CLOSE`) before its
//! next command.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::ColumnDescriptor;
use crate::types::column::Columns;

/// Statement ids waiting for `COM_STMT_CLOSE`.
#[derive(Debug, Clone, Default)]
pub struct CloseQueue(Arc<Mutex<Vec<u32>>>);

impl CloseQueue {
    pub fn push(&self, statement_id: u32) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement_id);
    }

    /// Take every pending id.
    pub fn drain(&self) -> Vec<u32> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A server-side prepared statement.
pub struct PreparedHandle {
    pub statement_id: u32,
    pub sql: String,
    pub params: Columns,
    /// Result columns as described at prepare time
    pub columns: Columns,
    uses: AtomicUsize,
    cached: AtomicBool,
    closed: AtomicBool,
    queue: CloseQueue,
}

impl fmt::Debug for PreparedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedHandle")
            .field("statement_id", &self.statement_id)
            .field("sql", &self.sql)
            .field("uses", &self.use_count())
            .field("cached", &self.is_cached())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PreparedHandle {
    pub fn new(
        statement_id: u32,
        sql: impl Into<String>,
        params: Vec<ColumnDescriptor>,
        columns: Vec<ColumnDescriptor>,
        queue: CloseQueue,
    ) -> Self {
        Self {
            statement_id,
            sql: sql.into(),
            params: params.into(),
            columns: columns.into(),
            uses: AtomicUsize::new(0),
            cached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queue,
        }
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn use_count(&self) -> usize {
        self.uses.load(Ordering::Acquire)
    }

    pub fn is_in_use(&self) -> bool {
        self.use_count() > 0
    }

    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register one more user.
    pub fn acquire(&self) {
        self.uses.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one user; closes the statement when the last user of an
    /// uncached handle leaves. Never goes below zero.
    pub fn release(&self) {
        let prev = self
            .uses
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) && !self.is_cached() {
            self.close();
        }
    }

    /// Queue the server-side deallocation. Only the first call has effect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(statement_id = self.statement_id, "closing prepared statement");
            self.queue.push(self.statement_id);
        }
    }

    fn set_cached(&self, cached: bool) {
        self.cached.store(cached, Ordering::Release);
    }
}

#[derive(Debug)]
struct Entry {
    handle: Arc<PreparedHandle>,
    last_used: u64,
}

/// LRU cache of prepared handles keyed by SQL text.
#[derive(Debug)]
pub struct PrepareCache {
    entries: HashMap<String, Entry>,
    capacity: usize,
    tick: u64,
}

impl PrepareCache {
    /// A capacity of 0 disables caching; `put` then hands the handle back
    /// uncached.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(256)),
            capacity,
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a handle and register the caller as a user.
    pub fn get(&mut self, sql: &str) -> Option<Arc<PreparedHandle>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(sql)?;
        entry.last_used = tick;
        entry.handle.acquire();
        tracing::debug!(statement_id = entry.handle.statement_id, "prepare cache hit");
        Some(Arc::clone(&entry.handle))
    }

    /// Cache a freshly prepared handle and register the caller as a user.
    ///
    /// When the SQL is already cached the new handle is closed and the
    /// existing one is returned instead.
    pub fn put(&mut self, handle: Arc<PreparedHandle>) -> Arc<PreparedHandle> {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&handle.sql) {
            entry.last_used = tick;
            entry.handle.acquire();
            if !Arc::ptr_eq(&entry.handle, &handle) && !handle.is_in_use() {
                handle.close();
            }
            return Arc::clone(&entry.handle);
        }

        handle.acquire();
        if self.capacity == 0 {
            return handle;
        }
        handle.set_cached(true);
        self.entries.insert(
            handle.sql.clone(),
            Entry {
                handle: Arc::clone(&handle),
                last_used: tick,
            },
        );
        if self.entries.len() > self.capacity {
            self.evict_lru();
        }
        handle
    }

    fn evict_lru(&mut self) {
        let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        else {
            return;
        };
        if let Some(entry) = self.entries.remove(&key) {
            Self::uncache(&entry.handle);
            tracing::debug!(statement_id = entry.handle.statement_id, "prepare cache eviction");
        }
    }

    /// Remove one statement, e.g. after the server reported it unknown.
    pub fn invalidate(&mut self, sql: &str) {
        if let Some(entry) = self.entries.remove(sql) {
            Self::uncache(&entry.handle);
        }
    }

    /// Empty the cache, closing every handle not in use.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            Self::uncache(&entry.handle);
        }
    }

    /// Forget every handle without closing it (the server session is gone).
    pub fn abandon(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.set_cached(false);
            entry.handle.closed.store(true, Ordering::Release);
        }
    }

    fn uncache(handle: &PreparedHandle) {
        handle.set_cached(false);
        if !handle.is_in_use() {
            handle.close();
        }
    }
}
