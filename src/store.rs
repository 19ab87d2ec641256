//! The store façade: the single exclusive lock, the pending set, the
//! sync/defrag policy, the browse driver, and the open/close lifecycle.
//!
//! Every public operation takes the lock on entry and releases it on exit;
//! sync and compaction run synchronously under the lock, so the next caller
//! always observes them fully completed. The lock is reentrant, which is
//! what makes `get_no_lock` (and mutation) usable from inside a browse
//! callback.

use std::cell::RefCell;
use std::path::Path;

use hashbrown::HashSet;
use parking_lot::ReentrantMutex;

use crate::config::{Config, OpenOptions};
use crate::datafile::DataFiles;
use crate::error::{io_error, QdbError, QdbResult};
use crate::format::{
    apply_flag_requests, LogRecord, BR_ABORT, LOG_PUT_SIZE, MAX_VALUE_SIZE, NO_BROWSE,
    PERSISTED_FLAGS,
};
use crate::index::Index;

/// Record keys are unique 64-bit values, most likely hashes of the actual
/// key.
pub type Key = u64;

struct StoreInner {
    idx: Index,
    data: DataFiles,
    /// Generation the next sync/defrag writes to
    data_seq: u32,
    /// Keys whose latest change has not yet reached the index log
    pending: HashSet<Key>,
    no_sync: bool,
    volatile: bool,
    config: Config,
    closed: bool,
}

/// A single-writer persistent store bound to one directory.
///
/// All methods take `&self`; an exclusive reentrant lock serializes every
/// operation internally.
pub struct Store {
    inner: ReentrantMutex<RefCell<StoreInner>>,
}

impl Store {
    /// Open or create a store in `dir`.
    ///
    /// With `load_data` the index snapshot is read and the index log
    /// replayed; otherwise the store starts empty.
    pub fn open<P: AsRef<Path>>(dir: P, load_data: bool) -> QdbResult<Self> {
        Self::open_ext(dir, OpenOptions { load_data, ..OpenOptions::default() })
    }

    /// Open or create a store with explicit options.
    pub fn open_ext<P: AsRef<Path>>(dir: P, mut opts: OpenOptions) -> QdbResult<Self> {
        opts.config.validate().map_err(QdbError::Config)?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| io_error(dir, "failed to create store directory", e))?;

        let mut data = DataFiles::new(dir);
        let mut idx = Index::new(dir, opts.records);
        if opts.load_data {
            let walk = opts
                .walk
                .as_mut()
                .map(|w| w.as_mut() as &mut dyn FnMut(Key, &[u8]) -> u32);
            idx.load(&mut data, walk)?;
        }
        let data_seq = idx.max_data_seq + 1;

        Ok(Self {
            inner: ReentrantMutex::new(RefCell::new(StoreInner {
                idx,
                data,
                data_seq,
                pending: HashSet::with_capacity(opts.config.max_pending as usize),
                no_sync: false,
                volatile: opts.volatile,
                config: opts.config,
                closed: false,
            })),
        })
    }

    /// Number of records in the store.
    pub fn count(&self) -> usize {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.idx.len()
    }

    /// Fetch the value for `key`, or `None` if absent.
    ///
    /// The returned bytes are an owned copy. If the entry carries
    /// `NO_CACHE` its in-memory payload is dropped after the read.
    pub fn get(&self, key: Key) -> QdbResult<Option<Vec<u8>>> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        inner.get_value(key)
    }

    /// `get` for use inside a browse callback, where the current thread
    /// already holds the store lock.
    pub fn get_no_lock(&self, key: Key) -> QdbResult<Option<Vec<u8>>> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        inner.get_value(key)
    }

    /// Add or update the record under `key`.
    pub fn put(&self, key: Key, value: &[u8]) -> QdbResult<()> {
        self.put_ext(key, value, 0)
    }

    /// Add or update the record under `key` with initial flags. Only the
    /// persisted bits (`NO_BROWSE`, `NO_CACHE`) are stored.
    pub fn put_ext(&self, key: Key, value: &[u8], flags: u32) -> QdbResult<()> {
        if value.len() as u64 > MAX_VALUE_SIZE {
            return Err(QdbError::OversizedValue { size: value.len() as u64, max: MAX_VALUE_SIZE });
        }
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        inner.idx.mem_put(key, value.to_vec(), flags & PERSISTED_FLAGS);
        inner.after_mutation(key)
    }

    /// Remove the record under `key`.
    pub fn delete(&self, key: Key) -> QdbResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        inner.idx.mem_del(key);
        inner.after_mutation(key)
    }

    /// Apply a flag-request bitmask to the entry under `key`, if present.
    pub fn apply_flags(&self, key: Key, flags: u32) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return;
        }
        if let Some(entry) = inner.idx.entry_mut(key) {
            apply_flag_requests(&mut entry.flags, flags);
        }
    }

    /// Visit every record whose `NO_BROWSE` flag is clear.
    ///
    /// The walk result bitmask may set or clear the entry's flags and may
    /// carry `BR_ABORT` to stop the traversal. Iteration order is
    /// unspecified; every live key is visited at most once.
    pub fn browse<F: FnMut(Key, &[u8]) -> u32>(&self, walk: F) -> QdbResult<()> {
        self.browse_impl(false, walk)
    }

    /// Like `browse`, but also visits `NO_BROWSE` records.
    pub fn browse_all<F: FnMut(Key, &[u8]) -> u32>(&self, walk: F) -> QdbResult<()> {
        self.browse_impl(true, walk)
    }

    fn browse_impl<F: FnMut(Key, &[u8]) -> u32>(
        &self,
        include_hidden: bool,
        mut walk: F,
    ) -> QdbResult<()> {
        let guard = self.inner.lock();
        let keys = {
            let inner = guard.borrow();
            if inner.closed {
                return Err(QdbError::Closed);
            }
            inner.idx.keys()
        };

        for key in keys {
            // The payload is moved out of the entry for the callback so the
            // borrow on the store is released; callbacks may call the
            // no-lock operations.
            let payload = {
                let mut inner_ref = guard.borrow_mut();
                let inner = &mut *inner_ref;
                let entry = match inner.idx.entry_mut(key) {
                    Some(e) => e,
                    None => continue,
                };
                if !include_hidden && entry.flags & NO_BROWSE != 0 {
                    continue;
                }
                if entry.data.is_none() {
                    entry.data =
                        Some(inner.data.read(entry.data_seq, entry.offset, entry.length)?);
                }
                match entry.data.take() {
                    Some(p) => p,
                    None => continue,
                }
            };

            let res = walk(key, &payload);

            {
                let mut inner = guard.borrow_mut();
                if let Some(entry) = inner.idx.entry_mut(key) {
                    apply_flag_requests(&mut entry.flags, res);
                    if entry.data.is_none() && !entry.evictable() {
                        entry.data = Some(payload);
                    }
                }
            }

            if res & BR_ABORT != 0 {
                break;
            }
        }
        Ok(())
    }

    /// Compact the store: rewrite all live records into a fresh data-file
    /// generation and rewrite the index snapshot.
    ///
    /// Without `force` compaction only runs when the dead bytes exceed the
    /// configured percentage of the live bytes. Returns whether compaction
    /// was performed. A no-op in volatile mode.
    pub fn defrag(&self, force: bool) -> QdbResult<bool> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        if inner.volatile {
            return Ok(false);
        }
        let doing = force
            || inner.idx.extra_space_used
                > inner.config.defrag_percent as u64 * inner.idx.disk_space_needed / 100;
        if doing {
            inner.defrag_locked()?;
        }
        Ok(doing)
    }

    /// Stop writing changes to disk until the pending set grows past the
    /// no-sync threshold. A no-op in volatile mode.
    pub fn no_sync(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed || inner.volatile {
            return;
        }
        inner.no_sync = true;
    }

    /// Write all pending changes to disk now and re-enable syncing.
    pub fn sync(&self) -> QdbResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        if inner.volatile {
            return Ok(());
        }
        inner.no_sync = false;
        inner.sync_locked()
    }

    /// Force kernel durability of the currently open index-log and
    /// current-generation data handles.
    ///
    /// Data files of generations other than the one currently being
    /// written are not flushed.
    pub fn flush(&self) -> QdbResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closed {
            return Err(QdbError::Closed);
        }
        if inner.volatile {
            return Ok(());
        }
        inner.data.sync()?;
        inner.idx.sync_log()
    }

    /// Dead bytes accumulated in data files by updates and deletes.
    pub fn extra_space_used(&self) -> u64 {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.idx.extra_space_used
    }

    /// Sum of the live records' lengths.
    pub fn disk_space_needed(&self) -> u64 {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.idx.disk_space_needed
    }

    /// Close the store: flush pending changes (in volatile mode, write the
    /// single compacted snapshot), then release every handle and discard
    /// the index.
    ///
    /// All handles are released even when the flush fails; the first error
    /// is reported. Further operations return `QdbError::Closed`. Dropping
    /// an unclosed store performs the same shutdown best-effort.
    pub fn close(&self) -> QdbResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.shutdown()
    }
}

impl StoreInner {
    fn get_value(&mut self, key: Key) -> QdbResult<Option<Vec<u8>>> {
        let entry = match self.idx.entry_mut(key) {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.data.is_none() {
            entry.data = Some(self.data.read(entry.data_seq, entry.offset, entry.length)?);
        }
        let value = entry.data.clone();
        if entry.evictable() {
            entry.data = None;
        }
        Ok(value)
    }

    /// Record the mutation in the pending set and run the sync policy.
    fn after_mutation(&mut self, key: Key) -> QdbResult<()> {
        if self.volatile {
            self.no_sync = true;
            return Ok(());
        }
        self.pending.insert(key);
        if self.sync_needed() {
            self.sync_locked()?;
        }
        Ok(())
    }

    fn sync_needed(&self) -> bool {
        if self.volatile {
            return false;
        }
        if self.pending.len() > self.config.max_pending_no_sync as usize {
            return true;
        }
        !self.no_sync && self.pending.len() > self.config.max_pending as usize
    }

    /// Flush the pending set: rewrite each live pending record to the
    /// current generation, append put/delete records to the index log, and
    /// clear the set. On failure the pending set is preserved so the sync
    /// can be retried.
    fn sync_locked(&mut self) -> QdbResult<()> {
        if self.volatile || self.pending.is_empty() {
            return Ok(());
        }

        let keys: Vec<Key> = self.pending.iter().copied().collect();
        let mut logbuf = Vec::with_capacity(keys.len() * LOG_PUT_SIZE);
        for key in keys {
            match self.idx.entry_mut(key) {
                Some(entry) => {
                    if entry.data.is_none() {
                        entry.data =
                            Some(self.data.read(entry.data_seq, entry.offset, entry.length)?);
                    }
                    let payload = entry.data.as_deref().unwrap_or_default();
                    let offset = self.data.append(self.data_seq, key, payload)?;
                    entry.data_seq = self.data_seq;
                    entry.offset = offset;
                    LogRecord::Put(entry.locator(key)).encode(&mut logbuf);
                    if entry.evictable() {
                        entry.data = None;
                    }
                }
                None => LogRecord::Delete(key).encode(&mut logbuf),
            }
        }
        if self.data_seq > self.idx.max_data_seq {
            self.idx.max_data_seq = self.data_seq;
        }

        self.data.flush()?;
        self.idx.append_log(&logbuf)?;
        self.pending.clear();

        let forced =
            self.config.forced_defrag_percent as u64 * self.idx.disk_space_needed / 100;
        if self.idx.extra_space_used > forced {
            log::debug!(
                "forced defrag: {} dead bytes against {} live",
                self.idx.extra_space_used,
                self.idx.disk_space_needed
            );
            self.defrag_locked()?;
        }
        Ok(())
    }

    /// Rewrite every live record into a fresh generation, rewrite the index
    /// snapshot, and delete unreferenced data files.
    fn defrag_locked(&mut self) -> QdbResult<()> {
        self.data_seq += 1;
        if self.data_seq > self.idx.max_data_seq {
            self.idx.max_data_seq = self.data_seq;
        }
        self.data.reset_writer()?;

        for key in self.idx.keys() {
            let entry = match self.idx.entry_mut(key) {
                Some(e) => e,
                None => continue,
            };
            if entry.data.is_none() {
                entry.data = Some(self.data.read(entry.data_seq, entry.offset, entry.length)?);
            }
            let payload = entry.data.as_deref().unwrap_or_default();
            let offset = self.data.append(self.data_seq, key, payload)?;
            entry.data_seq = self.data_seq;
            entry.offset = offset;
            if entry.evictable() {
                entry.data = None;
            }
        }

        self.data.sync()?;
        self.idx.write_snapshot()?;
        let used = self.idx.used_generations();
        self.data.remove_unused(&used)?;
        self.idx.extra_space_used = 0;
        log::debug!(
            "defrag complete: generation {}, {} live records",
            self.data_seq,
            self.idx.len()
        );
        Ok(())
    }

    fn shutdown(&mut self) -> QdbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let res = if self.volatile {
            if self.no_sync {
                self.defrag_locked()
            } else {
                Ok(())
            }
        } else {
            self.sync_locked()
        };
        self.idx.close();
        let close_res = self.data.close();
        res.and(close_res)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
