//! The index: the authoritative key → locator mapping, its two alternating
//! snapshot files, and the append-only index log.
//!
//! At open the loader picks the structurally valid snapshot with the higher
//! version, ingests every locator, then replays `qdb.log` forward up to the
//! last complete record. A snapshot rewrite targets the non-current slot and
//! switches over by truncating the log, so a crashed rewrite always leaves
//! the previous snapshot intact.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::datafile::DataFiles;
use crate::error::{io_error, QdbError, QdbResult};
use crate::format::{
    apply_flag_requests, Locator, LogRecord, SnapshotHeader, LOCATOR_SIZE, LOG_FILE, NO_CACHE,
    SNAPSHOT_FILES, SNAPSHOT_HEADER_SIZE, SNAPSHOT_TRAILER,
};

/// One index entry: the locator plus the optionally resident payload.
pub struct Entry {
    /// Materialized payload; `None` when evicted by the cache policy
    pub data: Option<Vec<u8>>,
    /// Generation of the data file holding the payload; 0 means the entry
    /// has never been persisted and `data` is the only copy
    pub data_seq: u32,
    /// Record offset within the data file
    pub offset: u32,
    /// Payload length in bytes
    pub length: u32,
    pub flags: u32,
}

impl Entry {
    pub fn locator(&self, key: u64) -> Locator {
        Locator {
            key,
            data_seq: self.data_seq,
            offset: self.offset,
            length: self.length,
            flags: self.flags,
        }
    }

    /// Whether the cache policy may drop the payload. Entries that have
    /// never reached disk keep theirs regardless of `NO_CACHE`.
    pub fn evictable(&self) -> bool {
        self.flags & NO_CACHE != 0 && self.data_seq != 0
    }
}

/// The in-memory index and its persistence state.
pub struct Index {
    dir: PathBuf,
    map: HashMap<u64, Entry>,
    /// Open handle on `qdb.log`, positioned at the end
    log: Option<File>,
    log_pos: u64,
    /// Increments on every snapshot write; `version_seq & 1` is the slot
    version_seq: u32,
    /// Highest data-file generation ever used
    pub max_data_seq: u32,
    /// Sum of the live locators' lengths
    pub disk_space_needed: u64,
    /// Dead bytes accumulated in data files by updates and deletes
    pub extra_space_used: u64,
}

impl Index {
    pub fn new(dir: &Path, records: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            map: HashMap::with_capacity(records),
            log: None,
            log_pos: 0,
            version_seq: 0,
            max_data_seq: 0,
            disk_space_needed: 0,
            extra_space_used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<&Entry> {
        self.map.get(&key)
    }

    pub fn entry_mut(&mut self, key: u64) -> Option<&mut Entry> {
        self.map.get_mut(&key)
    }

    /// Snapshot of the live keys, in iteration order.
    pub fn keys(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }

    fn install(&mut self, key: u64, entry: Entry) {
        let added = entry.length as u64;
        if let Some(old) = self.map.insert(key, entry) {
            self.extra_space_used += old.length as u64;
            self.disk_space_needed -= old.length as u64;
        }
        self.disk_space_needed += added;
    }

    /// Install a fresh, not-yet-persisted entry.
    pub fn mem_put(&mut self, key: u64, value: Vec<u8>, flags: u32) {
        let length = value.len() as u32;
        self.install(key, Entry { data: Some(value), data_seq: 0, offset: 0, length, flags });
    }

    /// Remove an entry; returns whether the key was present.
    pub fn mem_del(&mut self, key: u64) -> bool {
        match self.map.remove(&key) {
            Some(old) => {
                self.extra_space_used += old.length as u64;
                self.disk_space_needed -= old.length as u64;
                true
            }
            None => false,
        }
    }

    /// Load the index from disk: pick a snapshot, replay the log, then
    /// materialize every surviving payload (feeding `walk` if given).
    pub fn load(
        &mut self,
        data: &mut DataFiles,
        mut walk: Option<&mut dyn FnMut(u64, &[u8]) -> u32>,
    ) -> QdbResult<()> {
        let mut best: Option<(SnapshotHeader, Vec<Locator>)> = None;
        for name in SNAPSHOT_FILES {
            let path = self.dir.join(name);
            match read_snapshot_file(&path) {
                Ok(Some((hdr, locs))) => {
                    let newer = best
                        .as_ref()
                        .map_or(true, |(b, _)| hdr.version_seq > b.version_seq);
                    if newer {
                        best = Some((hdr, locs));
                    }
                }
                Ok(None) => {}
                Err(e @ QdbError::CorruptSnapshot { .. }) => log::warn!("{}", e),
                Err(e) => return Err(e),
            }
        }

        let log_start = match best {
            Some((hdr, locs)) => {
                self.version_seq = hdr.version_seq;
                self.max_data_seq = hdr.max_data_seq;
                for loc in locs {
                    self.install(loc.key, Entry {
                        data: None,
                        data_seq: loc.data_seq,
                        offset: loc.offset,
                        length: loc.length,
                        flags: loc.flags,
                    });
                }
                // ingesting a snapshot accounts no dead bytes
                self.extra_space_used = 0;
                hdr.log_pos
            }
            None => 0,
        };

        self.replay_log(log_start)?;

        for key in self.keys() {
            let entry = match self.map.get_mut(&key) {
                Some(e) => e,
                None => continue,
            };
            if entry.data.is_none() {
                entry.data = Some(data.read(entry.data_seq, entry.offset, entry.length)?);
            }
            if let Some(wf) = walk.as_deref_mut() {
                let res = match entry.data.as_deref() {
                    Some(payload) => wf(key, payload),
                    None => continue,
                };
                apply_flag_requests(&mut entry.flags, res);
            }
            if entry.evictable() {
                entry.data = None;
            }
        }
        Ok(())
    }

    /// Replay `qdb.log` from `start`, truncating any invalid tail.
    fn replay_log(&mut self, start: u64) -> QdbResult<()> {
        let path = self.dir.join(LOG_FILE);
        let buf = match std::fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.log_pos = 0;
                return Ok(());
            }
            Err(e) => return Err(io_error(&path, "failed to read index log", e)),
        };

        let mut pos = (start as usize).min(buf.len());
        while pos < buf.len() {
            match LogRecord::decode(&buf[pos..]) {
                Some((LogRecord::Put(loc), n)) => {
                    self.install(loc.key, Entry {
                        data: None,
                        data_seq: loc.data_seq,
                        offset: loc.offset,
                        length: loc.length,
                        flags: loc.flags,
                    });
                    if loc.data_seq > self.max_data_seq {
                        self.max_data_seq = loc.data_seq;
                    }
                    pos += n;
                }
                Some((LogRecord::Delete(key), n)) => {
                    self.mem_del(key);
                    pos += n;
                }
                None => break,
            }
        }

        if pos < buf.len() {
            log::warn!(
                "index log {} has {} invalid trailing bytes; truncating at {}",
                path.display(),
                buf.len() - pos,
                pos
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| io_error(&path, "failed to open index log for truncation", e))?;
            file.set_len(pos as u64)
                .map_err(|e| io_error(&path, "failed to truncate index log", e))?;
        }
        self.log_pos = pos as u64;
        Ok(())
    }

    /// Append pre-encoded log records and fdatasync the log.
    pub fn append_log(&mut self, buf: &[u8]) -> QdbResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(LOG_FILE);
        if self.log.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| io_error(&path, "failed to open index log", e))?;
            self.log_pos = file
                .metadata()
                .map_err(|e| io_error(&path, "failed to stat index log", e))?
                .len();
            self.log = Some(file);
        }
        if let Some(file) = self.log.as_mut() {
            file.write_all(buf)
                .map_err(|e| io_error(&path, "index log write failed", e))?;
            file.sync_data()
                .map_err(|e| io_error(&path, "index log sync failed", e))?;
            self.log_pos += buf.len() as u64;
        }
        Ok(())
    }

    /// fdatasync the log handle if one is open.
    pub fn sync_log(&self) -> QdbResult<()> {
        if let Some(file) = self.log.as_ref() {
            let path = self.dir.join(LOG_FILE);
            file.sync_data()
                .map_err(|e| io_error(&path, "index log sync failed", e))?;
        }
        Ok(())
    }

    /// Rewrite the full index into the non-current snapshot slot, then
    /// switch over by truncating the log.
    ///
    /// On failure the partial file is abandoned: the version is not bumped
    /// and the log is untouched, so the previous snapshot stays current.
    pub fn write_snapshot(&mut self) -> QdbResult<()> {
        let next_version = self.version_seq.wrapping_add(1);
        let path = self.dir.join(SNAPSHOT_FILES[(next_version & 1) as usize]);

        let file = File::create(&path)
            .map_err(|e| io_error(&path, "failed to create index snapshot", e))?;
        let mut w = BufWriter::new(file);
        let hdr = SnapshotHeader {
            version_seq: next_version,
            max_data_seq: self.max_data_seq,
            log_pos: 0,
        };
        hdr.write_to(&mut w)
            .map_err(|e| io_error(&path, "failed to write snapshot header", e))?;
        for (key, entry) in &self.map {
            entry
                .locator(*key)
                .write_to(&mut w)
                .map_err(|e| io_error(&path, "failed to write snapshot locator", e))?;
        }
        w.write_all(&SNAPSHOT_TRAILER)
            .map_err(|e| io_error(&path, "failed to write snapshot trailer", e))?;
        w.flush()
            .map_err(|e| io_error(&path, "failed to flush index snapshot", e))?;
        w.get_ref()
            .sync_data()
            .map_err(|e| io_error(&path, "failed to sync index snapshot", e))?;
        drop(w);

        self.version_seq = next_version;
        self.truncate_log()?;
        self.disk_space_needed = self.map.values().map(|e| e.length as u64).sum();
        log::debug!(
            "index snapshot {} written: {} entries, data generation {}",
            path.display(),
            self.map.len(),
            self.max_data_seq
        );
        Ok(())
    }

    fn truncate_log(&mut self) -> QdbResult<()> {
        self.log = None;
        let path = self.dir.join(LOG_FILE);
        File::create(&path).map_err(|e| io_error(&path, "failed to truncate index log", e))?;
        self.log_pos = 0;
        Ok(())
    }

    /// The set of data-file generations referenced by live locators.
    pub fn used_generations(&self) -> hashbrown::HashSet<u32> {
        self.map.values().map(|e| e.data_seq).collect()
    }

    /// Release the log handle and discard the index memory.
    pub fn close(&mut self) {
        self.log = None;
        self.map.clear();
    }
}

fn read_snapshot_file(path: &Path) -> QdbResult<Option<(SnapshotHeader, Vec<Locator>)>> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, "failed to read index snapshot", e)),
    };

    let corrupt = |reason: &str| QdbError::CorruptSnapshot {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let min_len = SNAPSHOT_HEADER_SIZE + SNAPSHOT_TRAILER.len();
    if buf.len() < min_len {
        return Err(corrupt("file shorter than header and trailer"));
    }
    if buf[buf.len() - SNAPSHOT_TRAILER.len()..] != SNAPSHOT_TRAILER {
        return Err(corrupt("trailer mismatch"));
    }
    let body_len = buf.len() - min_len;
    if body_len % LOCATOR_SIZE != 0 {
        return Err(corrupt("body length not a multiple of the locator size"));
    }

    let mut r = &buf[..buf.len() - SNAPSHOT_TRAILER.len()];
    let hdr = SnapshotHeader::read_from(&mut r).map_err(|_| corrupt("bad header magic"))?;
    let mut locs = Vec::with_capacity(body_len / LOCATOR_SIZE);
    for _ in 0..body_len / LOCATOR_SIZE {
        let loc = Locator::read_from(&mut r).map_err(|_| corrupt("short locator record"))?;
        locs.push(loc);
    }
    Ok(Some((hdr, locs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::NO_BROWSE;
    use tempfile::TempDir;

    fn put_through_data(idx: &mut Index, data: &mut DataFiles, seq: u32, key: u64, val: &[u8]) {
        let offset = data.append(seq, key, val).unwrap();
        idx.install(key, Entry {
            data: None,
            data_seq: seq,
            offset,
            length: val.len() as u32,
            flags: 0,
        });
        if seq > idx.max_data_seq {
            idx.max_data_seq = seq;
        }
    }

    #[test]
    fn test_accounting_on_put_and_delete() {
        let dir = TempDir::new().unwrap();
        let mut idx = Index::new(dir.path(), 0);

        idx.mem_put(1, b"x".to_vec(), 0);
        idx.mem_put(1, b"yy".to_vec(), 0);
        idx.mem_put(1, b"zzz".to_vec(), 0);
        assert_eq!(idx.extra_space_used, 1 + 2);
        assert_eq!(idx.disk_space_needed, 3);

        idx.mem_del(1);
        assert_eq!(idx.extra_space_used, 1 + 2 + 3);
        assert_eq!(idx.disk_space_needed, 0);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut data = DataFiles::new(dir.path());
        let mut idx = Index::new(dir.path(), 0);

        put_through_data(&mut idx, &mut data, 1, 10, b"alpha");
        put_through_data(&mut idx, &mut data, 1, 20, b"beta");
        data.flush().unwrap();
        idx.write_snapshot().unwrap();

        let mut reloaded = Index::new(dir.path(), 0);
        reloaded.load(&mut data, None).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(10).unwrap().data.as_deref(), Some(&b"alpha"[..]));
        assert_eq!(reloaded.get(20).unwrap().data.as_deref(), Some(&b"beta"[..]));
        assert_eq!(reloaded.max_data_seq, 1);
        assert_eq!(reloaded.disk_space_needed, 9);
    }

    #[test]
    fn test_log_replay_applies_puts_and_deletes() {
        let dir = TempDir::new().unwrap();
        let mut data = DataFiles::new(dir.path());
        let mut idx = Index::new(dir.path(), 0);

        let off_a = data.append(1, 1, b"aa").unwrap();
        let off_b = data.append(1, 2, b"bb").unwrap();
        data.flush().unwrap();

        let mut buf = Vec::new();
        LogRecord::Put(Locator { key: 1, data_seq: 1, offset: off_a, length: 2, flags: 0 })
            .encode(&mut buf);
        LogRecord::Put(Locator { key: 2, data_seq: 1, offset: off_b, length: 2, flags: 0 })
            .encode(&mut buf);
        LogRecord::Delete(1).encode(&mut buf);
        idx.append_log(&buf).unwrap();

        let mut reloaded = Index::new(dir.path(), 0);
        reloaded.load(&mut data, None).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get(1).is_none());
        assert_eq!(reloaded.get(2).unwrap().data.as_deref(), Some(&b"bb"[..]));
    }

    #[test]
    fn test_truncated_log_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut data = DataFiles::new(dir.path());
        let mut idx = Index::new(dir.path(), 0);

        let off = data.append(1, 5, b"keep").unwrap();
        data.flush().unwrap();

        let mut buf = Vec::new();
        LogRecord::Put(Locator { key: 5, data_seq: 1, offset: off, length: 4, flags: 0 })
            .encode(&mut buf);
        idx.append_log(&buf).unwrap();

        // half a record at the tail, as if the process died mid-append
        let log_path = dir.path().join(LOG_FILE);
        let mut raw = std::fs::read(&log_path).unwrap();
        let valid_len = raw.len();
        raw.push(crate::format::LOG_TAG_PUT);
        raw.extend_from_slice(&[0u8; 7]);
        std::fs::write(&log_path, &raw).unwrap();

        let mut reloaded = Index::new(dir.path(), 0);
        reloaded.load(&mut data, None).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(5).unwrap().data.as_deref(), Some(&b"keep"[..]));
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), valid_len as u64);
    }

    #[test]
    fn test_loader_prefers_newer_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut data = DataFiles::new(dir.path());
        let mut idx = Index::new(dir.path(), 0);

        put_through_data(&mut idx, &mut data, 1, 1, b"old");
        data.flush().unwrap();
        idx.write_snapshot().unwrap(); // version 1 -> qdb.1

        put_through_data(&mut idx, &mut data, 1, 2, b"new");
        data.flush().unwrap();
        idx.write_snapshot().unwrap(); // version 2 -> qdb.0

        assert!(dir.path().join("qdb.0").exists());
        assert!(dir.path().join("qdb.1").exists());

        let mut reloaded = Index::new(dir.path(), 0);
        reloaded.load(&mut data, None).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(2).unwrap().data.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_corrupt_snapshot_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qdb.0");

        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            read_snapshot_file(&path),
            Err(QdbError::CorruptSnapshot { .. })
        ));

        // valid-length file with a broken trailer
        let mut idx = Index::new(dir.path(), 0);
        idx.write_snapshot().unwrap();
        let written = dir.path().join(SNAPSHOT_FILES[1]);
        let mut raw = std::fs::read(&written).unwrap();
        let n = raw.len();
        raw[n - 1] ^= 0xFF;
        std::fs::write(&written, &raw).unwrap();
        assert!(matches!(
            read_snapshot_file(&written),
            Err(QdbError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_both_snapshots_invalid_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("qdb.0"), b"garbage").unwrap();
        std::fs::write(dir.path().join("qdb.1"), b"more garbage").unwrap();

        let mut data = DataFiles::new(dir.path());
        let mut idx = Index::new(dir.path(), 0);
        idx.load(&mut data, None).unwrap();
        assert!(idx.is_empty());
    }

    #[test]
    fn test_load_walk_applies_flags() {
        let dir = TempDir::new().unwrap();
        let mut data = DataFiles::new(dir.path());
        let mut idx = Index::new(dir.path(), 0);

        put_through_data(&mut idx, &mut data, 1, 7, b"val");
        data.flush().unwrap();
        idx.write_snapshot().unwrap();

        let mut seen = Vec::new();
        let mut walk = |key: u64, payload: &[u8]| {
            seen.push((key, payload.to_vec()));
            NO_BROWSE
        };
        let mut reloaded = Index::new(dir.path(), 0);
        reloaded.load(&mut data, Some(&mut walk)).unwrap();

        assert_eq!(seen, vec![(7, b"val".to_vec())]);
        assert_eq!(reloaded.get(7).unwrap().flags & NO_BROWSE, NO_BROWSE);
    }
}
