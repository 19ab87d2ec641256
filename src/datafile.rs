//! Per-generation data files.
//!
//! Each generation `seq` is an append-only file `<seq>.dat` holding records
//! framed as `key(8) length(4) payload`. Files open lazily: read handles are
//! cached per generation, and the generation currently being written keeps a
//! buffered append writer whose position is tracked to avoid stat calls.
//!
//! Records are never rewritten in place. There is no per-record checksum;
//! the locator is trusted and the payload is read back without re-parsing
//! the record header.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use hashbrown::hash_map::Entry;
use hashbrown::{HashMap, HashSet};

use crate::error::{io_error, QdbError, QdbResult};
use crate::format::DATA_HEADER_SIZE;

/// Append state for the generation currently being written.
struct DataWriter {
    seq: u32,
    out: BufWriter<File>,
    pos: u64,
}

/// The family of data files for one store directory.
pub struct DataFiles {
    dir: PathBuf,
    readers: HashMap<u32, File>,
    writer: Option<DataWriter>,
}

impl DataFiles {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            readers: HashMap::new(),
            writer: None,
        }
    }

    fn path(&self, seq: u32) -> PathBuf {
        self.dir.join(format!("{}.dat", seq))
    }

    /// Append a record to generation `seq` and return the offset at which
    /// the record begins.
    ///
    /// The write is buffered; call `flush` (or `sync`) before recording the
    /// returned offset durably.
    pub fn append(&mut self, seq: u32, key: u64, payload: &[u8]) -> QdbResult<u32> {
        let path = self.path(seq);
        let mut w = match self.writer.take() {
            Some(w) if w.seq == seq => w,
            other => {
                if let Some(mut old) = other {
                    let old_path = self.path(old.seq);
                    old.out
                        .flush()
                        .map_err(|e| io_error(&old_path, "data file flush failed", e))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| io_error(&path, "failed to open data file", e))?;
                let pos = file
                    .metadata()
                    .map_err(|e| io_error(&path, "failed to stat data file", e))?
                    .len();
                DataWriter { seq, out: BufWriter::new(file), pos }
            }
        };

        let end = w.pos + DATA_HEADER_SIZE as u64 + payload.len() as u64;
        if end > u32::MAX as u64 {
            self.writer = Some(w);
            return Err(QdbError::Io {
                path: Some(path),
                kind: std::io::ErrorKind::Other,
                message: format!("data file generation {} exceeds 4 GiB", seq),
            });
        }
        let offset = w.pos as u32;

        w.out
            .write_u64::<LittleEndian>(key)
            .and_then(|_| w.out.write_u32::<LittleEndian>(payload.len() as u32))
            .and_then(|_| w.out.write_all(payload))
            .map_err(|e| io_error(&path, "data file write failed", e))?;
        w.pos = end;
        self.writer = Some(w);
        Ok(offset)
    }

    /// Read back the `length`-byte payload of the record starting at
    /// `offset` in generation `seq`. The record header is skipped, not
    /// re-parsed: trust is placed in the locator.
    pub fn read(&mut self, seq: u32, offset: u32, length: u32) -> QdbResult<Vec<u8>> {
        if self.writer.as_ref().map(|w| w.seq) == Some(seq) {
            self.flush()?;
        }

        let path = self.path(seq);
        let file = match self.readers.entry(seq) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let file =
                    File::open(&path).map_err(|e| io_error(&path, "failed to open data file", e))?;
                e.insert(file)
            }
        };

        file.seek(SeekFrom::Start(offset as u64 + DATA_HEADER_SIZE as u64))
            .map_err(|e| io_error(&path, "failed to seek data file", e))?;
        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)
            .map_err(|e| io_error(&path, "failed to read record payload", e))?;
        Ok(payload)
    }

    /// Flush the current writer's buffer to the OS.
    pub fn flush(&mut self) -> QdbResult<()> {
        if let Some(w) = self.writer.as_mut() {
            let path = self.dir.join(format!("{}.dat", w.seq));
            w.out.flush().map_err(|e| io_error(&path, "data file flush failed", e))?;
        }
        Ok(())
    }

    /// Flush and fdatasync the current writer.
    pub fn sync(&mut self) -> QdbResult<()> {
        self.flush()?;
        if let Some(w) = self.writer.as_ref() {
            let path = self.dir.join(format!("{}.dat", w.seq));
            w.out
                .get_ref()
                .sync_data()
                .map_err(|e| io_error(&path, "data file sync failed", e))?;
        }
        Ok(())
    }

    /// Flush and drop the current writer; the next append reopens its
    /// generation (or starts a new one).
    pub fn reset_writer(&mut self) -> QdbResult<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }

    /// Delete every `<seq>.dat` whose generation is not in `used` and drop
    /// its cached handles.
    pub fn remove_unused(&mut self, used: &HashSet<u32>) -> QdbResult<()> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| io_error(&self.dir, "failed to read store directory", e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let seq = match name.to_str().and_then(parse_data_file_name) {
                Some(seq) => seq,
                None => continue,
            };
            if used.contains(&seq) {
                continue;
            }
            self.readers.remove(&seq);
            if self.writer.as_ref().map(|w| w.seq) == Some(seq) {
                self.writer = None;
            }
            let path = entry.path();
            std::fs::remove_file(&path)
                .map_err(|e| io_error(&path, "failed to remove stale data file", e))?;
            log::debug!("removed stale data file {}", path.display());
        }
        Ok(())
    }

    /// Flush the writer and release every handle.
    pub fn close(&mut self) -> QdbResult<()> {
        let res = self.flush();
        self.writer = None;
        self.readers.clear();
        res
    }
}

fn parse_data_file_name(name: &str) -> Option<u32> {
    name.strip_suffix(".dat")?.parse().ok()
}
