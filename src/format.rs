//! On-disk format definitions: flag bits, the index snapshot and log codecs,
//! and the data record framing.
//!
//! Snapshot files (`qdb.0` / `qdb.1`): 20-byte header, a stream of 24-byte
//! locator records, 4-byte trailer. Index log (`qdb.log`): tagged fixed-size
//! records. Data files (`<seq>.dat`): `key(8) length(4) payload` records.
//! All integers are little-endian.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Exclude the entry from `browse` traversal (persisted).
pub const NO_BROWSE: u32 = 0x0000_0001;
/// Drop the in-memory payload after any read (persisted).
pub const NO_CACHE: u32 = 0x0000_0002;
/// Walk result only: terminate the browse traversal.
pub const BR_ABORT: u32 = 0x0000_0004;
/// Walk result only: clear the `NO_CACHE` bit.
pub const YES_CACHE: u32 = 0x0000_0008;
/// Walk result only: clear the `NO_BROWSE` bit.
pub const YES_BROWSE: u32 = 0x0000_0010;

/// The flag bits that are stored in locators; the rest are request codes.
pub const PERSISTED_FLAGS: u32 = NO_BROWSE | NO_CACHE;

/// Apply a flag-request bitmask to an entry's stored flags.
///
/// For each bit the set-request wins over the clear-request; absence of
/// both leaves the bit unchanged. `BR_ABORT` is not a flag request and is
/// ignored here.
pub fn apply_flag_requests(flags: &mut u32, res: u32) {
    if res & NO_BROWSE != 0 {
        *flags |= NO_BROWSE;
    } else if res & YES_BROWSE != 0 {
        *flags &= !NO_BROWSE;
    }

    if res & NO_CACHE != 0 {
        *flags |= NO_CACHE;
    } else if res & YES_CACHE != 0 {
        *flags &= !NO_CACHE;
    }
}

/// Index snapshot files, alternating.
pub const SNAPSHOT_FILES: [&str; 2] = ["qdb.0", "qdb.1"];
/// The append-only index log.
pub const LOG_FILE: &str = "qdb.log";

/// Snapshot header magic.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"QIDX";
/// Snapshot trailer; its presence proves the file was written to the end.
pub const SNAPSHOT_TRAILER: [u8; 4] = *b"QEND";
/// Snapshot header size: magic(4) + version_seq(4) + max_data_seq(4) + log_pos(8).
pub const SNAPSHOT_HEADER_SIZE: usize = 20;

/// Locator record size: key(8) + data_seq(4) + offset(4) + length(4) + flags(4).
pub const LOCATOR_SIZE: usize = 24;

/// Index log record tags.
pub const LOG_TAG_PUT: u8 = 0x01;
pub const LOG_TAG_DELETE: u8 = 0x02;
/// Log record sizes including the tag byte.
pub const LOG_PUT_SIZE: usize = 1 + LOCATOR_SIZE;
pub const LOG_DELETE_SIZE: usize = 1 + 8;

/// Data record header: key(8) + length(4); the payload follows.
pub const DATA_HEADER_SIZE: usize = 12;

/// Largest payload a locator can address.
pub const MAX_VALUE_SIZE: u64 = u32::MAX as u64;

/// A key's place on disk plus its policy bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub key: u64,
    /// Generation of the data file holding the payload
    pub data_seq: u32,
    /// Byte offset of the record start in that data file
    pub offset: u32,
    /// Payload length in bytes
    pub length: u32,
    pub flags: u32,
}

impl Locator {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.key)?;
        w.write_u32::<LittleEndian>(self.data_seq)?;
        w.write_u32::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(self.length)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            key: r.read_u64::<LittleEndian>()?,
            data_seq: r.read_u32::<LittleEndian>()?,
            offset: r.read_u32::<LittleEndian>()?,
            length: r.read_u32::<LittleEndian>()?,
            flags: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Snapshot file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Increments on every snapshot write; selects the slot and the loader
    /// prefers the higher value
    pub version_seq: u32,
    /// Highest data-file generation ever used
    pub max_data_seq: u32,
    /// Byte position from which index-log replay begins
    pub log_pos: u64,
}

impl SnapshotHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&SNAPSHOT_MAGIC)?;
        w.write_u32::<LittleEndian>(self.version_seq)?;
        w.write_u32::<LittleEndian>(self.max_data_seq)?;
        w.write_u64::<LittleEndian>(self.log_pos)?;
        Ok(())
    }

    /// Reads and validates the magic; a mismatch is reported as
    /// `InvalidData` so the caller can reject the file.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad snapshot magic"));
        }
        Ok(Self {
            version_seq: r.read_u32::<LittleEndian>()?,
            max_data_seq: r.read_u32::<LittleEndian>()?,
            log_pos: r.read_u64::<LittleEndian>()?,
        })
    }
}

/// One index-log mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecord {
    Put(Locator),
    Delete(u64),
}

impl LogRecord {
    /// Append the fixed-size framing to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            LogRecord::Put(loc) => {
                buf.push(LOG_TAG_PUT);
                buf.extend_from_slice(&loc.key.to_le_bytes());
                buf.extend_from_slice(&loc.data_seq.to_le_bytes());
                buf.extend_from_slice(&loc.offset.to_le_bytes());
                buf.extend_from_slice(&loc.length.to_le_bytes());
                buf.extend_from_slice(&loc.flags.to_le_bytes());
            }
            LogRecord::Delete(key) => {
                buf.push(LOG_TAG_DELETE);
                buf.extend_from_slice(&key.to_le_bytes());
            }
        }
    }

    /// Decode one record from the front of `buf`.
    ///
    /// Returns the record and the number of bytes consumed, or `None` on an
    /// empty buffer, a truncated tail, or an unknown tag — replay stops
    /// there and the log is truncated to that position.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let tag = *buf.first()?;
        match tag {
            LOG_TAG_PUT => {
                if buf.len() < LOG_PUT_SIZE {
                    return None;
                }
                let mut r = &buf[1..LOG_PUT_SIZE];
                let loc = Locator::read_from(&mut r).ok()?;
                Some((LogRecord::Put(loc), LOG_PUT_SIZE))
            }
            LOG_TAG_DELETE => {
                if buf.len() < LOG_DELETE_SIZE {
                    return None;
                }
                let mut r = &buf[1..LOG_DELETE_SIZE];
                let key = r.read_u64::<LittleEndian>().ok()?;
                Some((LogRecord::Delete(key), LOG_DELETE_SIZE))
            }
            _ => None,
        }
    }
}
