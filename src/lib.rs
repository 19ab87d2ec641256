//! qdb — embedded persistent storage for hash-keyed binary blobs.
//!
//! Records are opaque byte sequences up to 4 GiB. Keys are fixed 64-bit
//! identifiers, assumed unique and pre-hashed by the caller.
//!
//! Data lives in a directory chosen at open time. The directory holds up to
//! three kinds of files:
//!
//! - `qdb.0`, `qdb.1` — alternating snapshots of the entire index
//! - `qdb.log` — the changes since the most recent snapshot
//! - `<seq>.dat` — append-only data files, one per generation
//!
//! # Architecture
//!
//! - **Read path**: the index is fully resident; payloads are served from
//!   memory or read through from their data file on demand
//! - **Write path**: mutations land in memory first and are batched to the
//!   index log when the pending set crosses the sync threshold
//! - **Compaction**: live records are rewritten into a fresh generation and
//!   the index snapshot is rewritten, reclaiming dead bytes

pub mod config;
pub mod datafile;
pub mod error;
pub mod format;
pub mod index;
pub mod store;

pub use config::{Config, OpenOptions};
pub use error::{QdbError, QdbResult};
pub use format::{BR_ABORT, NO_BROWSE, NO_CACHE, YES_BROWSE, YES_CACHE};
pub use store::{Key, Store};
