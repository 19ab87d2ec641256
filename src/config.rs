//! Configuration for the store.
//!
//! `Config` holds the sync and defrag tunables; `OpenOptions` adds the
//! per-open switches (volatile mode, index loading, the load-walk callback).

use crate::store::Key;

/// Walk callback invoked for every record materialized during `load_data`
/// replay. Returns a flag-request bitmask applied to the new entry.
pub type LoadWalkFn = Box<dyn FnMut(Key, &[u8]) -> u32>;

/// Sync and defrag tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `defrag(false)` compacts only when dead bytes exceed this percentage
    /// of the live bytes
    pub defrag_percent: u32,
    /// Forced compaction at the end of a sync when dead bytes exceed this
    /// percentage of the live bytes
    pub forced_defrag_percent: u32,
    /// Pending-set size that triggers an implicit sync
    pub max_pending: u32,
    /// Pending-set size that triggers an implicit sync in no-sync mode
    pub max_pending_no_sync: u32,
}

impl Config {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.defrag_percent == 0 {
            return Err("defrag_percent must be > 0".into());
        }
        if self.forced_defrag_percent < self.defrag_percent {
            return Err("forced_defrag_percent must be >= defrag_percent".into());
        }
        if self.max_pending == 0 {
            return Err("max_pending must be > 0".into());
        }
        if self.max_pending_no_sync < self.max_pending {
            return Err("max_pending_no_sync must be >= max_pending".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defrag_percent: 50,
            forced_defrag_percent: 300,
            max_pending: 2500,
            max_pending_no_sync: 10000,
        }
    }
}

/// Options for `Store::open_ext`.
pub struct OpenOptions {
    /// Expected record count, used to pre-size the index map
    pub records: usize,
    /// Read the snapshot and replay the log at open; `false` starts empty
    pub load_data: bool,
    /// Keep all mutations in memory until close
    pub volatile: bool,
    /// Sync and defrag tunables
    pub config: Config,
    /// Callback applied to every record materialized during load
    pub walk: Option<LoadWalkFn>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            records: 0,
            load_data: true,
            volatile: false,
            config: Config::default(),
            walk: None,
        }
    }
}
