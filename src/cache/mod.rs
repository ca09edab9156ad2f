//! Tiered Cache
//!
//! A bounded memory store backed by an optional disk store, with per-element
//! expiry and pluggable memory eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Cache                                    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  MemoryStore (RAM)              │  DiskStore (data file + index)      │
//! │  ┌──────────────────────────┐   │  ┌───────────────────────────────┐  │
//! │  │ HashMap + ranking        │   │  │ pending map ──▶ spool channel │  │
//! │  │ LRU / LFU / FIFO victims │──▶│  │ writer thread ──▶ data blocks │  │
//! │  └──────────────────────────┘   │  │ free list, expiry sweeper     │  │
//! │              ▲                  │  └───────────────────────────────┘  │
//! │              └──────── promotion on disk hit ───────┘                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Puts never wait for disk I/O unless the spool is full
//! - Every element is in at most one place from a caller's point of view
//! - Expiry is evaluated lazily on access and eagerly by the sweeper

pub mod clock;
pub mod config;
pub mod disk;
pub mod element;
pub mod events;
pub mod memory;
pub mod policy;
pub mod statistics;
mod sweeper;
mod tiered;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfiguration, MemoryCapacity};
pub use disk::{DiskState, DiskStats, DiskStore, DiskStoreConfig, Staged};
pub use element::{Element, ElementKey, ElementValue, ExpiryDefaults, Lookup, NEVER_EXPIRE};
pub use events::CacheEventListener;
pub use memory::{Deferred, MemoryStore, OverflowHandler};
pub use policy::EvictionPolicy;
pub use statistics::{CacheStatistics, StatisticsSnapshot};
pub use tiered::{Cache, Status};

/// Default memory bound in elements
pub const DEFAULT_MAX_ELEMENTS_IN_MEMORY: usize = 10_000;

/// Default time-to-live (2 minutes)
pub const DEFAULT_TIME_TO_LIVE_SECS: u64 = 120;

/// Default time-to-idle (2 minutes)
pub const DEFAULT_TIME_TO_IDLE_SECS: u64 = 120;

/// Default spool capacity in elements
pub const DEFAULT_SPOOL_BUFFER_SIZE: usize = 1_000;

/// Default interval between disk expiry sweeps
pub const DEFAULT_EXPIRY_INTERVAL_SECS: u64 = 120;

/// Default time dispose waits for the spool writer
pub const DEFAULT_WRITER_GRACE_MS: u64 = 2_000;

pub const DATA_FILE_EXTENSION: &str = ".data";
pub const INDEX_FILE_EXTENSION: &str = ".index";

/// Prefix of directories created when no disk path is configured
pub const AUTO_DIR_PREFIX: &str = "tiercache_auto_created_";

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lifespans() {
        assert_eq!(DEFAULT_TIME_TO_LIVE_SECS, 120);
        assert_eq!(DEFAULT_TIME_TO_IDLE_SECS, 120);
    }

    #[test]
    fn test_file_extensions_differ() {
        assert_ne!(DATA_FILE_EXTENSION, INDEX_FILE_EXTENSION);
        assert!(DATA_FILE_EXTENSION.starts_with('.'));
    }
}
