//! tiercache - Tiered Object Cache
//!
//! An in-process object cache with a bounded memory tier, an overflow disk
//! tier written by a background spool thread, and per-element expiry.
//!
//! # Architecture
//!
//! ```text
//! CacheManager → Cache → MemoryStore ──overflow──▶ DiskStore
//!                  ▲                                   │
//!                  └────────── promotion ◀─────────────┘
//! ```
//!
//! # Features
//!
//! - LRU, LFU and FIFO memory eviction
//! - Time-to-live and time-to-idle expiry, per element or per cache
//! - Asynchronous disk writes with a bounded spool and blocking backpressure
//! - Persistent disk stores with a checksummed index and dirty-shutdown recovery
//! - Event listeners, hit/miss statistics and disk diagnostics
//!
//! # Modules
//!
//! - [`cache`] - Elements, stores and the tiered `Cache`
//! - [`error`] - Error types
//! - [`manager`] - Named cache ownership and lifecycle

pub mod cache;
pub mod error;
pub mod manager;

// Re-export commonly used types
pub use cache::{
    Cache, CacheConfiguration, CacheEventListener, Element, ElementKey, ElementValue,
    EvictionPolicy, MemoryCapacity, Status,
};
pub use error::{Error, Result};
pub use manager::CacheManager;
