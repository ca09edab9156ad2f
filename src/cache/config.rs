//! Cache Configuration
//!
//! Read-only settings a [`Cache`](super::Cache) is constructed from.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::element::ExpiryDefaults;
use super::policy::EvictionPolicy;
use super::{
    DEFAULT_EXPIRY_INTERVAL_SECS, DEFAULT_MAX_ELEMENTS_IN_MEMORY, DEFAULT_SPOOL_BUFFER_SIZE,
    DEFAULT_TIME_TO_IDLE_SECS, DEFAULT_TIME_TO_LIVE_SECS, DEFAULT_WRITER_GRACE_MS,
};
use crate::error::{Error, Result};

/// Bound on the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCapacity {
    /// Maximum number of elements
    Entries(usize),
    /// Maximum estimated serialized bytes
    Bytes(u64),
}

impl Default for MemoryCapacity {
    fn default() -> Self {
        MemoryCapacity::Entries(DEFAULT_MAX_ELEMENTS_IN_MEMORY)
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfiguration {
    /// Cache name, also used to name disk files
    pub name: String,
    /// Memory tier bound
    pub memory_capacity: MemoryCapacity,
    /// Maximum elements held on disk (0 = unbounded)
    pub max_elements_on_disk: usize,
    /// Memory tier victim selection
    pub eviction_policy: EvictionPolicy,
    /// Spool memory victims to disk instead of discarding them
    pub overflow_to_disk: bool,
    /// Keep disk contents across restarts
    pub disk_persistent: bool,
    /// Directory for disk files (None = auto-created temporary directory)
    pub disk_store_path: Option<PathBuf>,
    /// Elements without their own lifespan never expire
    pub eternal: bool,
    /// Default time-to-live in seconds (0 = unbounded)
    pub time_to_live_secs: u64,
    /// Default time-to-idle in seconds (0 = unbounded)
    pub time_to_idle_secs: u64,
    /// Spool queue capacity in elements
    pub disk_spool_buffer_size: usize,
    /// Interval between disk expiry sweeps (0 disables the sweep)
    pub disk_expiry_thread_interval_secs: u64,
    /// Empty the memory tier after `flush`
    pub clear_on_flush: bool,
    /// Copy disk hits back into memory
    pub promote_on_disk_hit: bool,
    /// How long dispose waits for the spool writer to stop
    pub writer_shutdown_grace_ms: u64,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            memory_capacity: MemoryCapacity::default(),
            max_elements_on_disk: 0,
            eviction_policy: EvictionPolicy::Lru,
            overflow_to_disk: true,
            disk_persistent: false,
            disk_store_path: None,
            eternal: false,
            time_to_live_secs: DEFAULT_TIME_TO_LIVE_SECS,
            time_to_idle_secs: DEFAULT_TIME_TO_IDLE_SECS,
            disk_spool_buffer_size: DEFAULT_SPOOL_BUFFER_SIZE,
            disk_expiry_thread_interval_secs: DEFAULT_EXPIRY_INTERVAL_SECS,
            clear_on_flush: true,
            promote_on_disk_hit: true,
            writer_shutdown_grace_ms: DEFAULT_WRITER_GRACE_MS,
        }
    }
}

impl CacheConfiguration {
    /// Named configuration bounded to `max_elements` in memory
    pub fn new(name: impl Into<String>, max_elements: usize) -> Self {
        Self {
            name: name.into(),
            memory_capacity: MemoryCapacity::Entries(max_elements),
            ..Default::default()
        }
    }

    /// Whether a disk tier is created for this cache
    pub fn has_disk_store(&self) -> bool {
        self.overflow_to_disk || self.disk_persistent
    }

    pub fn expiry_defaults(&self) -> ExpiryDefaults {
        ExpiryDefaults {
            time_to_live_secs: self.time_to_live_secs,
            time_to_idle_secs: self.time_to_idle_secs,
            eternal: self.eternal,
        }
    }

    /// Reject settings no cache can be built from
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.has_disk_store() && self.disk_spool_buffer_size == 0 {
            return Err(Error::IllegalArgument {
                name: self.name.clone(),
                reason: "disk_spool_buffer_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Cache names end up in file names, so they must be plain path components
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("name must not be empty")
    } else if name.contains(['/', '\\']) || name == "." || name == ".." {
        Some("name must not contain path separators")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::IllegalArgument {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config() {
        let config = CacheConfiguration::default();
        assert!(config.has_disk_store());
        assert!(config.clear_on_flush);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert_matches!(
            CacheConfiguration::new("", 10).validate(),
            Err(Error::IllegalArgument { .. })
        );
        assert_matches!(
            CacheConfiguration::new("a/b", 10).validate(),
            Err(Error::IllegalArgument { .. })
        );
    }

    #[test]
    fn test_zero_spool_rejected_only_with_disk() {
        let mut config = CacheConfiguration::new("c", 10);
        config.disk_spool_buffer_size = 0;
        assert!(config.validate().is_err());
        config.overflow_to_disk = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_with_partial_fields() {
        let config: CacheConfiguration = serde_json::from_str(
            r#"{"name":"sessions","memory_capacity":{"bytes":4096},"eviction_policy":"LFU"}"#,
        )
        .unwrap();
        assert_eq!(config.memory_capacity, MemoryCapacity::Bytes(4096));
        assert_eq!(config.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.time_to_live_secs, DEFAULT_TIME_TO_LIVE_SECS);
    }
}
