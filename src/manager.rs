//! Cache Manager
//!
//! Owns a set of named caches and their lifecycle.
//!
//! # Design
//!
//! - Caches are initialised when added and disposed when removed or when the
//!   manager shuts down
//! - A manager-level disk path is applied to caches that do not set their own
//! - Manager names are unique per process while the manager is alive; the
//!   name is released by `shutdown` (or drop)

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::cache::{Cache, CacheConfiguration, ElementKey, ElementValue, Status};
use crate::error::{Error, Result};

/// Names of managers that have not yet shut down
static LIVE_MANAGERS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Owner of named caches
pub struct CacheManager<K: ElementKey, V: ElementValue> {
    name: String,
    default_disk_path: Option<PathBuf>,
    caches: DashMap<String, Arc<Cache<K, V>>>,
    alive: AtomicBool,
}

impl<K: ElementKey, V: ElementValue> std::fmt::Debug for CacheManager<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("name", &self.name)
            .field("default_disk_path", &self.default_disk_path)
            .finish_non_exhaustive()
    }
}

impl<K: ElementKey, V: ElementValue> CacheManager<K, V> {
    /// Register a manager under `name`
    pub fn new(name: impl Into<String>, default_disk_path: Option<PathBuf>) -> Result<Self> {
        let name = name.into();
        if !LIVE_MANAGERS.lock().insert(name.clone()) {
            return Err(Error::IllegalArgument {
                name,
                reason: "a cache manager with this name is already running".to_string(),
            });
        }
        info!(manager = %name, disk_path = ?default_disk_path, "cache manager started");
        Ok(Self {
            name,
            default_disk_path,
            caches: DashMap::new(),
            alive: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        if self.alive.load(Ordering::Acquire) {
            Status::Alive
        } else {
            Status::Shutdown
        }
    }

    fn check_alive(&self) -> Result<()> {
        match self.status() {
            Status::Alive => Ok(()),
            status => Err(Error::IllegalState {
                name: self.name.clone(),
                status,
            }),
        }
    }

    /// Create, initialise and register a cache
    pub fn add_cache(&self, mut config: CacheConfiguration) -> Result<Arc<Cache<K, V>>> {
        self.check_alive()?;
        if config.disk_store_path.is_none() {
            config.disk_store_path = self.default_disk_path.clone();
        }
        let name = config.name.clone();

        let entry = match self.caches.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::IllegalArgument {
                    name,
                    reason: format!("cache already exists in manager {}", self.name),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let cache = Cache::new(config)?;
        cache.initialise()?;
        let cache = Arc::new(cache);
        entry.insert(Arc::clone(&cache));
        info!(manager = %self.name, cache = %name, "cache added");
        Ok(cache)
    }

    /// Add a cache with default settings
    pub fn add_cache_named(&self, name: &str) -> Result<Arc<Cache<K, V>>> {
        self.add_cache(CacheConfiguration {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn cache(&self, name: &str) -> Option<Arc<Cache<K, V>>> {
        self.caches.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn cache_exists(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Dispose and drop a cache; returns whether it existed
    pub fn remove_cache(&self, name: &str) -> Result<bool> {
        self.check_alive()?;
        match self.caches.remove(name) {
            Some((_, cache)) => {
                cache.dispose()?;
                info!(manager = %self.name, cache = %name, "cache removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispose every cache and release the manager name
    ///
    /// Every cache is disposed even if one fails; the first error is returned.
    pub fn shutdown(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let names: Vec<String> = self.caches.iter().map(|entry| entry.key().clone()).collect();
        let mut first_error = None;
        for name in names {
            if let Some((_, cache)) = self.caches.remove(&name) {
                if let Err(e) = cache.dispose() {
                    warn!(manager = %self.name, cache = %name, error = %e, "cache failed to dispose");
                    first_error.get_or_insert(e);
                }
            }
        }
        LIVE_MANAGERS.lock().remove(&self.name);
        info!(manager = %self.name, "cache manager shut down");
        first_error.map_or(Ok(()), Err)
    }
}

impl<K: ElementKey, V: ElementValue> Drop for CacheManager<K, V> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(manager = %self.name, error = %e, "cache manager shutdown failed on drop");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
