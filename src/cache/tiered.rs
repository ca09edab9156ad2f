//! Cache - tiered memory + disk facade
//!
//! Composes a [`MemoryStore`] and an optional [`DiskStore`] behind one key
//! space.
//!
//! # Design
//!
//! - Puts always land in memory; memory victims spool to disk when overflow
//!   is enabled, otherwise they leave the cache as evictions
//! - Gets check memory, then disk, and copy disk hits back into memory
//! - Expired elements found on any path are removed from both tiers
//! - Lifecycle is `UNINITIALISED -> ALIVE -> SHUTDOWN`; every operation other
//!   than lifecycle and listener management requires `ALIVE`

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use super::clock::{Clock, SystemClock};
use super::config::{validate_name, CacheConfiguration, MemoryCapacity};
use super::disk::{DiskStats, DiskStore, DiskStoreConfig};
use super::element::{Element, ElementKey, ElementValue, ExpiryDefaults, Lookup};
use super::events::{CacheEventListener, Listeners};
use super::memory::{Deferred, MemoryStore, OverflowHandler};
use super::statistics::{CacheStatistics, LatencyTracker, StatisticsSnapshot};
use super::sweeper::Sweeper;
use crate::error::{Error, Result};

/// Cache lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Uninitialised,
    Alive,
    Shutdown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Uninitialised => write!(f, "UNINITIALISED"),
            Status::Alive => write!(f, "ALIVE"),
            Status::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

struct Stores<K: ElementKey, V: ElementValue> {
    name: Arc<str>,
    memory: Arc<MemoryStore<K, V>>,
    disk: Option<Arc<DiskStore<K, V>>>,
}

impl<K: ElementKey, V: ElementValue> Clone for Stores<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            memory: Arc::clone(&self.memory),
            disk: self.disk.clone(),
        }
    }
}

/// Destination of memory victims
struct Spill<K: ElementKey, V: ElementValue> {
    name: Arc<str>,
    disk: Option<Arc<DiskStore<K, V>>>,
    overflow_to_disk: bool,
    defaults: ExpiryDefaults,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStatistics>,
    listeners: Arc<Listeners<K, V>>,
}

impl<K: ElementKey, V: ElementValue> Spill<K, V> {
    fn notify_later(&self, element: Element<K, V>, expired: bool) -> Deferred {
        let listeners = Arc::clone(&self.listeners);
        let name = Arc::clone(&self.name);
        Box::new(move || {
            if expired {
                listeners.expired(&name, &element);
            } else {
                listeners.evicted(&name, &element);
            }
        })
    }
}

impl<K: ElementKey, V: ElementValue> OverflowHandler<K, V> for Spill<K, V> {
    fn on_evict(&self, element: Element<K, V>) -> Option<Deferred> {
        if element.is_expired(&self.defaults, self.clock.now_millis()) {
            if let Some(disk) = &self.disk {
                disk.remove(element.key());
            }
            return Some(self.notify_later(element, true));
        }
        match &self.disk {
            Some(disk) if self.overflow_to_disk => match disk.stage(element) {
                Ok(staged) => {
                    let disk = Arc::clone(disk);
                    Some(Box::new(move || disk.submit(staged)))
                }
                Err(element) => {
                    debug!(cache = %self.name, key = ?element.key(), "disk store closed, victim leaves the cache");
                    self.stats.record_eviction();
                    Some(self.notify_later(element, false))
                }
            },
            _ => {
                self.stats.record_eviction();
                Some(self.notify_later(element, false))
            }
        }
    }
}

/// Tiered cache
pub struct Cache<K: ElementKey, V: ElementValue> {
    name: RwLock<String>,
    config: CacheConfiguration,
    status: RwLock<Status>,
    stores: RwLock<Option<Stores<K, V>>>,
    stats: Arc<CacheStatistics>,
    listeners: Arc<Listeners<K, V>>,
    clock: Arc<dyn Clock>,
    disabled: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<K: ElementKey, V: ElementValue> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &*self.name.read())
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

impl<K: ElementKey, V: ElementValue> Cache<K, V> {
    /// Create an uninitialised cache on the system clock
    pub fn new(config: CacheConfiguration) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfiguration, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: RwLock::new(config.name.clone()),
            config,
            status: RwLock::new(Status::Uninitialised),
            stores: RwLock::new(None),
            stats: Arc::new(CacheStatistics::new()),
            listeners: Arc::new(Listeners::default()),
            clock,
            disabled: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Rename the cache; only allowed before `initialise`
    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if *self.status.read() != Status::Uninitialised {
            return Err(Error::IllegalArgument {
                name: self.name(),
                reason: "cannot rename a cache after it has been initialised".to_string(),
            });
        }
        validate_name(&name)?;
        *self.name.write() = name;
        Ok(())
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn config(&self) -> &CacheConfiguration {
        &self.config
    }

    /// Caches are not cloneable; this always fails
    pub fn try_clone(&self) -> Result<Self> {
        Err(Error::CloneNotSupported { name: self.name() })
    }

    /// Create the stores and start background work
    #[instrument(skip_all, fields(cache = %self.name()))]
    pub fn initialise(&self) -> Result<()> {
        let mut status = self.status.write();
        if *status != Status::Uninitialised {
            return Err(Error::IllegalState {
                name: self.name(),
                status: *status,
            });
        }

        let mut config = self.config.clone();
        config.name = self.name();
        let name: Arc<str> = Arc::from(config.name.as_str());
        let defaults = config.expiry_defaults();

        let disk = if config.has_disk_store() {
            let store = DiskStore::open(DiskStoreConfig::from_cache(&config), Arc::clone(&self.clock))?;
            Some(Arc::new(store))
        } else {
            None
        };

        let spill: Arc<dyn OverflowHandler<K, V>> = Arc::new(Spill {
            name: Arc::clone(&name),
            disk: disk.clone(),
            overflow_to_disk: config.overflow_to_disk,
            defaults,
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            listeners: Arc::clone(&self.listeners),
        });
        let memory = Arc::new(MemoryStore::new(
            config.name.clone(),
            config.memory_capacity,
            config.eviction_policy,
            defaults,
            Some(spill),
        ));

        if let Some(disk) = &disk {
            if config.disk_expiry_thread_interval_secs > 0 {
                let sweeper = self.spawn_sweeper(
                    &name,
                    Arc::clone(disk),
                    Duration::from_secs(config.disk_expiry_thread_interval_secs),
                )?;
                *self.sweeper.lock() = Some(sweeper);
            }
        }

        *self.stores.write() = Some(Stores {
            name,
            memory,
            disk,
        });
        *status = Status::Alive;
        info!(
            capacity = ?config.memory_capacity,
            policy = %config.eviction_policy,
            disk = config.has_disk_store(),
            persistent = config.disk_persistent,
            "cache initialised"
        );
        Ok(())
    }

    fn spawn_sweeper(&self, name: &Arc<str>, disk: Arc<DiskStore<K, V>>, interval: Duration) -> Result<Sweeper> {
        let listeners = Arc::clone(&self.listeners);
        let clock = Arc::clone(&self.clock);
        let cache = Arc::clone(name);
        Sweeper::spawn(name, interval, move || {
            let expired = disk.expire_elements(clock.now_millis());
            for element in &expired {
                listeners.expired(&cache, element);
            }
        })
    }

    fn check_alive(&self) -> Result<Stores<K, V>> {
        let status = *self.status.read();
        if status != Status::Alive {
            return Err(Error::IllegalState {
                name: self.name(),
                status,
            });
        }
        self.stores.read().clone().ok_or_else(|| Error::IllegalState {
            name: self.name(),
            status,
        })
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Store an element, notifying listeners
    pub fn put(&self, element: Element<K, V>) -> Result<()> {
        self.put_internal(element, true)
    }

    /// Store an element without notifications or access-statistics reset
    pub fn put_quiet(&self, element: Element<K, V>) -> Result<()> {
        self.put_internal(element, false)
    }

    fn put_internal(&self, mut element: Element<K, V>, notify: bool) -> Result<()> {
        let stores = self.check_alive()?;
        if self.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        if element.key().is_null() && element.value().is_none() {
            debug!(cache = %stores.name, "ignoring put of null key and null value");
            return Ok(());
        }

        let key = element.key().clone();
        let existed = stores.memory.contains_key(&key)
            || stores.disk.as_ref().is_some_and(|disk| disk.contains_key(&key));
        if notify {
            element.reset_access_statistics();
            if existed {
                element.update_update_statistics(self.now());
            }
        }

        let announced = (notify && self.listeners.len() > 0).then(|| element.clone());
        stores.memory.put(element);
        if let Some(element) = announced {
            if existed {
                self.listeners.updated(&stores.name, &element);
            } else {
                self.listeners.put(&stores.name, &element);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Look up an element, updating statistics
    pub fn get(&self, key: &K) -> Result<Option<Element<K, V>>> {
        self.get_internal(key, false)
    }

    /// Look up an element without updating statistics
    pub fn get_quiet(&self, key: &K) -> Result<Option<Element<K, V>>> {
        self.get_internal(key, true)
    }

    fn get_internal(&self, key: &K, quiet: bool) -> Result<Option<Element<K, V>>> {
        let stores = self.check_alive()?;
        let tracker = LatencyTracker::start();
        let now = self.now();

        let lookup = if quiet {
            stores.memory.get_quiet(key, now)
        } else {
            stores.memory.get(key, now)
        };
        let found = match lookup {
            Lookup::Hit(element) => {
                if !quiet {
                    self.stats.record_memory_hit();
                }
                Some(element)
            }
            Lookup::Expired(element) => {
                if let Some(disk) = &stores.disk {
                    disk.remove(key);
                }
                self.on_expired(&stores, &element, quiet);
                None
            }
            Lookup::Miss => self.get_from_disk(&stores, key, quiet),
        };

        if !quiet {
            self.stats.record_get_time(tracker.elapsed());
        }
        Ok(found)
    }

    fn get_from_disk(&self, stores: &Stores<K, V>, key: &K, quiet: bool) -> Option<Element<K, V>> {
        let Some(disk) = &stores.disk else {
            if !quiet {
                self.stats.record_miss_not_found();
            }
            return None;
        };
        let generation = disk.generation();
        let lookup = if quiet { disk.get_quiet(key) } else { disk.get(key) };
        match lookup {
            Lookup::Hit(element) => {
                if !quiet {
                    self.stats.record_disk_hit();
                }
                // Skipped when a put, eviction or remove raced with the read
                if self.config.promote_on_disk_hit {
                    stores
                        .memory
                        .put_if_absent(element.clone(), || disk.generation() == generation);
                }
                Some(element)
            }
            Lookup::Expired(element) => {
                self.on_expired(stores, &element, quiet);
                None
            }
            Lookup::Miss => {
                if !quiet {
                    self.stats.record_miss_not_found();
                }
                None
            }
        }
    }

    fn on_expired(&self, stores: &Stores<K, V>, element: &Element<K, V>, quiet: bool) {
        if !quiet {
            self.stats.record_miss_expired();
        }
        self.listeners.expired(&stores.name, element);
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove from both tiers; returns whether anything was removed
    pub fn remove(&self, key: &K) -> Result<bool> {
        self.remove_internal(key, true)
    }

    /// Remove from both tiers without notifying listeners
    pub fn remove_quiet(&self, key: &K) -> Result<bool> {
        self.remove_internal(key, false)
    }

    fn remove_internal(&self, key: &K, notify: bool) -> Result<bool> {
        let stores = self.check_alive()?;
        let (from_memory, from_disk) = stores
            .memory
            .remove_with(key, || stores.disk.as_ref().and_then(|disk| disk.remove(key)));
        let removed = from_memory.or(from_disk);
        if let (true, Some(element)) = (notify, &removed) {
            self.listeners.removed(&stores.name, element);
        }
        Ok(removed.is_some())
    }

    /// Empty both tiers
    pub fn remove_all(&self) -> Result<()> {
        let stores = self.check_alive()?;
        stores.memory.remove_all_with(|| match &stores.disk {
            Some(disk) => disk.remove_all(),
            None => Ok(()),
        })?;
        self.listeners.remove_all(&stores.name);
        Ok(())
    }

    // =========================================================================
    // Sizes and keys
    // =========================================================================

    /// Number of distinct live keys across both tiers
    pub fn get_size(&self) -> Result<usize> {
        Ok(self.keys_with_expiry_check()?.len())
    }

    pub fn get_memory_store_size(&self) -> Result<usize> {
        Ok(self.check_alive()?.memory.size())
    }

    pub fn get_disk_store_size(&self) -> Result<usize> {
        Ok(self
            .check_alive()?
            .disk
            .as_ref()
            .map(|disk| disk.size())
            .unwrap_or(0))
    }

    /// Distinct keys across both tiers, memory first
    pub fn keys(&self) -> Result<Vec<K>> {
        let stores = self.check_alive()?;
        let mut keys = stores.memory.keys();
        if let Some(disk) = &stores.disk {
            let seen: HashSet<K> = keys.iter().cloned().collect();
            keys.extend(disk.keys().into_iter().filter(|key| !seen.contains(key)));
        }
        Ok(keys)
    }

    /// Keys of both tiers concatenated; may contain duplicates
    pub fn keys_no_duplicate_check(&self) -> Result<Vec<K>> {
        let stores = self.check_alive()?;
        let mut keys = stores.memory.keys();
        if let Some(disk) = &stores.disk {
            keys.extend(disk.keys());
        }
        Ok(keys)
    }

    /// Distinct keys of elements not expired now
    pub fn keys_with_expiry_check(&self) -> Result<Vec<K>> {
        let stores = self.check_alive()?;
        let now = self.now();
        let mut keys = stores.memory.live_keys(now);
        if let Some(disk) = &stores.disk {
            let seen: HashSet<K> = keys.iter().cloned().collect();
            keys.extend(disk.live_keys(now).into_iter().filter(|key| !seen.contains(key)));
        }
        Ok(keys)
    }

    /// Whether either tier holds the key, expired or not
    pub fn is_key_in_cache(&self, key: &K) -> Result<bool> {
        Ok(self.is_element_in_memory(key)? || self.is_element_on_disk(key)?)
    }

    pub fn is_element_in_memory(&self, key: &K) -> Result<bool> {
        Ok(self.check_alive()?.memory.contains_key(key))
    }

    pub fn is_element_on_disk(&self, key: &K) -> Result<bool> {
        Ok(self
            .check_alive()?
            .disk
            .as_ref()
            .is_some_and(|disk| disk.contains_key(key)))
    }

    /// Whether `element` is expired under this cache's defaults
    pub fn is_expired(&self, element: &Element<K, V>) -> Result<bool> {
        self.check_alive()?;
        Ok(element.is_expired(&self.config.expiry_defaults(), self.now()))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Write every memory element to disk, then flush the disk store
    #[instrument(skip_all, fields(cache = %self.name()))]
    pub fn flush(&self) -> Result<()> {
        let stores = self.check_alive()?;
        let Some(disk) = &stores.disk else {
            return Ok(());
        };
        self.spool_memory(&stores, disk, self.config.clear_on_flush);
        disk.flush()
    }

    /// Copy memory to disk, optionally emptying memory in the same step
    fn spool_memory(&self, stores: &Stores<K, V>, disk: &DiskStore<K, V>, clear: bool) {
        let (staged, expired) = stores
            .memory
            .spool_all(self.now(), clear, |element| disk.stage(element));
        for staged in staged.into_iter().filter_map(|staged| staged.ok()) {
            disk.submit(staged);
        }
        for element in &expired {
            disk.remove(element.key());
            self.listeners.expired(&stores.name, element);
        }
    }

    /// Remove expired elements from both tiers now
    pub fn evict_expired_elements(&self) -> Result<()> {
        let stores = self.check_alive()?;
        let now = self.now();
        for element in stores.memory.evict_expired(now) {
            if let Some(disk) = &stores.disk {
                disk.remove(element.key());
            }
            self.listeners.expired(&stores.name, &element);
        }
        if let Some(disk) = &stores.disk {
            for element in disk.expire_elements(now) {
                self.listeners.expired(&stores.name, &element);
            }
        }
        Ok(())
    }

    /// Change the memory bound live
    pub fn set_memory_capacity(&self, capacity: MemoryCapacity) -> Result<()> {
        let stores = self.check_alive()?;
        let old = stores.memory.capacity();
        stores.memory.memory_capacity_changed(old, capacity);
        Ok(())
    }

    /// Whether the disk spool is currently full
    pub fn is_disk_buffer_full(&self) -> Result<bool> {
        Ok(self
            .check_alive()?
            .disk
            .as_ref()
            .is_some_and(|disk| disk.buffer_full()))
    }

    /// When disabled, puts are silently ignored
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn register_listener(&self, listener: Arc<dyn CacheEventListener<K, V>>) {
        self.listeners.register(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn CacheEventListener<K, V>>) -> bool {
        self.listeners.unregister(listener)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn statistics(&self) -> Result<StatisticsSnapshot> {
        let stores = self.check_alive()?;
        let (disk_size, disk_evictions) = stores
            .disk
            .as_ref()
            .map(|disk| (disk.size(), disk.eviction_count()))
            .unwrap_or((0, 0));
        Ok(self
            .stats
            .snapshot(&stores.name, stores.memory.size(), disk_size, disk_evictions))
    }

    /// Reset counters without touching contents
    pub fn clear_statistics(&self) -> Result<()> {
        let stores = self.check_alive()?;
        self.stats.clear();
        if let Some(disk) = &stores.disk {
            disk.clear_eviction_count();
        }
        Ok(())
    }

    pub fn disk_stats(&self) -> Result<Option<DiskStats>> {
        Ok(self.check_alive()?.disk.as_ref().map(|disk| disk.stats()))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop background work and release the stores; repeated calls are no-ops
    #[instrument(skip_all, fields(cache = %self.name()))]
    pub fn dispose(&self) -> Result<()> {
        {
            let mut status = self.status.write();
            match *status {
                Status::Shutdown => return Ok(()),
                Status::Uninitialised => {
                    *status = Status::Shutdown;
                    return Ok(());
                }
                Status::Alive => *status = Status::Shutdown,
            }
        }

        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        let mut result = Ok(());
        if let Some(stores) = self.stores.write().take() {
            if let Some(disk) = &stores.disk {
                if disk.is_persistent() {
                    self.spool_memory(&stores, disk, true);
                }
                result = disk.dispose();
            }
            stores.memory.remove_all();
        }
        self.listeners.dispose();
        info!("cache disposed");
        result
    }
}

impl<K: ElementKey, V: ElementValue> Drop for Cache<K, V> {
    fn drop(&mut self) {
        if self.status() == Status::Alive {
            if let Err(e) = self.dispose() {
                error!(cache = %self.name(), error = %e, "failed to dispose cache on drop");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
