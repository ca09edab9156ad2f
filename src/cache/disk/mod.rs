//! Disk Store - overflow and persistent tier
//!
//! Elements reach disk asynchronously: [`DiskStore::put`] parks the element in
//! a pending map and queues its key on a bounded spool channel drained by a
//! single writer thread.
//!
//! # Design
//!
//! - Bounded spool: `put` blocks while the channel is full
//! - Pending elements stay readable until written, so a caller always sees
//!   its own writes
//! - One data file with stable offsets; freed blocks are reused best-fit and
//!   the file never shrinks except on `remove_all`
//! - The index snapshot is written on flush/dispose and deleted as soon as
//!   the store changes again, so a dirty shutdown can never load stale offsets
//! - Any unusable index on open resets the store to empty

mod index;
mod spool;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use index::{DiskSlot, FreeList, IndexSnapshot, INDEX_MAGIC, INDEX_VERSION};

use self::index::{read_index, write_index};
use self::spool::SpoolMessage;
use super::clock::Clock;
use super::config::{validate_name, CacheConfiguration};
use super::element::{Element, ElementKey, ElementValue, ExpiryDefaults, Lookup, NEVER_EXPIRE};
use super::policy::{AccessOrder, EvictionPolicy};
use super::{AUTO_DIR_PREFIX, DATA_FILE_EXTENSION, INDEX_FILE_EXTENSION};
use crate::error::{Error, Result};

/// Data files currently held open by a live store in this process
static OPEN_DATA_FILES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Disk store configuration
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    /// Store name, used for file names
    pub name: String,
    /// Directory for the files (None = auto-created)
    pub directory: Option<PathBuf>,
    /// Keep files and index across restarts
    pub persistent: bool,
    /// Spool channel capacity in elements
    pub spool_buffer_size: usize,
    /// Maximum indexed elements (0 = unbounded)
    pub max_elements: usize,
    /// Lifespan defaults for expiry checks
    pub defaults: ExpiryDefaults,
    /// Time dispose waits for the writer thread
    pub writer_grace: Duration,
}

impl DiskStoreConfig {
    pub fn from_cache(config: &CacheConfiguration) -> Self {
        Self {
            name: config.name.clone(),
            directory: config.disk_store_path.clone(),
            persistent: config.disk_persistent,
            spool_buffer_size: config.disk_spool_buffer_size.max(1),
            max_elements: config.max_elements_on_disk,
            defaults: config.expiry_defaults(),
            writer_grace: Duration::from_millis(config.writer_shutdown_grace_ms),
        }
    }
}

/// Lifecycle state of a disk store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskState {
    Stopped,
    Running,
    Disposing,
}

/// Point-in-time disk diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub name: String,
    pub state: DiskState,
    pub entries: usize,
    pub pending: usize,
    pub data_file_path: PathBuf,
    pub data_file_size: u64,
    pub used_data_size: u64,
    pub free_blocks: usize,
    pub sparseness: f64,
    pub index_file_size: u64,
    pub spool_thread_alive: bool,
    pub evictions: u64,
    pub write_failures: u64,
}

struct Pending<K, V> {
    seq: u64,
    element: Arc<Element<K, V>>,
}

/// Data file plus its in-memory index
struct DiskFile<K> {
    data: File,
    index_path: PathBuf,
    index: HashMap<K, DiskSlot>,
    free: FreeList,
    data_len: u64,
    used: u64,
    next_write: u64,
    index_on_disk: bool,
}

impl<K: ElementKey> DiskFile<K> {
    fn empty(data: File, index_path: PathBuf) -> Self {
        Self {
            data,
            index_path,
            index: HashMap::new(),
            free: FreeList::new(),
            data_len: 0,
            used: 0,
            next_write: 0,
            index_on_disk: false,
        }
    }

    fn from_snapshot(data: File, index_path: PathBuf, snapshot: IndexSnapshot<K>) -> Self {
        let used = snapshot.entries.iter().map(|(_, slot)| slot.block_size).sum();
        Self {
            data,
            index_path,
            index: snapshot.entries.into_iter().collect(),
            free: FreeList::from_blocks(snapshot.free),
            data_len: snapshot.data_len,
            used,
            next_write: snapshot.next_write,
            index_on_disk: false,
        }
    }

    fn snapshot(&self) -> IndexSnapshot<K> {
        IndexSnapshot {
            data_len: self.data_len,
            next_write: self.next_write,
            entries: self
                .index
                .iter()
                .map(|(key, slot)| (key.clone(), *slot))
                .collect(),
            free: self.free.to_vec(),
        }
    }

    /// Any change invalidates a previously written index file
    fn mark_dirty(&mut self) {
        if self.index_on_disk {
            if let Err(e) = remove_if_exists(&self.index_path) {
                warn!(path = %self.index_path.display(), error = %e, "failed to invalidate index file");
            }
            self.index_on_disk = false;
        }
    }

    fn read_block(&mut self, slot: &DiskSlot) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; slot.payload_len as usize];
        self.data.seek(SeekFrom::Start(slot.offset))?;
        self.data.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn allocate(&mut self, len: u64) -> (u64, u64) {
        match self.free.take(len) {
            Some(block) => block,
            None => {
                let offset = self.data_len;
                self.data_len += len;
                (offset, len)
            }
        }
    }

    fn write_block(&mut self, key: K, bytes: &[u8], expiry_time: u64, hit_count: u64, last_access: u64) -> io::Result<()> {
        self.mark_dirty();
        let len = bytes.len() as u64;
        let (offset, block_size) = match self.index.remove(&key) {
            Some(previous) if previous.block_size >= len => {
                self.used = self.used.saturating_sub(previous.block_size);
                (previous.offset, previous.block_size)
            }
            Some(previous) => {
                self.release(previous);
                self.allocate(len)
            }
            None => self.allocate(len),
        };
        let written = self
            .data
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.data.write_all(bytes));
        if let Err(e) = written {
            self.free.release(offset, block_size);
            return Err(e);
        }
        self.next_write += 1;
        self.used += block_size;
        self.index.insert(
            key,
            DiskSlot {
                offset,
                block_size,
                payload_len: len,
                expiry_time,
                hit_count,
                last_access,
                written: self.next_write,
            },
        );
        Ok(())
    }

    fn release(&mut self, slot: DiskSlot) {
        self.used = self.used.saturating_sub(slot.block_size);
        self.free.release(slot.offset, slot.block_size);
    }

    fn remove_entry(&mut self, key: &K) -> Option<DiskSlot> {
        let slot = self.index.remove(key)?;
        self.mark_dirty();
        self.release(slot);
        Some(slot)
    }

    /// Read an entry and release its block
    fn take<V: ElementValue>(&mut self, key: &K) -> Option<Element<K, V>> {
        let slot = *self.index.get(key)?;
        let element = self.decode::<V>(&slot);
        self.remove_entry(key);
        element
    }

    fn decode<V: ElementValue>(&mut self, slot: &DiskSlot) -> Option<Element<K, V>> {
        let bytes = self.read_block(slot).ok()?;
        let mut element: Element<K, V> = bincode::deserialize(&bytes).ok()?;
        element.restore_access(slot.hit_count, slot.last_access);
        Some(element)
    }

    fn clear(&mut self) -> io::Result<()> {
        self.mark_dirty();
        self.index.clear();
        self.free.clear();
        self.data_len = 0;
        self.used = 0;
        self.data.set_len(0)
    }

    /// Drop the least-hit entry to make room
    fn evict_one(&mut self) -> Option<K> {
        let orders: Vec<(&K, AccessOrder)> = self
            .index
            .iter()
            .map(|(key, slot)| {
                (
                    key,
                    AccessOrder {
                        inserted: slot.written,
                        accessed: slot.last_access,
                        hits: slot.hit_count,
                    },
                )
            })
            .collect();
        let victim = EvictionPolicy::Lfu
            .select_victim(orders.iter().map(|(key, order)| (*key, order)))
            .cloned()?;
        self.remove_entry(&victim);
        Some(victim)
    }
}

/// State shared between callers and the writer thread
struct Shared<K: ElementKey, V: ElementValue> {
    name: String,
    defaults: ExpiryDefaults,
    max_elements: usize,
    pending: Mutex<HashMap<K, Pending<K, V>>>,
    file: Mutex<DiskFile<K>>,
    evictions: AtomicU64,
    write_failures: AtomicU64,
    /// Bumped after every staged write and every removal
    generation: AtomicU64,
}

impl<K: ElementKey, V: ElementValue> Shared<K, V> {
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn lookup(&self, key: &K, now: u64, touch: bool) -> Lookup<K, V> {
        let mut pending = self.pending.lock();
        if let Some(p) = pending.get_mut(key) {
            if p.element.is_expired(&self.defaults, now) {
                let element = Element::clone(&p.element);
                drop(pending);
                self.remove(key);
                return Lookup::Expired(element);
            }
            let mut element = Element::clone(&p.element);
            if touch {
                // The writer copies these statistics into the slot once written
                element.update_access_statistics(now);
                p.element = Arc::new(element.clone());
            }
            return Lookup::Hit(element);
        }
        drop(pending);

        let mut file = self.file.lock();
        let Some(slot) = file.index.get(key).copied() else {
            return Lookup::Miss;
        };
        let Some(mut element) = file.decode::<V>(&slot) else {
            debug!(cache = %self.name, ?key, "unreadable disk record treated as miss");
            file.remove_entry(key);
            return Lookup::Miss;
        };
        if element.is_expired(&self.defaults, now) {
            file.remove_entry(key);
            return Lookup::Expired(element);
        }
        if touch {
            element.update_access_statistics(now);
            let expiry_time = element.expiration_time(&self.defaults);
            if let Some(slot) = file.index.get_mut(key) {
                slot.hit_count = element.hit_count();
                slot.last_access = now;
                slot.expiry_time = expiry_time;
            }
        }
        Lookup::Hit(element)
    }

    fn remove(&self, key: &K) -> Option<Element<K, V>> {
        let mut file = self.file.lock();
        let from_file = file.take::<V>(key);
        let from_pending = self
            .pending
            .lock()
            .remove(key)
            .map(|p| Arc::try_unwrap(p.element).unwrap_or_else(|shared| Element::clone(&shared)));
        self.bump_generation();
        from_pending.or(from_file)
    }

    fn remove_all(&self) -> io::Result<()> {
        let mut file = self.file.lock();
        self.pending.lock().clear();
        self.bump_generation();
        file.clear()
    }

    fn expire(&self, now: u64) -> Vec<Element<K, V>> {
        let mut file = self.file.lock();
        let keys: Vec<K> = file
            .index
            .iter()
            .filter(|(_, slot)| slot.expiry_time != NEVER_EXPIRE && now >= slot.expiry_time)
            .map(|(key, _)| key.clone())
            .collect();
        let mut expired: Vec<Element<K, V>> = keys.iter().filter_map(|key| file.take::<V>(key)).collect();

        let mut pending = self.pending.lock();
        let stale: Vec<K> = pending
            .iter()
            .filter(|(_, p)| p.element.is_expired(&self.defaults, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(p) = pending.remove(&key) {
                expired.push(Element::clone(&p.element));
            }
        }
        if !expired.is_empty() {
            self.bump_generation();
        }
        expired
    }

    fn keys(&self) -> Vec<K> {
        let file = self.file.lock();
        let pending = self.pending.lock();
        let mut keys: Vec<K> = file.index.keys().cloned().collect();
        keys.extend(pending.keys().filter(|k| !file.index.contains_key(*k)).cloned());
        keys
    }

    fn live_keys(&self, now: u64) -> Vec<K> {
        let file = self.file.lock();
        let pending = self.pending.lock();
        let mut keys: Vec<K> = pending
            .iter()
            .filter(|(_, p)| !p.element.is_expired(&self.defaults, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(
            file.index
                .iter()
                .filter(|(key, slot)| {
                    !pending.contains_key(*key)
                        && (slot.expiry_time == NEVER_EXPIRE || now < slot.expiry_time)
                })
                .map(|(key, _)| key.clone()),
        );
        keys
    }

    fn size(&self) -> usize {
        let file = self.file.lock();
        let pending = self.pending.lock();
        file.index.len() + pending.keys().filter(|k| !file.index.contains_key(*k)).count()
    }

    fn contains_key(&self, key: &K) -> bool {
        if self.pending.lock().contains_key(key) {
            return true;
        }
        self.file.lock().index.contains_key(key)
    }
}

/// Element staged in the pending map and awaiting a spool slot
#[derive(Debug)]
pub struct Staged<K> {
    key: K,
    seq: u64,
}

struct WriterHandle {
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

/// Disk tier with a spooled writer thread
pub struct DiskStore<K: ElementKey, V: ElementValue> {
    name: String,
    shared: Arc<Shared<K, V>>,
    clock: Arc<dyn Clock>,
    state: Mutex<DiskState>,
    sender: Mutex<Option<Sender<SpoolMessage<K>>>>,
    writer: Mutex<Option<WriterHandle>>,
    seq: AtomicU64,
    persistent: bool,
    auto_created: bool,
    directory: PathBuf,
    data_path: PathBuf,
    index_path: PathBuf,
    writer_grace: Duration,
}

impl<K: ElementKey, V: ElementValue> DiskStore<K, V> {
    /// Open the store files and start the writer thread
    #[instrument(skip_all, fields(cache = %config.name))]
    pub fn open(config: DiskStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_name(&config.name)?;
        let (directory, auto_created, data_path) = claim_data_file(&config)?;
        if auto_created && config.persistent {
            warn!(
                directory = %directory.display(),
                "persistent store in an auto-created directory will not be reloadable"
            );
        }
        let index_path = directory.join(format!("{}{}", config.name, INDEX_FILE_EXTENSION));

        let file = match open_files::<K>(&config, &data_path, &index_path) {
            Ok(file) => file,
            Err(e) => {
                OPEN_DATA_FILES.lock().remove(&data_path);
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            defaults: config.defaults,
            max_elements: config.max_elements,
            pending: Mutex::new(HashMap::new()),
            file: Mutex::new(file),
            evictions: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        });

        let (tx, rx) = channel::bounded(config.spool_buffer_size.max(1));
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let writer_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("{}-disk-writer", config.name))
            .spawn(move || spool::run_writer(writer_shared, rx, done_tx));
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                OPEN_DATA_FILES.lock().remove(&data_path);
                return Err(Error::io("spawning disk writer thread", e));
            }
        };

        info!(
            data_file = %data_path.display(),
            persistent = config.persistent,
            entries = shared.size(),
            "disk store opened"
        );

        Ok(Self {
            name: config.name,
            shared,
            clock,
            state: Mutex::new(DiskState::Running),
            sender: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(WriterHandle {
                thread,
                done: done_rx,
            })),
            seq: AtomicU64::new(0),
            persistent: config.persistent,
            auto_created,
            directory,
            data_path,
            index_path,
            writer_grace: config.writer_grace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DiskState {
        *self.state.lock()
    }

    fn is_running(&self) -> bool {
        self.state() == DiskState::Running
    }

    /// Queue an element for writing, blocking while the spool is full
    pub fn put(&self, element: Element<K, V>) {
        if let Ok(staged) = self.stage(element) {
            self.submit(staged);
        }
    }

    /// Make an element readable from the pending map without queueing it
    ///
    /// Never blocks. The element is written once the ticket is passed to
    /// [`submit`](Self::submit). A store that is not running hands the
    /// element back.
    pub fn stage(&self, element: Element<K, V>) -> std::result::Result<Staged<K>, Element<K, V>> {
        if !self.is_running() {
            debug!(cache = %self.name, key = ?element.key(), "put ignored, disk store not running");
            return Err(element);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = element.key().clone();
        let mut pending = self.shared.pending.lock();
        pending.insert(
            key.clone(),
            Pending {
                seq,
                element: Arc::new(element),
            },
        );
        // Bumped while the insert is still locked so a reader that sees the
        // new generation also sees the element
        self.shared.bump_generation();
        Ok(Staged { key, seq })
    }

    /// Counter that changes whenever an element is staged or removed
    ///
    /// A caller that reads the generation, then an element, and finds the
    /// generation unchanged knows no newer write or removal of any key
    /// happened in between.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Queue a staged element, blocking while the spool is full
    pub fn submit(&self, staged: Staged<K>) {
        let Staged { key, seq } = staged;
        let Some(tx) = self.sender.lock().clone() else {
            self.shared.discard_pending(&key, seq);
            return;
        };
        if let Err(e) = tx.send(SpoolMessage::Write {
            key: key.clone(),
            seq,
        }) {
            warn!(cache = %self.name, error = %e, "disk writer gone, element dropped");
            self.shared.discard_pending(&key, seq);
        }
    }

    /// Expiry-checked read that records the access
    pub fn get(&self, key: &K) -> Lookup<K, V> {
        if !self.is_running() {
            return Lookup::Miss;
        }
        self.shared.lookup(key, self.clock.now_millis(), true)
    }

    /// Expiry-checked read without statistics
    pub fn get_quiet(&self, key: &K) -> Lookup<K, V> {
        if !self.is_running() {
            return Lookup::Miss;
        }
        self.shared.lookup(key, self.clock.now_millis(), false)
    }

    /// Remove an element, returning its block to the free list
    pub fn remove(&self, key: &K) -> Option<Element<K, V>> {
        self.shared.remove(key)
    }

    /// Empty the store and truncate the data file
    pub fn remove_all(&self) -> Result<()> {
        self.shared
            .remove_all()
            .map_err(|e| Error::io(format!("truncating {}", self.data_path.display()), e))?;
        if self.persistent && self.is_running() {
            self.write_index()?;
        }
        Ok(())
    }

    /// Remove every element expired at `now`
    pub fn expire_elements(&self, now: u64) -> Vec<Element<K, V>> {
        let expired = self.shared.expire(now);
        if !expired.is_empty() {
            debug!(cache = %self.name, count = expired.len(), "expired disk elements");
        }
        expired
    }

    /// Whether the spool channel is at capacity
    pub fn buffer_full(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| tx.is_full())
            .unwrap_or(false)
    }

    /// Wait until everything queued so far has been written
    fn drain(&self) {
        let Some(tx) = self.sender.lock().clone() else {
            return;
        };
        let (ack_tx, ack_rx) = channel::bounded(1);
        if tx.send(SpoolMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Drain the spool and, when persistent, write the index
    #[instrument(skip_all, fields(cache = %self.name))]
    pub fn flush(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.drain();
        if self.persistent {
            self.write_index()?;
        }
        Ok(())
    }

    fn write_index(&self) -> Result<()> {
        let mut file = self.shared.file.lock();
        file.data
            .sync_data()
            .map_err(|e| Error::io(format!("syncing {}", self.data_path.display()), e))?;
        write_index(&self.index_path, &file.snapshot())?;
        file.index_on_disk = true;
        debug!(cache = %self.name, entries = file.index.len(), "disk index written");
        Ok(())
    }

    /// Stop the writer and release the files
    #[instrument(skip_all, fields(cache = %self.name))]
    pub fn dispose(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != DiskState::Running {
                return Ok(());
            }
            *state = DiskState::Disposing;
        }

        if self.persistent {
            self.drain();
        } else {
            self.shared.pending.lock().clear();
        }
        drop(self.sender.lock().take());

        if let Some(writer) = self.writer.lock().take() {
            match writer.done.recv_timeout(self.writer_grace) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        grace_ms = self.writer_grace.as_millis() as u64,
                        "disk writer did not stop within grace period"
                    );
                }
                _ => {
                    if writer.thread.join().is_err() {
                        error!("disk writer thread panicked");
                    }
                }
            }
        }

        let result = if self.persistent {
            self.write_index()
        } else {
            self.delete_files();
            Ok(())
        };
        OPEN_DATA_FILES.lock().remove(&self.data_path);
        *self.state.lock() = DiskState::Stopped;
        info!("disk store disposed");
        result
    }

    fn delete_files(&self) {
        for path in [&self.data_path, &self.index_path] {
            if let Err(e) = remove_if_exists(path) {
                warn!(path = %path.display(), error = %e, "failed to delete disk store file");
            }
        }
        if self.auto_created {
            if let Err(e) = fs::remove_dir(&self.directory) {
                debug!(directory = %self.directory.display(), error = %e, "auto-created directory left in place");
            }
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size()
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.keys()
    }

    pub fn live_keys(&self, now: u64) -> Vec<K> {
        self.shared.live_keys(now)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.contains_key(key)
    }

    /// Elements waiting in the spool
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn eviction_count(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }

    pub fn clear_eviction_count(&self) {
        self.shared.evictions.store(0, Ordering::Relaxed);
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn data_file_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_file_path(&self) -> &Path {
        &self.index_path
    }

    pub fn data_file_size(&self) -> u64 {
        self.shared.file.lock().data_len
    }

    /// Bytes held by live blocks
    pub fn used_data_size(&self) -> u64 {
        self.shared.file.lock().used
    }

    /// Fraction of the data file not holding live blocks
    pub fn data_file_sparseness(&self) -> f64 {
        let file = self.shared.file.lock();
        if file.data_len == 0 {
            0.0
        } else {
            1.0 - file.used as f64 / file.data_len as f64
        }
    }

    pub fn index_file_size(&self) -> u64 {
        fs::metadata(&self.index_path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_spool_thread_alive(&self) -> bool {
        self.writer
            .lock()
            .as_ref()
            .map(|writer| !writer.thread.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> DiskStats {
        let (entries, data_file_size, used_data_size, free_blocks) = {
            let file = self.shared.file.lock();
            (file.index.len(), file.data_len, file.used, file.free.len())
        };
        DiskStats {
            name: self.name.clone(),
            state: self.state(),
            entries,
            pending: self.pending_count(),
            data_file_path: self.data_path.clone(),
            data_file_size,
            used_data_size,
            free_blocks,
            sparseness: self.data_file_sparseness(),
            index_file_size: self.index_file_size(),
            spool_thread_alive: self.is_spool_thread_alive(),
            evictions: self.eviction_count(),
            write_failures: self.shared.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl<K: ElementKey, V: ElementValue> Drop for DiskStore<K, V> {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.dispose() {
                error!(cache = %self.name, error = %e, "failed to dispose disk store on drop");
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn auto_directory() -> PathBuf {
    std::env::temp_dir().join(format!("{}{}", AUTO_DIR_PREFIX, Uuid::new_v4().simple()))
}

/// Pick a directory whose data file no live store holds, and register it
fn claim_data_file(config: &DiskStoreConfig) -> Result<(PathBuf, bool, PathBuf)> {
    let file_name = format!("{}{}", config.name, DATA_FILE_EXTENSION);
    let (mut directory, mut auto_created) = match &config.directory {
        Some(dir) => (dir.clone(), false),
        None => (auto_directory(), true),
    };
    fs::create_dir_all(&directory)
        .map_err(|e| Error::io(format!("creating {}", directory.display()), e))?;

    let mut data_path = directory.join(&file_name);
    let mut open = OPEN_DATA_FILES.lock();
    if open.contains(&data_path) {
        let fallback = auto_directory();
        warn!(
            data_file = %data_path.display(),
            fallback = %fallback.display(),
            "data file already in use, using auto-created directory"
        );
        fs::create_dir_all(&fallback)
            .map_err(|e| Error::io(format!("creating {}", fallback.display()), e))?;
        directory = fallback;
        auto_created = true;
        data_path = directory.join(&file_name);
    }
    open.insert(data_path.clone());
    Ok((directory, auto_created, data_path))
}

/// Load a trusted index or start from empty files
fn open_files<K: ElementKey>(config: &DiskStoreConfig, data_path: &Path, index_path: &Path) -> Result<DiskFile<K>> {
    let open_data = |truncate: bool| {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(data_path)
            .map_err(|e| Error::io(format!("opening {}", data_path.display()), e))
    };

    if config.persistent && index_path.exists() {
        let loaded = read_index::<K>(index_path).and_then(|snapshot| {
            let data_len = fs::metadata(data_path).map(|m| m.len()).unwrap_or(0);
            snapshot.validate(data_len)?;
            Ok(snapshot)
        });
        match loaded {
            Ok(snapshot) => {
                let data = open_data(false)?;
                remove_if_exists(index_path)
                    .map_err(|e| Error::io(format!("removing {}", index_path.display()), e))?;
                info!(entries = snapshot.entries.len(), "disk index loaded");
                return Ok(DiskFile::from_snapshot(data, index_path.to_path_buf(), snapshot));
            }
            Err(e) => {
                warn!(error = %e, "discarding unusable disk index, starting empty");
            }
        }
    } else if config.persistent && fs::metadata(data_path).map(|m| m.len() > 0).unwrap_or(false) {
        warn!("data file without index, starting empty");
    }

    remove_if_exists(index_path).map_err(|e| Error::io(format!("removing {}", index_path.display()), e))?;
    let data = open_data(true)?;
    Ok(DiskFile::empty(data, index_path.to_path_buf()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    const T0: u64 = 1_000_000;

    fn make_config(dir: &Path, name: &str, persistent: bool) -> DiskStoreConfig {
        DiskStoreConfig {
            name: name.to_string(),
            directory: Some(dir.to_path_buf()),
            persistent,
            spool_buffer_size: 16,
            max_elements: 0,
            defaults: ExpiryDefaults::default(),
            writer_grace: Duration::from_secs(2),
        }
    }

    fn make_element(key: &str) -> Element<String, String> {
        Element::created_at(key.to_string(), format!("value-{key}"), T0)
    }

    fn open(config: DiskStoreConfig) -> (DiskStore<String, String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = DiskStore::open(config, clock.clone() as Arc<dyn Clock>).unwrap();
        (store, clock)
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[test]
    fn test_put_then_get_before_and_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "rw", false));
        store.put(make_element("a"));
        assert!(store.get(&key("a")).is_hit());
        store.flush().unwrap();
        assert_eq!(store.pending_count(), 0);
        let e = store.get(&key("a")).into_option().unwrap();
        assert_eq!(e.value(), Some(&"value-a".to_string()));
        assert_eq!(store.size(), 1);
        store.dispose().unwrap();
    }

    #[test]
    fn test_staged_element_visible_before_submit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "staged", false));
        let staged = store.stage(make_element("a")).unwrap();
        assert!(store.contains_key(&key("a")));
        assert!(store.get(&key("a")).is_hit());
        store.submit(staged);
        store.flush().unwrap();
        assert_eq!(store.pending_count(), 0);
        assert!(store.get(&key("a")).is_hit());
    }

    #[test]
    fn test_stage_after_dispose_hands_element_back() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "late", false));
        store.dispose().unwrap();
        let returned = store.stage(make_element("a")).unwrap_err();
        assert_eq!(returned.key(), "a");
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_generation_tracks_writes_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "generation", false));
        let start = store.generation();
        store.put(make_element("a"));
        let after_put = store.generation();
        assert!(after_put > start);

        store.flush().unwrap();
        assert!(store.get(&key("a")).is_hit());
        assert_eq!(store.generation(), after_put);

        store.remove(&key("a"));
        assert!(store.generation() > after_put);
    }

    #[test]
    fn test_access_to_pending_element_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = open(make_config(dir.path(), "touch", false));
        let staged = store.stage(make_element("a")).unwrap();
        clock.advance_secs(3);
        assert!(store.get(&key("a")).is_hit());
        store.submit(staged);
        store.flush().unwrap();
        assert_eq!(store.pending_count(), 0);

        let e = store.get_quiet(&key("a")).into_option().unwrap();
        assert_eq!(e.hit_count(), 1);
        assert_eq!(e.last_access_time(), T0 + 3_000);
    }

    #[test]
    fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "lww", false));
        for i in 0..5 {
            store.put(Element::created_at(key("k"), format!("v{i}"), T0));
        }
        store.flush().unwrap();
        let e = store.get(&key("k")).into_option().unwrap();
        assert_eq!(e.value(), Some(&"v4".to_string()));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_remove_frees_block_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "reuse", false));
        store.put(make_element("a"));
        store.put(make_element("b"));
        store.flush().unwrap();
        let len = store.data_file_size();
        assert!(store.remove(&key("a")).is_some());
        assert!(store.data_file_sparseness() > 0.0);
        store.put(make_element("c"));
        store.flush().unwrap();
        assert_eq!(store.data_file_size(), len);
        assert!(store.get(&key("a")).into_option().is_none());
        assert!(store.get(&key("c")).is_hit());
    }

    #[test]
    fn test_remove_pending_element_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "rmpending", false));
        store.put(make_element("a"));
        store.remove(&key("a"));
        store.flush().unwrap();
        assert!(!store.contains_key(&key("a")));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_remove_all_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "clear", false));
        for i in 0..10 {
            store.put(make_element(&i.to_string()));
        }
        store.flush().unwrap();
        assert!(store.data_file_size() > 0);
        store.remove_all().unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.data_file_size(), 0);
        store.put(make_element("after"));
        store.flush().unwrap();
        assert!(store.get(&key("after")).is_hit());
    }

    #[test]
    fn test_expire_elements() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config(dir.path(), "expiry", false);
        config.defaults.time_to_live_secs = 10;
        let (store, clock) = open(config);
        store.put(make_element("old"));
        store.put(make_element("eternal").with_eternal(true));
        store.flush().unwrap();
        clock.advance_secs(10);
        let expired = store.expire_elements(clock.now_millis());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key(), "old");
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_get_expired_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config(dir.path(), "lazy", false);
        config.defaults.time_to_idle_secs = 5;
        let (store, clock) = open(config);
        store.put(make_element("a"));
        store.flush().unwrap();
        clock.advance_secs(4);
        assert!(store.get(&key("a")).is_hit());
        clock.advance_secs(4);
        assert!(store.get_quiet(&key("a")).is_hit());
        clock.advance_secs(1);
        assert!(matches!(store.get(&key("a")), Lookup::Expired(_)));
        assert!(!store.contains_key(&key("a")));
    }

    #[test]
    fn test_max_elements_evicts_least_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config(dir.path(), "bounded", false);
        config.max_elements = 2;
        let (store, _) = open(config);
        store.put(make_element("a"));
        store.put(make_element("b"));
        store.flush().unwrap();
        store.get(&key("a"));
        store.put(make_element("c"));
        store.flush().unwrap();
        assert_eq!(store.size(), 2);
        assert!(store.contains_key(&key("a")));
        assert!(!store.contains_key(&key("b")));
        assert_eq!(store.eviction_count(), 1);
        store.clear_eviction_count();
        assert_eq!(store.eviction_count(), 0);
        assert_eq!(store.stats().evictions, 0);
    }

    #[test]
    fn test_persistent_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = open(make_config(dir.path(), "persist", true));
            store.put(make_element("a"));
            store.put(make_element("b"));
            store.dispose().unwrap();
            assert!(dir.path().join("persist.index").exists());
        }
        let (store, _) = open(make_config(dir.path(), "persist", true));
        assert_eq!(store.size(), 2);
        assert!(!dir.path().join("persist.index").exists());
        let e = store.get(&key("b")).into_option().unwrap();
        assert_eq!(e.value(), Some(&"value-b".to_string()));
    }

    #[test]
    fn test_dirty_shutdown_discards_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = open(make_config(dir.path(), "dirty", true));
            store.put(make_element("a"));
            store.flush().unwrap();
            store.put(make_element("b"));
            store.flush().unwrap();
            store.remove(&key("a"));
            assert!(!dir.path().join("dirty.index").exists());
            std::mem::forget(store);
        }
        OPEN_DATA_FILES.lock().remove(&dir.path().join("dirty.data"));
        let (store, _) = open(make_config(dir.path(), "dirty", true));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_non_persistent_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "temp", false));
        store.put(make_element("a"));
        store.flush().unwrap();
        let data = store.data_file_path().to_path_buf();
        assert!(data.exists());
        store.dispose().unwrap();
        assert!(!data.exists());
        assert_eq!(store.state(), DiskState::Stopped);
        assert!(store.get(&key("a")).into_option().is_none());
    }

    #[test]
    fn test_same_path_falls_back_to_auto_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = open(make_config(dir.path(), "shared", false));
        let (second, _) = open(make_config(dir.path(), "shared", false));
        assert_ne!(first.data_file_path(), second.data_file_path());
        assert!(second
            .data_file_path()
            .to_string_lossy()
            .contains(AUTO_DIR_PREFIX));
        second.dispose().unwrap();
        first.dispose().unwrap();
    }

    #[test]
    fn test_stats_and_writer_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(make_config(dir.path(), "stats", false));
        assert!(store.is_spool_thread_alive());
        assert!(!store.buffer_full());
        store.put(make_element("a"));
        store.flush().unwrap();
        let stats = store.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.state, DiskState::Running);
        assert!(stats.data_file_size > 0);
        store.dispose().unwrap();
        assert!(!store.is_spool_thread_alive());
    }
}
