//! Spool writer thread
//!
//! Drains the spool channel in FIFO order. A message names a key and the
//! sequence number of the put that queued it; the writer only persists the
//! pending element if that exact put is still current, so superseded and
//! removed elements are skipped.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, warn};

use super::Shared;
use crate::cache::element::{ElementKey, ElementValue};

/// Message on the spool channel
pub(super) enum SpoolMessage<K> {
    /// Persist the pending element for `key` queued with `seq`
    Write { key: K, seq: u64 },
    /// Acknowledge once every earlier message has been handled
    Flush(Sender<()>),
}

/// Writer loop; returns when every sender is gone
///
/// `done` is dropped on return, which is what `dispose` waits on.
pub(super) fn run_writer<K: ElementKey, V: ElementValue>(
    shared: Arc<Shared<K, V>>,
    rx: Receiver<SpoolMessage<K>>,
    done: Sender<()>,
) {
    debug!(cache = %shared.name, "disk writer started");
    for message in rx.iter() {
        match message {
            SpoolMessage::Write { key, seq } => shared.write_spooled(key, seq),
            SpoolMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(cache = %shared.name, "disk writer stopped");
    drop(done);
}

impl<K: ElementKey, V: ElementValue> Shared<K, V> {
    fn is_current(&self, key: &K, seq: u64) -> bool {
        self.pending.lock().get(key).map(|p| p.seq) == Some(seq)
    }

    /// Drop a pending element if it is still the one queued with `seq`
    pub(super) fn discard_pending(&self, key: &K, seq: u64) {
        let mut pending = self.pending.lock();
        if pending.get(key).map(|p| p.seq) == Some(seq) {
            pending.remove(key);
        }
    }

    fn write_spooled(&self, key: K, seq: u64) {
        let element = {
            let pending = self.pending.lock();
            match pending.get(&key) {
                Some(p) if p.seq == seq => Arc::clone(&p.element),
                _ => return,
            }
        };

        let bytes = match bincode::serialize(&*element) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(cache = %self.name, ?key, error = %e, "element failed to serialize, dropped from spool");
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                self.discard_pending(&key, seq);
                return;
            }
        };
        let expiry_time = element.expiration_time(&self.defaults);

        let mut file = self.file.lock();
        // A remove needs the file lock, so the element cannot vanish past this check
        if !self.is_current(&key, seq) {
            return;
        }
        if self.max_elements > 0
            && !file.index.contains_key(&key)
            && file.index.len() >= self.max_elements
        {
            if let Some(victim) = file.evict_one() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(cache = %self.name, ?victim, "disk store full, evicted least-hit element");
            }
        }
        if let Err(e) = file.write_block(
            key.clone(),
            &bytes,
            expiry_time,
            element.hit_count(),
            element.last_access_time(),
        ) {
            error!(cache = %self.name, ?key, error = %e, "failed to write element to data file");
            self.write_failures.fetch_add(1, Ordering::Relaxed);
        }

        // Reads may have touched the pending copy while it was being written
        let mut pending = self.pending.lock();
        if let Some(current) = pending.get(&key).filter(|p| p.seq == seq) {
            if let Some(slot) = file.index.get_mut(&key) {
                slot.hit_count = current.element.hit_count();
                slot.last_access = current.element.last_access_time();
                slot.expiry_time = current.element.expiration_time(&self.defaults);
            }
            pending.remove(&key);
        }
    }
}
