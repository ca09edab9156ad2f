//! Memory Store - bounded in-process tier
//!
//! # Design
//!
//! - One mutex guards the whole store; every operation, reads included,
//!   takes it because reads update access ordering
//! - Victims are ranked by the configured [`EvictionPolicy`] in a `BTreeMap`
//!   so selection is `O(log n)`
//! - Victims are handed to the [`OverflowHandler`] under the lock, so an
//!   element is always visible in one tier or the other; handler work that
//!   may block (a full disk spool) runs after the lock is released
//! - Promotions from disk go through `put_if_absent`, so they never replace
//!   an element written after the disk read

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::config::MemoryCapacity;
use super::element::{Element, ElementKey, ElementValue, ExpiryDefaults, Lookup};
use super::policy::{AccessOrder, EvictionPolicy, Rank};

/// Follow-up work returned by an [`OverflowHandler`]
pub type Deferred = Box<dyn FnOnce() + Send>;

/// Receiver of elements evicted from the memory tier
pub trait OverflowHandler<K, V>: Send + Sync {
    /// Take ownership of a victim.
    ///
    /// Runs with the store lock held and must not block. The returned
    /// continuation runs after the lock is released.
    fn on_evict(&self, element: Element<K, V>) -> Option<Deferred>;
}

struct Slot<K, V> {
    element: Element<K, V>,
    order: AccessOrder,
    bytes: u64,
}

struct MemoryInner<K, V> {
    map: HashMap<K, Slot<K, V>>,
    ranking: BTreeMap<(Rank, u64), K>,
    capacity: MemoryCapacity,
    used_bytes: u64,
    tick: u64,
}

impl<K: ElementKey, V: ElementValue> MemoryInner<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, policy: EvictionPolicy, element: Element<K, V>, bytes: u64) {
        let tick = self.next_tick();
        // Frequency carries over from the element's own history
        let order = AccessOrder {
            hits: element.hit_count(),
            ..AccessOrder::new(tick)
        };
        let key = element.key().clone();
        self.detach(&key, policy);
        self.ranking
            .insert((policy.rank(&order), order.inserted), key.clone());
        self.used_bytes += bytes;
        self.map.insert(
            key,
            Slot {
                element,
                order,
                bytes,
            },
        );
    }

    fn detach(&mut self, key: &K, policy: EvictionPolicy) -> Option<Slot<K, V>> {
        let slot = self.map.remove(key)?;
        self.ranking
            .remove(&(policy.rank(&slot.order), slot.order.inserted));
        self.used_bytes = self.used_bytes.saturating_sub(slot.bytes);
        Some(slot)
    }

    fn touch(&mut self, key: &K, policy: EvictionPolicy, now: u64) -> Option<Element<K, V>> {
        let tick = self.next_tick();
        let slot = self.map.get_mut(key)?;
        let old_rank = (policy.rank(&slot.order), slot.order.inserted);
        slot.order.touch(tick);
        slot.element.update_access_statistics(now);
        let new_rank = (policy.rank(&slot.order), slot.order.inserted);
        let element = slot.element.clone();
        if old_rank != new_rank {
            self.ranking.remove(&old_rank);
            self.ranking.insert(new_rank, key.clone());
        }
        Some(element)
    }

    fn over_capacity(&self) -> bool {
        match self.capacity {
            MemoryCapacity::Entries(max) => self.map.len() > max,
            MemoryCapacity::Bytes(max) => self.used_bytes > max,
        }
    }

    fn evict_overflow(&mut self, policy: EvictionPolicy) -> Vec<Element<K, V>> {
        let mut victims = Vec::new();
        while self.over_capacity() {
            let Some((_, key)) = self.ranking.pop_first() else {
                break;
            };
            if let Some(slot) = self.map.remove(&key) {
                self.used_bytes = self.used_bytes.saturating_sub(slot.bytes);
                victims.push(slot.element);
            }
        }
        victims
    }
}

/// Bounded in-memory store
pub struct MemoryStore<K, V> {
    name: String,
    policy: EvictionPolicy,
    defaults: ExpiryDefaults,
    inner: Mutex<MemoryInner<K, V>>,
    overflow: Option<Arc<dyn OverflowHandler<K, V>>>,
}

impl<K: ElementKey, V: ElementValue> MemoryStore<K, V> {
    /// Create a store; evicted elements are discarded when `overflow` is None
    pub fn new(
        name: impl Into<String>,
        capacity: MemoryCapacity,
        policy: EvictionPolicy,
        defaults: ExpiryDefaults,
        overflow: Option<Arc<dyn OverflowHandler<K, V>>>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            defaults,
            inner: Mutex::new(MemoryInner {
                map: HashMap::new(),
                ranking: BTreeMap::new(),
                capacity,
                used_bytes: 0,
                tick: 0,
            }),
            overflow,
        }
    }

    fn estimate_bytes(&self, element: &Element<K, V>) -> u64 {
        match self.inner.lock().capacity {
            MemoryCapacity::Entries(_) => 0,
            MemoryCapacity::Bytes(_) => element
                .serialized_size()
                .unwrap_or(std::mem::size_of::<Element<K, V>>() as u64),
        }
    }

    /// Insert or replace an element, evicting to get back within capacity
    pub fn put(&self, element: Element<K, V>) {
        let bytes = self.estimate_bytes(&element);
        let deferred = {
            let mut inner = self.inner.lock();
            inner.insert(self.policy, element, bytes);
            let victims = inner.evict_overflow(self.policy);
            self.hand_over(victims)
        };
        run_deferred(deferred);
    }

    /// Insert only when the key is absent and `still_current` holds
    ///
    /// Both checks run under the store lock, so a concurrent put of the same
    /// key always wins over the element offered here.
    pub fn put_if_absent(&self, element: Element<K, V>, still_current: impl FnOnce() -> bool) -> bool {
        let bytes = self.estimate_bytes(&element);
        let deferred = {
            let mut inner = self.inner.lock();
            if inner.map.contains_key(element.key()) || !still_current() {
                return false;
            }
            inner.insert(self.policy, element, bytes);
            let victims = inner.evict_overflow(self.policy);
            self.hand_over(victims)
        };
        run_deferred(deferred);
        true
    }

    /// Pass victims to the overflow handler; call with the lock held
    fn hand_over(&self, victims: Vec<Element<K, V>>) -> Vec<Deferred> {
        if victims.is_empty() {
            return Vec::new();
        }
        debug!(cache = %self.name, count = victims.len(), "memory store evicting");
        match &self.overflow {
            Some(handler) => victims
                .into_iter()
                .filter_map(|victim| handler.on_evict(victim))
                .collect(),
            None => Vec::new(),
        }
    }

    fn lookup(&self, key: &K, now: u64, touch: bool) -> Lookup<K, V> {
        let mut inner = self.inner.lock();
        let expired = match inner.map.get(key) {
            None => return Lookup::Miss,
            Some(slot) => slot.element.is_expired(&self.defaults, now),
        };
        if expired {
            return match inner.detach(key, self.policy) {
                Some(slot) => Lookup::Expired(slot.element),
                None => Lookup::Miss,
            };
        }
        let found = if touch {
            inner.touch(key, self.policy, now)
        } else {
            inner.map.get(key).map(|slot| slot.element.clone())
        };
        match found {
            Some(element) => Lookup::Hit(element),
            None => Lookup::Miss,
        }
    }

    /// Expiry-checked read that records the access
    pub fn get(&self, key: &K, now: u64) -> Lookup<K, V> {
        self.lookup(key, now, true)
    }

    /// Expiry-checked read without touching statistics or ordering
    pub fn get_quiet(&self, key: &K, now: u64) -> Lookup<K, V> {
        self.lookup(key, now, false)
    }

    /// Raw read, no expiry check and no statistics
    pub fn peek(&self, key: &K) -> Option<Element<K, V>> {
        self.inner.lock().map.get(key).map(|slot| slot.element.clone())
    }

    pub fn remove(&self, key: &K) -> Option<Element<K, V>> {
        self.remove_with(key, || ()).0
    }

    /// Remove `key` and run `also` before the lock is released
    ///
    /// Used to clear the other tiers atomically with respect to evictions and
    /// promotions of this store.
    pub fn remove_with<R>(&self, key: &K, also: impl FnOnce() -> R) -> (Option<Element<K, V>>, R) {
        let mut inner = self.inner.lock();
        let removed = inner.detach(key, self.policy).map(|slot| slot.element);
        (removed, also())
    }

    pub fn remove_all(&self) {
        self.remove_all_with(|| ());
    }

    /// Empty the store and run `also` before the lock is released
    pub fn remove_all_with<R>(&self, also: impl FnOnce() -> R) -> R {
        let mut inner = self.inner.lock();
        inner.map = HashMap::new();
        inner.ranking = BTreeMap::new();
        inner.used_bytes = 0;
        also()
    }

    /// Hand a copy of every live element to `spool` under the lock
    ///
    /// Expired elements are detached and returned instead. With `clear` the
    /// spooled elements leave the store too, so no put can slip in between
    /// the copy and the removal.
    pub fn spool_all<T>(
        &self,
        now: u64,
        clear: bool,
        mut spool: impl FnMut(Element<K, V>) -> T,
    ) -> (Vec<T>, Vec<Element<K, V>>) {
        let mut inner = self.inner.lock();
        let keys: Vec<K> = inner.map.keys().cloned().collect();
        let mut spooled = Vec::with_capacity(keys.len());
        let mut expired = Vec::new();
        for key in keys {
            let is_expired = inner
                .map
                .get(&key)
                .is_some_and(|slot| slot.element.is_expired(&self.defaults, now));
            if is_expired || clear {
                if let Some(slot) = inner.detach(&key, self.policy) {
                    if is_expired {
                        expired.push(slot.element);
                    } else {
                        spooled.push(spool(slot.element));
                    }
                }
            } else if let Some(slot) = inner.map.get(&key) {
                spooled.push(spool(slot.element.clone()));
            }
        }
        (spooled, expired)
    }

    /// Change the bound live, evicting anything over the new one
    pub fn memory_capacity_changed(&self, old: MemoryCapacity, new: MemoryCapacity) {
        debug!(cache = %self.name, ?old, ?new, "memory capacity changed");
        let deferred = {
            let mut inner = self.inner.lock();
            if matches!(
                (inner.capacity, new),
                (MemoryCapacity::Entries(_), MemoryCapacity::Bytes(_))
            ) {
                let mut used = 0;
                for slot in inner.map.values_mut() {
                    slot.bytes = slot
                        .element
                        .serialized_size()
                        .unwrap_or(std::mem::size_of::<Element<K, V>>() as u64);
                    used += slot.bytes;
                }
                inner.used_bytes = used;
            }
            inner.capacity = new;
            let victims = inner.evict_overflow(self.policy);
            self.hand_over(victims)
        };
        run_deferred(deferred);
    }

    /// Remove and return every expired element
    pub fn evict_expired(&self, now: u64) -> Vec<Element<K, V>> {
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, slot)| slot.element.is_expired(&self.defaults, now))
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| inner.detach(key, self.policy).map(|slot| slot.element))
            .collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().map.keys().cloned().collect()
    }

    /// Keys of elements not expired at `now`
    pub fn live_keys(&self, now: u64) -> Vec<K> {
        self.inner
            .lock()
            .map
            .iter()
            .filter(|(_, slot)| !slot.element.is_expired(&self.defaults, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Estimated bytes held (0 for entry-bounded stores)
    pub fn size_in_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn capacity(&self) -> MemoryCapacity {
        self.inner.lock().capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}

fn run_deferred(deferred: Vec<Deferred>) {
    for work in deferred {
        work();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl OverflowHandler<String, String> for Collect {
        fn on_evict(&self, element: Element<String, String>) -> Option<Deferred> {
            self.0.lock().push(element.key().clone());
            None
        }
    }

    fn make_element(key: &str) -> Element<String, String> {
        Element::created_at(key.to_string(), format!("v{key}"), T0)
    }

    fn make_store(
        capacity: usize,
        policy: EvictionPolicy,
    ) -> (MemoryStore<String, String>, Arc<Collect>) {
        let collect = Arc::new(Collect::default());
        let store = MemoryStore::new(
            "test",
            MemoryCapacity::Entries(capacity),
            policy,
            ExpiryDefaults::default(),
            Some(collect.clone() as Arc<dyn OverflowHandler<String, String>>),
        );
        (store, collect)
    }

    #[test]
    fn test_put_and_get() {
        let (store, _) = make_store(10, EvictionPolicy::Lru);
        store.put(make_element("a"));
        let hit = store.get(&"a".to_string(), T0 + 1).into_option().unwrap();
        assert_eq!(hit.value(), Some(&"va".to_string()));
        assert_eq!(hit.hit_count(), 1);
        assert_eq!(hit.last_access_time(), T0 + 1);
    }

    #[test]
    fn test_get_quiet_does_not_touch() {
        let (store, _) = make_store(10, EvictionPolicy::Lru);
        store.put(make_element("a"));
        let e = store.get_quiet(&"a".to_string(), T0).into_option().unwrap();
        assert_eq!(e.hit_count(), 0);
        assert_eq!(store.peek(&"a".to_string()).unwrap().hit_count(), 0);
    }

    #[test]
    fn test_lru_eviction_order() {
        let (store, evicted) = make_store(2, EvictionPolicy::Lru);
        store.put(make_element("a"));
        store.put(make_element("b"));
        store.get(&"a".to_string(), T0);
        store.put(make_element("c"));
        assert_eq!(*evicted.0.lock(), vec!["b".to_string()]);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn test_fifo_eviction_order() {
        let (store, evicted) = make_store(2, EvictionPolicy::Fifo);
        store.put(make_element("a"));
        store.put(make_element("b"));
        store.get(&"a".to_string(), T0);
        store.put(make_element("c"));
        assert_eq!(*evicted.0.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_lfu_eviction_order() {
        let (store, evicted) = make_store(3, EvictionPolicy::Lfu);
        for k in ["a", "b", "c"] {
            store.put(make_element(k));
        }
        store.get(&"a".to_string(), T0);
        store.get(&"a".to_string(), T0);
        store.get(&"c".to_string(), T0);
        store.put(make_element("d"));
        assert_eq!(*evicted.0.lock(), vec!["b".to_string()]);
    }

    #[test]
    fn test_lfu_ranks_inserted_element_by_its_hits() {
        let (store, evicted) = make_store(2, EvictionPolicy::Lfu);
        let mut hot = make_element("hot");
        for _ in 0..5 {
            hot.update_access_statistics(T0);
        }
        store.put(hot);
        store.put(make_element("cold"));
        store.get(&"cold".to_string(), T0);
        store.put(make_element("new"));
        assert_eq!(*evicted.0.lock(), vec!["new".to_string()]);
        assert!(store.contains_key(&"hot".to_string()));
    }

    #[test]
    fn test_put_if_absent() {
        let (store, _) = make_store(10, EvictionPolicy::Lru);
        store.put(make_element("a"));
        let stale = Element::created_at("a".to_string(), "stale".to_string(), T0);
        assert!(!store.put_if_absent(stale, || true));
        assert_eq!(store.peek(&"a".to_string()).unwrap().value(), Some(&"va".to_string()));

        assert!(!store.put_if_absent(make_element("b"), || false));
        assert!(!store.contains_key(&"b".to_string()));
        assert!(store.put_if_absent(make_element("b"), || true));
        assert!(store.contains_key(&"b".to_string()));
    }

    #[test]
    fn test_remove_with_runs_under_lock() {
        let (store, _) = make_store(10, EvictionPolicy::Lru);
        store.put(make_element("a"));
        let (removed, held) = store.remove_with(&"a".to_string(), || store.inner.is_locked());
        assert!(removed.is_some());
        assert!(held);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_spool_all() {
        let collect = Arc::new(Collect::default());
        let store = MemoryStore::new(
            "spool",
            MemoryCapacity::Entries(10),
            EvictionPolicy::Lru,
            ExpiryDefaults {
                time_to_live_secs: 10,
                time_to_idle_secs: 0,
                eternal: false,
            },
            Some(collect as Arc<dyn OverflowHandler<String, String>>),
        );
        store.put(make_element("old"));
        store.put(Element::created_at("young".to_string(), "v".to_string(), T0 + 5_000));

        let now = T0 + 10_000;
        let (kept, expired) = store.spool_all(now, false, |e| e.key().clone());
        assert_eq!(kept, vec!["young".to_string()]);
        assert_eq!(expired.len(), 1);
        assert_eq!(store.size(), 1);

        let (cleared, _) = store.spool_all(now, true, |e| e.key().clone());
        assert_eq!(cleared, vec!["young".to_string()]);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let (store, evicted) = make_store(2, EvictionPolicy::Lru);
        store.put(make_element("a"));
        store.put(make_element("a"));
        store.put(make_element("b"));
        assert_eq!(store.size(), 2);
        assert!(evicted.0.lock().is_empty());
    }

    #[test]
    fn test_expired_removed_on_get() {
        let collect = Arc::new(Collect::default());
        let store = MemoryStore::new(
            "ttl",
            MemoryCapacity::Entries(10),
            EvictionPolicy::Lru,
            ExpiryDefaults {
                time_to_live_secs: 1,
                time_to_idle_secs: 0,
                eternal: false,
            },
            Some(collect as Arc<dyn OverflowHandler<String, String>>),
        );
        store.put(make_element("a"));
        assert!(store.get(&"a".to_string(), T0 + 999).is_hit());
        assert!(matches!(
            store.get(&"a".to_string(), T0 + 1_000),
            Lookup::Expired(_)
        ));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_capacity_shrink_and_grow() {
        let (store, evicted) = make_store(5, EvictionPolicy::Lru);
        for i in 0..5 {
            store.put(make_element(&i.to_string()));
        }
        store.memory_capacity_changed(MemoryCapacity::Entries(5), MemoryCapacity::Entries(2));
        assert_eq!(store.size(), 2);
        assert_eq!(evicted.0.lock().len(), 3);
        store.memory_capacity_changed(MemoryCapacity::Entries(2), MemoryCapacity::Entries(10));
        store.put(make_element("x"));
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn test_byte_capacity() {
        let store: MemoryStore<String, String> = MemoryStore::new(
            "bytes",
            MemoryCapacity::Bytes(200),
            EvictionPolicy::Lru,
            ExpiryDefaults::default(),
            None,
        );
        for i in 0..50 {
            store.put(make_element(&format!("key-{i}")));
            assert!(store.size_in_bytes() <= 200);
        }
        assert!(store.size() < 50);
    }

    #[test]
    fn test_deferred_work_runs_after_eviction() {
        struct Deferring(Arc<Mutex<Vec<String>>>);

        impl OverflowHandler<String, String> for Deferring {
            fn on_evict(&self, element: Element<String, String>) -> Option<Deferred> {
                let done = Arc::clone(&self.0);
                Some(Box::new(move || done.lock().push(element.key().clone())))
            }
        }

        let done = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new(
            "deferred",
            MemoryCapacity::Entries(1),
            EvictionPolicy::Lru,
            ExpiryDefaults::default(),
            Some(Arc::new(Deferring(Arc::clone(&done))) as Arc<dyn OverflowHandler<String, String>>),
        );
        store.put(make_element("a"));
        store.put(make_element("b"));
        assert_eq!(*done.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_remove_all() {
        let (store, _) = make_store(10, EvictionPolicy::Lru);
        store.put(make_element("a"));
        store.remove_all();
        assert_eq!(store.size(), 0);
        assert!(store.remove(&"a".to_string()).is_none());
    }

    #[test]
    fn test_concurrent_puts_stay_bounded() {
        let (store, _) = make_store(16, EvictionPolicy::Lru);
        let store = Arc::new(store);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        store.put(make_element(&format!("{t}-{i}")));
                        store.get(&format!("{t}-{}", i / 2), T0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.size(), 16);
    }
}
