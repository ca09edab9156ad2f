//! Cache Element
//!
//! An [`Element`] wraps a key, an optional value and the runtime metadata the
//! stores use for expiry and eviction.
//!
//! # Design
//!
//! - Timestamps are epoch milliseconds; lifespans are seconds
//! - A lifespan of 0 defers to the cache default
//! - [`NEVER_EXPIRE`] disables that bound regardless of cache defaults
//! - All expiry arithmetic saturates, so oversized lifespans behave as eternal

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};

/// Lifespan value meaning "never expires"
pub const NEVER_EXPIRE: u64 = u64::MAX;

/// Key types usable with the cache
///
/// Keys must be serializable so they can be written to the disk index.
pub trait ElementKey:
    Hash + Eq + Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Whether this key stands for the absent ("null") key
    fn is_null(&self) -> bool {
        false
    }
}

macro_rules! plain_keys {
    ($($t:ty),* $(,)?) => {
        $(impl ElementKey for $t {})*
    };
}

plain_keys!(String, char, bool, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, Vec<u8>);

impl<T: ElementKey> ElementKey for Option<T> {
    fn is_null(&self) -> bool {
        self.is_none()
    }
}

/// Value types usable with the cache
pub trait ElementValue:
    Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> ElementValue for T where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Cache-level lifespan defaults applied to elements that do not set their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpiryDefaults {
    pub time_to_live_secs: u64,
    pub time_to_idle_secs: u64,
    pub eternal: bool,
}

/// A cached key/value pair with its statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element<K, V> {
    key: K,
    value: Option<V>,
    version: u64,
    creation_time: u64,
    last_access_time: u64,
    last_update_time: u64,
    hit_count: u64,
    time_to_live: u64,
    time_to_idle: u64,
    eternal: bool,
}

impl<K, V> Element<K, V> {
    /// Create an element stamped with the current wall-clock time
    pub fn new(key: K, value: impl Into<Option<V>>) -> Self {
        Self::created_at(key, value, SystemClock.now_millis())
    }

    /// Create an element with an explicit creation instant
    pub fn created_at(key: K, value: impl Into<Option<V>>, now: u64) -> Self {
        Self {
            key,
            value: value.into(),
            version: 1,
            creation_time: now,
            last_access_time: 0,
            last_update_time: now,
            hit_count: 0,
            time_to_live: 0,
            time_to_idle: 0,
            eternal: false,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_time_to_live(mut self, secs: u64) -> Self {
        self.time_to_live = secs;
        self
    }

    pub fn with_time_to_idle(mut self, secs: u64) -> Self {
        self.time_to_idle = secs;
        self
    }

    pub fn with_eternal(mut self, eternal: bool) -> Self {
        self.eternal = eternal;
        self
    }

    /// Override all three timestamps
    pub fn with_timestamps(mut self, creation: u64, last_access: u64, last_update: u64) -> Self {
        self.creation_time = creation;
        self.last_access_time = last_access;
        self.last_update_time = last_update;
        self
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The value, `None` for a null value
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn time_to_live(&self) -> u64 {
        self.time_to_live
    }

    pub fn time_to_idle(&self) -> u64 {
        self.time_to_idle
    }

    pub fn set_time_to_live(&mut self, secs: u64) {
        self.time_to_live = secs;
    }

    pub fn set_time_to_idle(&mut self, secs: u64) {
        self.time_to_idle = secs;
    }

    pub fn is_eternal(&self) -> bool {
        self.eternal
    }

    pub fn set_eternal(&mut self, eternal: bool) {
        self.eternal = eternal;
    }

    /// Whether the element carries any lifespan of its own
    pub fn is_lifespan_set(&self) -> bool {
        self.eternal || self.time_to_live != 0 || self.time_to_idle != 0
    }

    /// Forget access history, as on a replacing put
    pub fn reset_access_statistics(&mut self) {
        self.hit_count = 0;
        self.last_access_time = 0;
    }

    /// Record a read
    pub fn update_access_statistics(&mut self, now: u64) {
        self.hit_count = self.hit_count.saturating_add(1);
        self.last_access_time = now;
    }

    /// Record a replacement of the stored element
    pub fn update_update_statistics(&mut self, now: u64) {
        self.last_update_time = now;
    }

    pub(crate) fn restore_access(&mut self, hit_count: u64, last_access: u64) {
        self.hit_count = hit_count;
        self.last_access_time = last_access;
    }

    fn effective_eternal(&self, defaults: &ExpiryDefaults) -> bool {
        self.eternal || (defaults.eternal && !self.is_lifespan_set())
    }

    fn effective_ttl(&self, defaults: &ExpiryDefaults) -> u64 {
        if self.time_to_live != 0 {
            self.time_to_live
        } else {
            defaults.time_to_live_secs
        }
    }

    fn effective_tti(&self, defaults: &ExpiryDefaults) -> u64 {
        if self.time_to_idle != 0 {
            self.time_to_idle
        } else {
            defaults.time_to_idle_secs
        }
    }

    /// Instant (epoch ms) at which the element expires, [`NEVER_EXPIRE`] if never
    pub fn expiration_time(&self, defaults: &ExpiryDefaults) -> u64 {
        if self.effective_eternal(defaults) {
            return NEVER_EXPIRE;
        }
        let by_live = deadline(self.creation_time, self.effective_ttl(defaults));
        let idle_basis = self.creation_time.max(self.last_access_time);
        let by_idle = deadline(idle_basis, self.effective_tti(defaults));
        by_live.min(by_idle)
    }

    /// Whether the element has expired at `now`
    pub fn is_expired(&self, defaults: &ExpiryDefaults, now: u64) -> bool {
        let expires = self.expiration_time(defaults);
        expires != NEVER_EXPIRE && now >= expires
    }

    /// Copy with identical key, value and lifespan but fresh access statistics
    pub fn fresh_copy(&self) -> Self
    where
        K: Clone,
        V: Clone,
    {
        let mut copy = self.clone();
        copy.reset_access_statistics();
        copy
    }
}

impl<K: Serialize, V: Serialize> Element<K, V> {
    /// Serialized size in bytes, `None` if the element cannot be serialized
    pub fn serialized_size(&self) -> Option<u64> {
        bincode::serialized_size(self).ok()
    }
}

fn deadline(basis: u64, lifespan_secs: u64) -> u64 {
    if lifespan_secs == 0 || lifespan_secs == NEVER_EXPIRE {
        return NEVER_EXPIRE;
    }
    basis.saturating_add(lifespan_secs.saturating_mul(1000))
}

/// Outcome of an expiry-aware lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<K, V> {
    /// Live element
    Hit(Element<K, V>),
    /// Element found expired and removed
    Expired(Element<K, V>),
    Miss,
}

impl<K, V> Lookup<K, V> {
    pub fn into_option(self) -> Option<Element<K, V>> {
        match self {
            Lookup::Hit(element) => Some(element),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000;

    fn make_element(key: &str) -> Element<String, String> {
        Element::created_at(key.to_string(), format!("value-{key}"), T0)
    }

    fn defaults(ttl: u64, tti: u64) -> ExpiryDefaults {
        ExpiryDefaults {
            time_to_live_secs: ttl,
            time_to_idle_secs: tti,
            eternal: false,
        }
    }

    #[test]
    fn test_element_defaults() {
        let e = make_element("a");
        assert_eq!(e.version(), 1);
        assert_eq!(e.hit_count(), 0);
        assert_eq!(e.creation_time(), T0);
        assert!(!e.is_lifespan_set());
    }

    #[test]
    fn test_null_value_is_distinct() {
        let e: Element<String, String> = Element::created_at("k".to_string(), None, T0);
        assert!(e.value().is_none());
        assert!(!e.key().is_null());
        assert!(None::<String>.is_null());
    }

    #[test]
    fn test_ttl_boundary_is_inclusive() {
        let e = make_element("a");
        let d = defaults(10, 0);
        assert!(!e.is_expired(&d, T0 + 9_999));
        assert!(e.is_expired(&d, T0 + 10_000));
    }

    #[test]
    fn test_ttl_not_reset_by_access() {
        let mut e = make_element("a");
        let d = defaults(10, 0);
        e.update_access_statistics(T0 + 9_000);
        assert!(e.is_expired(&d, T0 + 10_000));
    }

    #[test]
    fn test_tti_reset_by_access() {
        let mut e = make_element("a");
        let d = defaults(0, 5);
        e.update_access_statistics(T0 + 4_000);
        assert!(!e.is_expired(&d, T0 + 8_999));
        assert!(e.is_expired(&d, T0 + 9_000));
    }

    #[test]
    fn test_element_override_wins() {
        let e = make_element("a").with_time_to_live(100);
        let d = defaults(10, 0);
        assert!(!e.is_expired(&d, T0 + 50_000));
        assert!(e.is_expired(&d, T0 + 100_000));
    }

    #[test]
    fn test_never_expire_sentinel() {
        let e = make_element("a")
            .with_time_to_live(NEVER_EXPIRE)
            .with_time_to_idle(NEVER_EXPIRE);
        let d = defaults(1, 1);
        assert_eq!(e.expiration_time(&d), NEVER_EXPIRE);
        assert!(!e.is_expired(&d, u64::MAX - 1));
    }

    #[test]
    fn test_huge_lifespan_saturates() {
        let e = make_element("a").with_time_to_live(u64::MAX / 10);
        assert!(!e.is_expired(&defaults(0, 0), u64::MAX - 1));
    }

    #[test]
    fn test_eternal_element() {
        let e = make_element("a").with_eternal(true);
        assert!(!e.is_expired(&defaults(1, 1), T0 + 1_000_000_000));
    }

    #[test]
    fn test_cache_eternal_only_without_own_lifespan() {
        let d = ExpiryDefaults {
            time_to_live_secs: 0,
            time_to_idle_secs: 0,
            eternal: true,
        };
        assert!(!make_element("a").is_expired(&d, u64::MAX - 1));
        let own = make_element("b").with_time_to_live(1);
        assert!(own.is_expired(&d, T0 + 1_000));
    }

    #[test]
    fn test_fresh_copy_resets_statistics() {
        let mut e = make_element("a").with_version(7);
        e.update_access_statistics(T0 + 5);
        let copy = e.fresh_copy();
        assert_eq!(copy.hit_count(), 0);
        assert_eq!(copy.last_access_time(), 0);
        assert_eq!(copy.version(), 7);
        assert_eq!(copy.creation_time(), e.creation_time());
        assert_eq!(e.hit_count(), 1);
    }

    #[test]
    fn test_lookup_into_option() {
        let hit = Lookup::Hit(make_element("a"));
        assert!(hit.is_hit());
        assert!(hit.into_option().is_some());
        assert!(Lookup::Expired(make_element("b")).into_option().is_none());
    }
}
