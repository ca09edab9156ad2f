//! Cache Eviction Policies
//!
//! Victim selection for capacity-bound stores.
//!
//! # Design
//!
//! Each tracked entry carries an [`AccessOrder`] stamped from a store-local
//! logical tick. A policy maps that to a [`Rank`]; the entry with the smallest
//! rank is the victim. Ticks are unique per store, so ranks never tie.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordering metadata tracked per entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessOrder {
    /// Tick at which the entry was inserted
    pub inserted: u64,
    /// Tick of the most recent access (equals `inserted` until first read)
    pub accessed: u64,
    /// Number of reads
    pub hits: u64,
}

impl AccessOrder {
    pub fn new(tick: u64) -> Self {
        Self {
            inserted: tick,
            accessed: tick,
            hits: 0,
        }
    }

    pub fn touch(&mut self, tick: u64) {
        self.accessed = tick;
        self.hits = self.hits.saturating_add(1);
    }
}

/// Sort key for victim selection, smallest first
pub type Rank = (u64, u64);

/// Eviction policy used when a store exceeds its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicy {
    /// Least recently used, ties by earliest insertion
    #[default]
    Lru,
    /// Least frequently used, ties by least recent access
    Lfu,
    /// First in, first out
    Fifo,
}

impl EvictionPolicy {
    pub fn rank(&self, order: &AccessOrder) -> Rank {
        match self {
            EvictionPolicy::Lru => (order.accessed, order.inserted),
            EvictionPolicy::Lfu => (order.hits, order.accessed),
            EvictionPolicy::Fifo => (order.inserted, 0),
        }
    }

    /// Pick the victim among `candidates`
    pub fn select_victim<'a, K: 'a>(
        &self,
        candidates: impl IntoIterator<Item = (&'a K, &'a AccessOrder)>,
    ) -> Option<&'a K> {
        candidates
            .into_iter()
            .min_by_key(|(_, order)| self.rank(order))
            .map(|(key, _)| key)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "LRU",
            EvictionPolicy::Lfu => "LFU",
            EvictionPolicy::Fifo => "FIFO",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(EvictionPolicy::Lru),
            "LFU" => Ok(EvictionPolicy::Lfu),
            "FIFO" => Ok(EvictionPolicy::Fifo),
            other => Err(format!("unknown eviction policy: {other}")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
