//! Cache event listeners

use std::sync::Arc;

use parking_lot::RwLock;

use super::element::Element;

/// Receives notifications about element changes in a cache
///
/// All callbacks default to no-ops. Callbacks run on the thread performing
/// the operation and must not call back into the same cache.
pub trait CacheEventListener<K, V>: Send + Sync {
    fn notify_element_put(&self, _cache: &str, _element: &Element<K, V>) {}

    fn notify_element_updated(&self, _cache: &str, _element: &Element<K, V>) {}

    fn notify_element_removed(&self, _cache: &str, _element: &Element<K, V>) {}

    /// An element was found expired, on access or by a sweep
    fn notify_element_expired(&self, _cache: &str, _element: &Element<K, V>) {}

    /// An element left the cache for lack of capacity
    fn notify_element_evicted(&self, _cache: &str, _element: &Element<K, V>) {}

    fn notify_remove_all(&self, _cache: &str) {}

    /// The cache is shutting down
    fn dispose(&self) {}
}

/// Registered listeners of one cache
pub(crate) struct Listeners<K, V> {
    inner: RwLock<Vec<Arc<dyn CacheEventListener<K, V>>>>,
}

impl<K, V> Default for Listeners<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }
}

impl<K, V> Listeners<K, V> {
    pub fn register(&self, listener: Arc<dyn CacheEventListener<K, V>>) {
        self.inner.write().push(listener);
    }

    /// Remove a listener by identity
    pub fn unregister(&self, listener: &Arc<dyn CacheEventListener<K, V>>) -> bool {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|l| !Arc::ptr_eq(l, listener));
        inner.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    fn each(&self, f: impl Fn(&dyn CacheEventListener<K, V>)) {
        let listeners = self.inner.read().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    pub fn put(&self, cache: &str, element: &Element<K, V>) {
        self.each(|l| l.notify_element_put(cache, element));
    }

    pub fn updated(&self, cache: &str, element: &Element<K, V>) {
        self.each(|l| l.notify_element_updated(cache, element));
    }

    pub fn removed(&self, cache: &str, element: &Element<K, V>) {
        self.each(|l| l.notify_element_removed(cache, element));
    }

    pub fn expired(&self, cache: &str, element: &Element<K, V>) {
        self.each(|l| l.notify_element_expired(cache, element));
    }

    pub fn evicted(&self, cache: &str, element: &Element<K, V>) {
        self.each(|l| l.notify_element_evicted(cache, element));
    }

    pub fn remove_all(&self, cache: &str) {
        self.each(|l| l.notify_remove_all(cache));
    }

    pub fn dispose(&self) {
        let listeners = std::mem::take(&mut *self.inner.write());
        for listener in listeners {
            listener.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        puts: AtomicUsize,
        disposed: AtomicUsize,
    }

    impl CacheEventListener<String, String> for Counting {
        fn notify_element_put(&self, _cache: &str, _element: &Element<String, String>) {
            self.puts.fetch_add(1, Ordering::Relaxed);
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_register_notify_unregister() {
        let listeners: Listeners<String, String> = Listeners::default();
        let counting = Arc::new(Counting::default());
        let handle: Arc<dyn CacheEventListener<String, String>> = counting.clone();
        listeners.register(handle.clone());
        let e = Element::created_at("k".to_string(), "v".to_string(), 0);
        listeners.put("c", &e);
        listeners.removed("c", &e);
        assert_eq!(counting.puts.load(Ordering::Relaxed), 1);
        assert!(listeners.unregister(&handle));
        listeners.put("c", &e);
        assert_eq!(counting.puts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispose_clears() {
        let listeners: Listeners<String, String> = Listeners::default();
        let counting = Arc::new(Counting::default());
        listeners.register(counting.clone());
        listeners.dispose();
        assert_eq!(counting.disposed.load(Ordering::Relaxed), 1);
        assert_eq!(listeners.len(), 0);
    }
}
