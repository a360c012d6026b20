//! Thread-safe TTL cache.
//!
//! `key → (value, stored_at, ttl)` behind one lock. A background sweeper
//! removes expired entries on a coarse tick; `get` also lazily expires, so a
//! stale value is never returned even between sweeps. The sweeper exits on
//! its own once the cache is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Default entry time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default sweep tick.
pub const DEFAULT_SWEEP: Duration = Duration::from_secs(60);

struct Entry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

struct Inner<V> {
    map: Mutex<HashMap<String, Entry<V>>>,
    default_ttl: Duration,
}

/// See the module docs.
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> std::fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.map.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Cache").field("entries", &len).finish_non_exhaustive()
    }
}

impl<V: Clone + Send + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> Cache<V> {
    /// A cache with the default TTL (300 s) and sweep tick (60 s).
    pub fn new() -> Self {
        Self::with_config(DEFAULT_TTL, DEFAULT_SWEEP)
    }

    /// A cache with explicit default TTL and sweep tick.
    pub fn with_config(default_ttl: Duration, sweep: Duration) -> Self {
        let inner = Arc::new(Inner { map: Mutex::new(HashMap::new()), default_ttl });
        spawn_sweeper(Arc::downgrade(&inner), sweep);
        Self { inner }
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: &str, value: V) {
        self.set_ttl(key, value, None);
    }

    /// Insert with an explicit TTL.
    pub fn set_ttl(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        self.inner.map.lock().expect("cache poisoned").insert(
            key.to_string(),
            Entry { value, stored_at: Instant::now(), ttl },
        );
    }

    /// Fetch a live value; expired entries are removed on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut map = self.inner.map.lock().expect("cache poisoned");
        let entry = map.get(key)?;
        if entry.stored_at.elapsed() > entry.ttl {
            map.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove one entry.
    pub fn delete(&self, key: &str) {
        self.inner.map.lock().expect("cache poisoned").remove(key);
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.inner.map.lock().expect("cache poisoned").clear();
    }

    /// Number of entries, including any not yet swept.
    pub fn len(&self) -> usize {
        self.inner.map.lock().expect("cache poisoned").len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spawn_sweeper<V: Send + 'static>(inner: Weak<Inner<V>>, sweep: Duration) {
    thread::spawn(move || {
        // Wake at most once a second so a dropped cache releases its thread
        // promptly even with a long sweep tick.
        let step = sweep.min(Duration::from_secs(1)).max(Duration::from_millis(10));
        let mut since_sweep = Duration::ZERO;
        loop {
            thread::sleep(step);
            since_sweep += step;
            let Some(inner) = inner.upgrade() else { return };
            if since_sweep < sweep {
                continue;
            }
            since_sweep = Duration::ZERO;
            let mut map = inner.map.lock().expect("cache poisoned");
            map.retain(|_, entry| entry.stored_at.elapsed() <= entry.ttl);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_round_trip() {
        let cache: Cache<String> = Cache::new();
        cache.set("k", "v".into());
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn get_lazily_expires() {
        let cache: Cache<u32> = Cache::with_config(Duration::from_millis(30), Duration::from_secs(60));
        cache.set("k", 1);
        assert_eq!(cache.get("k"), Some(1));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn per_entry_ttl_overrides_default() {
        let cache: Cache<u32> = Cache::with_config(Duration::from_secs(300), Duration::from_secs(60));
        cache.set_ttl("short", 1, Some(Duration::from_millis(30)));
        cache.set("long", 2);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));
    }

    #[test]
    fn sweeper_removes_expired_entries() {
        let cache: Cache<u32> =
            Cache::with_config(Duration::from_millis(20), Duration::from_millis(50));
        cache.set("k", 1);
        assert_eq!(cache.len(), 1);
        // Never touched via get; the sweeper alone must reap it.
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn delete_and_clear() {
        let cache: Cache<u32> = Cache::new();
        cache.set("a", 1);
        cache.set("b", 2);
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn overwrite_refreshes_value_and_clock() {
        let cache: Cache<u32> = Cache::with_config(Duration::from_millis(80), Duration::from_secs(60));
        cache.set("k", 1);
        thread::sleep(Duration::from_millis(50));
        cache.set("k", 2);
        thread::sleep(Duration::from_millis(50));
        // 100 ms after the first insert but only 50 ms after the overwrite.
        assert_eq!(cache.get("k"), Some(2));
    }
}
