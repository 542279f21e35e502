//! Generic "first caller wins" admission gate.
//!
//! Several places in the engine need the guarantee that concurrent callers
//! racing to create a resource for the same key (a UDP session, a per-UID
//! stats record) end up sharing exactly one instance rather than each
//! allocating their own. Because every caller here already executes inside
//! a single coarse lock (the `FlowManager` mutex, the stats table lock) the
//! gate reduces to a plain `entry()`-style get-or-insert — but it is pulled
//! out into its own type so the "at most one creation per key" contract is
//! named and tested independently of where it is used.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub struct SingleFlight<K, V> {
    entries: Mutex<FxHashMap<K, Arc<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing value for `key`, or runs `create` and installs
    /// its result as the one-and-only value for that key. `created` is true
    /// only for the call whose `create` closure actually ran.
    pub fn enter<F>(&self, key: &K, create: F) -> (bool, Arc<V>)
    where
        F: FnOnce() -> V,
    {
        let mut guard = self.entries.lock();
        if let Some(existing) = guard.get(key) {
            return (false, Arc::clone(existing));
        }
        let value = Arc::new(create());
        guard.insert(key.clone(), Arc::clone(&value));
        (true, value)
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().remove(key)
    }

    pub fn drain(&self) -> Vec<(K, Arc<V>)> {
        self.entries.lock().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn only_first_caller_creates() {
        let gate: SingleFlight<&'static str, AtomicUsize> = SingleFlight::new();
        let creations = AtomicUsize::new(0);
        let (first_created, first) = gate.enter(&"flow-a", || {
            creations.fetch_add(1, Ordering::SeqCst);
            AtomicUsize::new(0)
        });
        let (second_created, second) = gate.enter(&"flow-a", || {
            creations.fetch_add(1, Ordering::SeqCst);
            AtomicUsize::new(0)
        });
        assert!(first_created);
        assert!(!second_created);
        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinct_keys_each_create_once() {
        let gate: SingleFlight<u32, u32> = SingleFlight::new();
        let (a_created, _) = gate.enter(&1, || 10);
        let (b_created, _) = gate.enter(&2, || 20);
        assert!(a_created);
        assert!(b_created);
        assert_eq!(gate.get(&1).map(|v| *v), Some(10));
        assert_eq!(gate.get(&2).map(|v| *v), Some(20));
    }
}
