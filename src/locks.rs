//! Per-key mutual exclusion.
//!
//! Transitions for one serial run one at a time; different serials never
//! contend beyond the brief map lookup.  Idle entries are pruned so the map
//! only holds keys that are currently in use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.to_string()).or_default())
        };

        let out = {
            let _held = slot.lock();
            f()
        };

        drop(slot);
        self.prune(key);
        out
    }

    /// Number of keys currently tracked.
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }

    fn prune(&self, key: &str) {
        let mut slots = self.slots.lock();
        // Only the map holds it: nobody is waiting or running.
        if slots.get(key).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with("BIO-001", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_keys_are_pruned() {
        let locks = KeyedLocks::new();
        let v = locks.with("A", || {
            locks.with("B", || assert_eq!(locks.active(), 2));
            7
        });
        assert_eq!(v, 7);
        assert_eq!(locks.active(), 0);
    }
}
