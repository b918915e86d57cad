use std::collections::HashMap;

use parking_lot::Mutex;

/// What the registry remembers about a virtualized cancel key: the
/// backend it belongs to and its true secret.
#[derive(Debug, Clone)]
pub struct CancelRecord {
    pub original_secret: i32,
    pub host: String,
    pub port: String,
}

/// Process-wide mapping from `(pid, assigned_secret)` to the backend
/// that actually owns that cancellation. This is the only shared
/// mutable state in the proxy, guarded with `parking_lot::Mutex`.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<i32, HashMap<i32, CancelRecord>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a unique `assigned_secret` within `pid`'s bucket,
    /// starting from `original_secret` and incrementing on collision
    /// (wrapping on overflow), then stores the record.
    pub fn add(&self, pid: i32, original_secret: i32, host: String, port: String) -> i32 {
        let mut map = self.inner.lock();
        let bucket = map.entry(pid).or_default();

        let mut assigned = original_secret;
        while bucket.contains_key(&assigned) {
            assigned = assigned.wrapping_add(1);
        }
        bucket.insert(
            assigned,
            CancelRecord {
                original_secret,
                host,
                port,
            },
        );
        assigned
    }

    pub fn get(&self, pid: i32, assigned_secret: i32) -> Option<CancelRecord> {
        let map = self.inner.lock();
        map.get(&pid)?.get(&assigned_secret).cloned()
    }

    /// Removes the record, deleting the pid bucket if it becomes
    /// empty. Returns whether a record was actually present.
    pub fn remove(&self, pid: i32, assigned_secret: i32) -> bool {
        let mut map = self.inner.lock();
        let Some(bucket) = map.get_mut(&pid) else {
            return false;
        };
        let removed = bucket.remove(&assigned_secret).is_some();
        if bucket.is_empty() {
            map.remove(&pid);
        }
        removed
    }

    #[cfg(test)]
    fn bucket_len(&self, pid: i32) -> usize {
        self.inner.lock().get(&pid).map_or(0, |b| b.len())
    }
}
