//! Signature-keyed store of compiled kernels.
//!
//! Lookups take a shared read lock. A miss takes the build lock, checks
//! again and only then runs the builder, so one signature is compiled at
//! most once per cache no matter how many threads ask for it at the same
//! time. The build lock also serializes executable-memory allocation.
//! Entries are never evicted.
//!
//! A failed build is not stored as an entry. Threads that were already
//! waiting on that build get its error; callers arriving afterwards build
//! again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::error::Error;

/// Last failed build per key, tagged with the attempt that produced it.
struct Failures<K, E> {
    latest: HashMap<K, (usize, E)>,
}

/// Map from kernel signature to a shared compiled kernel.
pub struct KernelCache<K, V, E = Error> {
    entries: RwLock<HashMap<K, V>>,
    build: Mutex<Failures<K, E>>,
    /// Finished build attempts, successful or not.
    attempts: AtomicUsize,
    compilations: AtomicUsize,
}

impl<K, V, E> Default for KernelCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> KernelCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        KernelCache {
            entries: RwLock::new(HashMap::new()),
            build: Mutex::new(Failures { latest: HashMap::new() }),
            attempts: AtomicUsize::new(0),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Cached entry for `key`, if it was built before.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns the entry for `key`, running `build` if there is none yet.
    ///
    /// Callers racing on a missing key see a single build: its entry, or
    /// its error. A failure is not cached, so a call made after it returned
    /// runs `build` again.
    pub fn get_or_create<F>(&self, key: &K, build: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut failures = self.build.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        // a build of this key failed while we waited for the lock
        if let Some((attempt, err)) = failures.latest.get(key) {
            if *attempt > seen {
                return Err(err.clone());
            }
        }

        let result = build();
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok(value) => {
                failures.latest.remove(key);
                self.compilations.fetch_add(1, Ordering::Relaxed);
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone(), value.clone());
                Ok(value)
            }
            Err(err) => {
                log::debug!("kernel build failed (attempt {attempt})");
                failures.latest.insert(key.clone(), (attempt, err.clone()));
                Err(err)
            }
        }
    }

    /// Number of successful builds so far.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let cache: KernelCache<u32, Arc<String>, ()> = KernelCache::new();
        let first = cache
            .get_or_create(&7, || Ok(Arc::new("seven".to_string())))
            .unwrap();
        let second = cache
            .get_or_create(&7, || panic!("builder ran twice"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compilations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let cache: KernelCache<u32, Arc<u32>, &str> = KernelCache::new();
        assert_eq!(cache.get_or_create(&1, || Err("bad shape")), Err("bad shape"));
        assert!(cache.is_empty());
        assert_eq!(cache.compilations(), 0);

        let value = cache.get_or_create(&1, || Ok(Arc::new(1))).unwrap();
        assert_eq!(*value, 1);
        assert_eq!(cache.compilations(), 1);
    }

    #[test]
    fn test_racing_threads_compile_once() {
        let cache: Arc<KernelCache<&'static str, Arc<u64>, ()>> = Arc::new(KernelCache::new());
        let barrier = Arc::new(Barrier::new(64));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_create(&"tile", || {
                            thread::yield_now();
                            Ok(Arc::new(i))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cache.compilations(), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn test_racing_threads_share_a_failed_build() {
        let cache: Arc<KernelCache<u32, Arc<u32>, String>> = Arc::new(KernelCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_create(&3, || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        // hold the build lock until every thread is queued
                        thread::sleep(std::time::Duration::from_millis(200));
                        Err("register budget".to_string())
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Err("register budget".to_string()));
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        // a later call builds again
        let value = cache.get_or_create(&3, || Ok(Arc::new(3))).unwrap();
        assert_eq!(*value, 3);
        assert_eq!(cache.compilations(), 1);
    }
}
