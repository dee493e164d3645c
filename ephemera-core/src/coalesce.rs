//! Request-coalescing key/value cache.
//!
//! Every key owns one [`Deferred`] slot. Callers that want a set of keys call
//! [`CoalescingCache::add`]; only the keys nobody has asked for yet are handed
//! to the fetch function, and everyone else waits on the slots already in
//! flight. The first successful write to a slot wins, so a slow fetch never
//! overwrites a value that was `set` while it was running.

use crate::deferred::Deferred;
use crate::error::{CacheError, CacheResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

type DefaultFn<K, V> = Box<dyn Fn(&K) -> V + Send + Sync>;

/// A generic key/value cache that merges concurrent fetches.
pub struct CoalescingCache<K, V> {
    name: &'static str,
    slots: Mutex<HashMap<K, Deferred<V>>>,
    default: Option<DefaultFn<K, V>>,
}

impl<K, V> fmt::Debug for CoalescingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Rejects still-pending slots if a fetch is dropped before it completes.
struct InFlight<K: fmt::Debug, V: Clone> {
    cache: &'static str,
    slots: Vec<(K, Deferred<V>)>,
}

impl<K: fmt::Debug, V: Clone> Drop for InFlight<K, V> {
    fn drop(&mut self) {
        for (key, slot) in self.slots.drain(..) {
            slot.reject(CacheError::Abandoned {
                cache: self.cache,
                key: format!("{key:?}"),
            });
        }
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    /// Create an empty cache. Keys a fetch does not return are rejected.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
            default: None,
        }
    }

    /// Create an empty cache that fills keys missing from a fetch with `default`.
    pub fn with_default(name: &'static str, default: impl Fn(&K) -> V + Send + Sync + 'static) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
            default: Some(Box::new(default)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Deferred<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `key` has a slot that nothing has settled yet.
    pub fn is_pending(&self, key: &K) -> bool {
        self.slots().get(key).is_some_and(Deferred::is_pending)
    }

    /// Whether anything has requested or set `key` (pending slots count).
    pub fn is_cached(&self, key: &K) -> bool {
        self.slots().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// The resolved value for `key`, without waiting on a pending fetch.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.slots().get(key).and_then(Deferred::peek)
    }

    /// Wait for the value of `key`.
    pub async fn get(&self, key: &K) -> CacheResult<V> {
        let slot = self.slots().get(key).cloned();
        match slot {
            Some(slot) => {
                slot.wait(|| CacheError::Abandoned {
                    cache: self.name,
                    key: format!("{key:?}"),
                })
                .await
            }
            None => Err(CacheError::UnknownKey {
                cache: self.name,
                key: format!("{key:?}"),
            }),
        }
    }

    /// Make sure every key in `keys` has a slot, fetching the new ones.
    ///
    /// `fetch` runs at most once, with exactly the keys that had no slot.
    /// Failures are delivered through the slots, to every waiter.
    pub async fn add<I, F, Fut>(&self, keys: I, fetch: F)
    where
        I: IntoIterator<Item = K>,
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = CacheResult<HashMap<K, V>>>,
    {
        let mut in_flight = InFlight {
            cache: self.name,
            slots: Vec::new(),
        };
        {
            let mut slots = self.slots();
            for key in keys {
                if slots.contains_key(&key) {
                    continue;
                }
                let slot = Deferred::pending();
                slots.insert(key.clone(), slot.clone());
                in_flight.slots.push((key, slot));
            }
        }
        if in_flight.slots.is_empty() {
            trace!(cache = self.name, "all keys already cached");
            return;
        }

        let requested: Vec<K> = in_flight.slots.iter().map(|(key, _)| key.clone()).collect();
        debug!(cache = self.name, keys = requested.len(), "coalesced fetch");

        match fetch(requested).await {
            Ok(mut found) => {
                for (key, slot) in in_flight.slots.drain(..) {
                    match found.remove(&key) {
                        Some(value) => {
                            slot.resolve(value);
                        }
                        None => match &self.default {
                            Some(default) => {
                                slot.resolve(default(&key));
                            }
                            None => {
                                slot.reject(CacheError::MissingRequiredKey {
                                    cache: self.name,
                                    key: format!("{key:?}"),
                                });
                            }
                        },
                    }
                }
            }
            Err(err) => {
                warn!(cache = self.name, error = %err, "fetch failed");
                for (_, slot) in in_flight.slots.drain(..) {
                    slot.reject(err.clone());
                }
            }
        }
    }

    /// [`add`](Self::add) the keys, then wait for each of them in order.
    pub async fn fetch_many<F, Fut>(&self, keys: &[K], fetch: F) -> CacheResult<Vec<V>>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = CacheResult<HashMap<K, V>>>,
    {
        self.add(keys.iter().cloned(), fetch).await;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Resolve `key` to `value`.
    ///
    /// A pending (or failed) slot is resolved in place, so its waiters see
    /// `value` and a fetch still in flight is discarded. A slot that already
    /// holds a value is replaced; earlier waiters keep what they received.
    pub fn set(&self, key: K, value: V) {
        let mut slots = self.slots();
        match slots.get(&key) {
            Some(slot) if slot.resolve(value.clone()) => {}
            _ => {
                slots.insert(key, Deferred::resolved(value));
            }
        }
    }

    /// Resolve the slot for `key` if it has no value yet. Unlike
    /// [`set`](Self::set) this never replaces a value or creates a slot.
    pub fn fill(&self, key: &K, value: V) -> bool {
        let slot = self.slots().get(key).cloned();
        slot.is_some_and(|slot| slot.resolve(value))
    }

    /// Drop the slot for `key` so the next request starts a fresh fetch.
    ///
    /// A fetch already in flight is not cancelled; its result lands in the
    /// orphaned slot only.
    pub fn invalidate(&self, key: &K) -> bool {
        self.slots().remove(key).is_some()
    }

    /// Drop every resolved entry matching `pred`, and every failed entry,
    /// returning the evicted keys. Pending slots are left alone.
    ///
    /// A failed slot cannot say what it would have read, so any invalidation
    /// clears it and the next request retries.
    pub fn invalidate_where(&self, pred: impl Fn(&K, &V) -> bool) -> Vec<K> {
        let mut evicted = Vec::new();
        self.slots().retain(|key, slot| {
            let evict = match slot.peek() {
                Some(value) => pred(key, &value),
                None => slot.is_rejected(),
            };
            if evict {
                evicted.push(key.clone());
            }
            !evict
        });
        if !evicted.is_empty() {
            debug!(cache = self.name, evicted = evicted.len(), "invalidated entries");
        }
        evicted
    }

    pub fn clear(&self) {
        self.slots().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn squares(keys: Vec<u32>) -> HashMap<u32, u32> {
        keys.into_iter().map(|k| (k, k * k)).collect()
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let cache: CoalescingCache<u32, u32> = CoalescingCache::new("test");
        assert!(matches!(
            cache.get(&1).await,
            Err(CacheError::UnknownKey { cache: "test", .. })
        ));
    }

    #[tokio::test]
    async fn test_add_fetches_only_new_keys() {
        let cache = CoalescingCache::new("test");
        let requested = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requested);
        cache
            .add([1, 2], |keys| async move {
                log.lock().unwrap().push(keys.clone());
                Ok(squares(keys))
            })
            .await;
        let log = Arc::clone(&requested);
        cache
            .add([2, 3], |keys| async move {
                log.lock().unwrap().push(keys.clone());
                Ok(squares(keys))
            })
            .await;

        assert_eq!(*requested.lock().unwrap(), vec![vec![1, 2], vec![3]]);
        assert_eq!(cache.get(&3).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_concurrent_adds_share_one_fetch() {
        let cache = CoalescingCache::new("test");
        let calls = AtomicUsize::new(0);
        let fetch = |keys: Vec<u32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                Ok(squares(keys))
            }
        };

        let (a, b) = tokio::join!(
            cache.fetch_many(&[4, 5], fetch),
            cache.fetch_many(&[4, 5], fetch)
        );
        assert_eq!(a.unwrap(), vec![16, 25]);
        assert_eq!(b.unwrap(), vec![16, 25]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_key_uses_default_or_rejects() {
        let strict: CoalescingCache<u32, u32> = CoalescingCache::new("strict");
        strict.add([1], |_| async { Ok(HashMap::new()) }).await;
        assert!(matches!(
            strict.get(&1).await,
            Err(CacheError::MissingRequiredKey { .. })
        ));

        let lenient = CoalescingCache::with_default("lenient", |k: &u32| k + 100);
        lenient.add([1], |_| async { Ok(HashMap::new()) }).await;
        assert_eq!(lenient.get(&1).await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_set_beats_slower_fetch() {
        let cache = CoalescingCache::new("test");
        let (_, value) = tokio::join!(
            cache.add([7], |keys| async move {
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                Ok(keys.into_iter().map(|k| (k, "fetched")).collect())
            }),
            async {
                tokio::task::yield_now().await;
                cache.set(7, "set");
                cache.get(&7).await
            }
        );
        assert_eq!(value.unwrap(), "set");
        assert_eq!(cache.get(&7).await.unwrap(), "set");
    }

    #[tokio::test]
    async fn test_set_overwrites_resolved_slot() {
        let cache = CoalescingCache::new("test");
        cache.set(1, "old");
        cache.set(1, "new");
        assert_eq!(cache.get(&1).await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_invalidate_then_refetch() {
        let cache = CoalescingCache::new("test");
        let calls = AtomicUsize::new(0);
        let fetch = |keys: Vec<u32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(squares(keys)) }
        };

        cache.fetch_many(&[2], fetch).await.unwrap();
        cache.fetch_many(&[2], fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(cache.invalidate(&2));
        assert!(!cache.is_cached(&2));
        cache.fetch_many(&[2], fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_reaches_every_waiter() {
        let cache: CoalescingCache<u32, u32> = CoalescingCache::new("test");
        cache
            .add([1, 2], |_| async {
                Err(CacheError::Store(StoreError::Unavailable {
                    reason: "offline".to_string(),
                }))
            })
            .await;
        assert!(matches!(cache.get(&1).await, Err(CacheError::Store(_))));
        assert!(matches!(cache.get(&2).await, Err(CacheError::Store(_))));

        cache.set(1, 10);
        assert_eq!(cache.get(&1).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_invalidate_where_only_touches_matches() {
        let cache = CoalescingCache::new("test");
        cache.set(1, 1);
        cache.set(2, 20);
        cache.set(3, 30);
        let mut evicted = cache.invalidate_where(|_, v| *v >= 20);
        evicted.sort();
        assert_eq!(evicted, vec![2, 3]);
        assert_eq!(cache.peek(&1), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_where_drops_failed_slots() {
        let cache: CoalescingCache<u32, u32> = CoalescingCache::new("test");
        cache.set(1, 10);
        cache
            .add([2], |_| async {
                Err(CacheError::Store(StoreError::Unavailable {
                    reason: "offline".to_string(),
                }))
            })
            .await;
        assert!(cache.is_cached(&2));

        let evicted = cache.invalidate_where(|_, _| false);
        assert_eq!(evicted, vec![2]);
        assert!(!cache.is_cached(&2));
        assert_eq!(cache.peek(&1), Some(10));
    }

    #[tokio::test]
    async fn test_dropped_fetch_abandons_slot() {
        let cache: CoalescingCache<u32, u32> = CoalescingCache::new("test");
        {
            let fut = cache.add([1], |_| futures::future::pending());
            futures::pin_mut!(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
        }
        assert!(matches!(
            cache.get(&1).await,
            Err(CacheError::Abandoned { .. })
        ));
    }
}
