// Copyright 2023-2024 The Ledger Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A self-populating LRU cache.
//!
//! Callers provide a generator for missing values. Concurrent `get`s for the
//! same missing key coalesce onto a single in-flight generator call: the
//! first caller runs the generator, the others wait for its result. Failed
//! generations are reported to every waiter and are not cached.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;

use clru::CLruCache;
use futures::channel::oneshot;

struct Inner<K: Hash + Eq, V, E> {
    values: CLruCache<K, V>,
    // Waiters for keys with a generator call in flight. Presence of a key
    // marks the in-flight state even with no waiters yet.
    pending: HashMap<K, Vec<oneshot::Sender<Result<V, E>>>>,
}

/// A keyed cache of at most `capacity` values with coalesced population.
pub struct LruCache<K: Hash + Eq, V, E> {
    inner: Arc<Mutex<Inner<K, V, E>>>,
}

impl<K, V, E> LruCache<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: Clone,
{
    /// Creates a cache holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                values: CLruCache::new(NonZeroUsize::new(capacity).unwrap()),
                pending: HashMap::new(),
            })),
        }
    }

    /// Retrieves the value for `key`, invoking `generator` if it is neither
    /// cached nor already being generated.
    pub async fn get<F, Fut>(&self, key: K, mut generator: F) -> Result<V, E>
    where
        F: FnMut(K) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        loop {
            let receiver = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(value) = inner.values.get(&key) {
                    return Ok(value.clone());
                }
                match inner.pending.get_mut(&key) {
                    Some(waiters) => {
                        let (sender, receiver) = oneshot::channel();
                        waiters.push(sender);
                        Some(receiver)
                    }
                    None => {
                        inner.pending.insert(key.clone(), vec![]);
                        None
                    }
                }
            };

            match receiver {
                Some(receiver) => {
                    match receiver.await {
                        Ok(result) => return result,
                        // The generating caller went away; retry, possibly
                        // becoming the generator ourselves.
                        Err(oneshot::Canceled) => continue,
                    }
                }
                None => {
                    let mut guard = PendingGuard {
                        inner: &self.inner,
                        key: Some(key.clone()),
                    };
                    let result = generator(key.clone()).await;

                    let waiters = {
                        let mut inner = self.inner.lock().unwrap();
                        if let Ok(value) = &result {
                            inner.values.put(key.clone(), value.clone());
                        }
                        inner.pending.remove(&key).unwrap_or_default()
                    };
                    guard.disarm();
                    for waiter in waiters {
                        waiter.send(result.clone()).ok();
                    }
                    return result;
                }
            }
        }
    }

    /// Drops the cached value for `key`, if any.
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.values.pop(key);
    }

    /// The resident keys, most recently used first. For tests.
    pub fn resident_keys(&self) -> Vec<K> {
        let inner = self.inner.lock().unwrap();
        inner.values.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    /// Whether the cache holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Clears the in-flight marker if the generating future is dropped before
// completion. Dropping the waiters' senders makes them retry instead of
// hanging on a generation that will never finish.
struct PendingGuard<'a, K: Hash + Eq, V, E> {
    inner: &'a Mutex<Inner<K, V, E>>,
    key: Option<K>,
}

impl<K: Hash + Eq, V, E> PendingGuard<'_, K, V, E> {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<K: Hash + Eq, V, E> Drop for PendingGuard<'_, K, V, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(&key);
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone, E: Clone> Debug for LruCache<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("LruCache").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use futures::FutureExt as _;
    use pollster::FutureExt as _;

    use super::*;

    #[test]
    fn test_cached_value_is_returned() {
        let cache: LruCache<u32, String, u32> = LruCache::new(10);
        let calls = AtomicUsize::new(0);
        let generator = |key: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("value-{key}")) }
        };

        assert_eq!(cache.get(1, generator).block_on(), Ok("value-1".to_string()));
        assert_eq!(cache.get(1, generator).block_on(), Ok("value-1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache: LruCache<u32, String, u32> = LruCache::new(10);
        let calls = AtomicUsize::new(0);
        let generator = |_key: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(42u32) }
        };

        assert_eq!(cache.get(1, generator).block_on(), Err(42));
        assert_eq!(cache.get(1, generator).block_on(), Err(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache: LruCache<u32, u32, u32> = LruCache::new(3);
        let generator = |key: u32| async move { Ok::<_, u32>(key * 10) };

        for key in [1, 2, 3] {
            cache.get(key, generator).block_on().unwrap();
        }
        // Touch 1 so that 2 becomes the least recently used.
        cache.get(1, generator).block_on().unwrap();
        cache.get(4, generator).block_on().unwrap();

        let mut resident = cache.resident_keys();
        resident.sort_unstable();
        assert_eq!(resident, vec![1, 3, 4]);
    }

    #[test]
    fn test_concurrent_gets_coalesce() {
        let cache: LruCache<u32, String, u32> = LruCache::new(10);
        let calls = AtomicUsize::new(0);
        let (unblock_sender, unblock_receiver) = oneshot::channel::<()>();

        let mut unblock_receiver = Some(unblock_receiver);
        let first = cache.get(7, |key: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            let receiver = unblock_receiver.take().unwrap();
            async move {
                receiver.await.unwrap();
                Ok(format!("value-{key}"))
            }
        });
        futures::pin_mut!(first);
        // Start the generator; it blocks on the channel.
        assert!(first.as_mut().now_or_never().is_none());

        let second = cache.get(7, |key: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("wrong-{key}")) }
        });
        futures::pin_mut!(second);
        // The second caller coalesces onto the in-flight generation.
        assert!(second.as_mut().now_or_never().is_none());

        unblock_sender.send(()).unwrap();
        assert_eq!(first.block_on(), Ok("value-7".to_string()));
        assert_eq!(second.block_on(), Ok("value-7".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_generator_unblocks_waiters() {
        let cache: LruCache<u32, u32, u32> = LruCache::new(10);

        {
            let stalled = cache.get(1, |_key| std::future::pending::<Result<u32, u32>>());
            futures::pin_mut!(stalled);
            assert!(stalled.as_mut().now_or_never().is_none());
            // Dropping the generating future clears the in-flight marker.
        }

        let value = cache
            .get(1, |key| async move { Ok::<_, u32>(key + 100) })
            .block_on();
        assert_eq!(value, Ok(101));
    }
}
