//! An async-safe layer on top of [`crate::lru_cache::LruCache`]. Supports
//! multiple concurrent requests to the same key without duplicating the
//! fetch.

use anyhow::Error;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::broadcast::BroadcastFuture;
use crate::lru_cache::LruCache;

/// Interface for asynchronously getting values on cache misses.
pub trait AsyncCacher<K, V: Clone>: Sync + Send {
    /// Fetch a value for key on cache miss.
    ///
    /// Works like [`crate::lru_cache::Cacher`], except if the key has
    /// already been requested and the result is not cached yet, `fetch` is
    /// not called again: the original request's result is cloned and
    /// returned to every concurrent caller once it resolves.
    fn fetch(&self, key: K) -> Box<dyn Future<Output = Result<Option<V>, Error>> + Send>;
}

/// Async-safe LRU cache, deduplicating concurrent misses via
/// [`BroadcastFuture`].
#[derive(Clone)]
pub struct AsyncLruCache<K, V> {
    #[allow(clippy::type_complexity)]
    maps: Arc<Mutex<(LruCache<K, V>, HashMap<K, BroadcastFuture<Option<V>>>)>>,
}

impl<K: std::cmp::Eq + std::hash::Hash + Copy, V: Clone + Send + 'static> AsyncLruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            maps: Arc::new(Mutex::new((LruCache::new(capacity), HashMap::new()))),
        }
    }

    /// Access an item, either from the cache or by calling `cacher.fetch`.
    /// `Ok(None)` means the key has no representation; `Err(_)` means a
    /// call to `fetch` failed, whether initiated by this call or a
    /// concurrent one.
    pub async fn access(&self, key: K, cacher: &dyn AsyncCacher<K, V>) -> Result<Option<V>, Error> {
        let (owner, result_fut) = {
            let mut maps = self.maps.lock().unwrap();
            if let Some(fut) = maps.1.get(&key) {
                (false, fut.listen())
            } else {
                if let Some(val) = maps.0.get_mut(key) {
                    return Ok(Some(val.clone()));
                }

                let fut = cacher.fetch(key);
                let broadcast = BroadcastFuture::new(fut);
                let result_fut = broadcast.listen();
                maps.1.insert(key, broadcast);
                (true, result_fut)
            }
            // drop the lock before awaiting
        };

        let result = result_fut.await;

        if owner {
            let mut maps = self.maps.lock().unwrap();
            if let Ok(Some(ref value)) = result {
                maps.0.insert(key, value.clone());
            }
            maps.1.remove(&key);
        }

        result
    }

    /// Drop a single key from the cache, forcing the next `access` to
    /// re-fetch. Used by callers that need point invalidation (e.g. the
    /// chunk location cache) without tearing down the whole structure.
    pub fn remove(&self, key: K) {
        let mut maps = self.maps.lock().unwrap();
        maps.0.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestAsyncCacher {
        prefix: &'static str,
    }

    impl AsyncCacher<i32, String> for TestAsyncCacher {
        fn fetch(&self, key: i32) -> Box<dyn Future<Output = Result<Option<String>, Error>> + Send> {
            let x = self.prefix;
            Box::new(async move { Ok(Some(format!("{}{}", x, key))) })
        }
    }

    #[tokio::test]
    async fn concurrent_misses_on_one_key_share_a_single_fetch() {
        let cacher = TestAsyncCacher { prefix: "x" };
        let cache: AsyncLruCache<i32, String> = AsyncLruCache::new(2);

        assert_eq!(cache.access(10, &cacher).await.unwrap(), Some("x10".into()));
        assert_eq!(cache.access(20, &cacher).await.unwrap(), Some("x20".into()));

        let mut handles = vec![];
        for _ in 0..10 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move {
                let cacher = TestAsyncCacher { prefix: "y" };
                c.access(40, &cacher).await.unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some("y40".into()));
        }
    }

    #[tokio::test]
    async fn remove_forces_refetch() {
        let cacher = TestAsyncCacher { prefix: "a" };
        let cache: AsyncLruCache<i32, String> = AsyncLruCache::new(2);
        assert_eq!(cache.access(1, &cacher).await.unwrap(), Some("a1".into()));
        cache.remove(1);
        let cacher2 = TestAsyncCacher { prefix: "b" };
        assert_eq!(cache.access(1, &cacher2).await.unwrap(), Some("b1".into()));
    }
}
