//! Single-flight memoized fetch
//!
//! [`SingleFlightCache`] lazily populates one value per key. The first caller
//! for a key starts the fetch; every concurrent caller awaits that same
//! in-flight future, so the fetch runs at most once no matter how many tasks
//! race for it. Successful results are kept until [`SingleFlightCache::invalidate`];
//! failures are handed to every waiter of that attempt and then dropped, so
//! the next caller retries.
//!
//! # Example
//!
//! ```rust,no_run
//! use sessionkit::cache::SingleFlightCache;
//!
//! # async fn example() -> Result<(), sessionkit::AuthError> {
//! let cache: SingleFlightCache<&'static str, u32> = SingleFlightCache::new();
//! let value = cache.get_or_fetch("answer", || async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::AuthResult;

type InFlight<V> = Shared<BoxFuture<'static, AuthResult<V>>>;

enum Slot<V> {
    Ready(V),
    Pending { generation: u64, fetch: InFlight<V> },
}

/// Concurrency-safe lazily populated cache with one in-flight fetch per key
pub struct SingleFlightCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    generation: AtomicU64,
}

impl<K, V> fmt::Debug for SingleFlightCache<K, V>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        let mut map = f.debug_map();
        for (key, slot) in slots.iter() {
            let state = match slot {
                Slot::Ready(_) => "ready",
                Slot::Pending { .. } => "pending",
            };
            map.entry(key, &state);
        }
        map.finish()
    }
}

impl<K, V> Default for SingleFlightCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, fetching it if needed.
    ///
    /// `fetch` is only invoked when no value is cached and no fetch is in
    /// flight for `key`. Callers that arrive while a fetch is running wait for
    /// it and observe the same result.
    ///
    /// # Errors
    ///
    /// Returns whatever error the in-flight fetch produced. Errors are not
    /// cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> AuthResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<V>> + Send + 'static,
    {
        let (generation, in_flight) = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Pending { generation, fetch }) => {
                    trace!(generation, "joining in-flight fetch");
                    (*generation, fetch.clone())
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let in_flight = fetch().boxed().shared();
                    slots.insert(
                        key.clone(),
                        Slot::Pending {
                            generation,
                            fetch: in_flight.clone(),
                        },
                    );
                    trace!(generation, "started fetch");
                    (generation, in_flight)
                }
            }
        };

        let result = in_flight.await;

        // The first waiter to wake settles the slot. The generation check keeps
        // a stale attempt from overwriting a slot that was invalidated and
        // refilled in the meantime.
        let mut slots = self.slots.lock();
        if let Some(Slot::Pending {
            generation: current,
            ..
        }) = slots.get(&key)
            && *current == generation
        {
            match &result {
                Ok(value) => {
                    slots.insert(key, Slot::Ready(value.clone()));
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }

        result
    }

    /// Cached value for `key`, without fetching
    pub fn peek(&self, key: &K) -> Option<V> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Drop the cached value (or in-flight fetch) for `key`.
    ///
    /// Callers already waiting on an in-flight fetch still receive its result.
    pub fn invalidate(&self, key: &K) {
        self.slots.lock().remove(key);
    }

    /// Drop every cached value
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
