use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime};

use tracing::Instrument;
use tracing::instrument::Instrumented;

use crate::config::CacheConfig;

use super::single_flight::SingleFlight;
use super::{CacheEntry, CacheError, CacheName};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem<T> {
    /// When to evict this item. `None` keeps it until it is invalidated or pushed out by the
    /// capacity bound.
    deadline: Option<Instant>,
    /// When the item was installed.
    installed: SystemTime,
    /// The value, or the reason it does not exist.
    data: CacheEntry<T>,
}

type InMemoryCache<K, T> = moka::sync::Cache<K, InMemoryItem<T>>;

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the explicit
/// expiration time.
struct CacheExpiration;

/// Returns the duration between `current_time` and `target_time`, or zero if the target has
/// already passed.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Duration {
    target_time
        .checked_duration_since(current_time)
        .unwrap_or_default()
}

impl<K, T> moka::Expiry<K, InMemoryItem<T>> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &InMemoryItem<T>,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| saturating_duration_since(current_time, deadline))
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &InMemoryItem<T>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| saturating_duration_since(current_time, deadline))
    }
}

/// Memoizes asynchronously computed values per key.
///
/// Concurrent requests for a missing key are coalesced into a single computation, see
/// [`compute_memoized`](Self::compute_memoized). Results are remembered according to their
/// outcome:
///
/// - `Ok` values are kept for `max_age`.
/// - [`CacheError::NotFound`] is kept as a negative entry for `retry_misses_after`. Later
///   lookups fail with the stored reason without recomputing.
/// - All other errors are handed to the waiters and then dropped, so the next lookup retries.
///
/// The internal locks are only held for map operations, never while a computation runs.
pub struct Cacher<K, T> {
    name: CacheName,
    config: CacheConfig,
    cache: InMemoryCache<K, T>,
    flights: SingleFlight<K, CacheEntry<T>>,
}

impl<K, T> Clone for Cacher<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            config: self.config,
            cache: self.cache.clone(),
            flights: self.flights.clone(),
        }
    }
}

impl<K, T> fmt::Debug for Cacher<K, T>
where
    K: Hash + Eq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cacher")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("in-memory items", &self.cache.entry_count())
            .field("flights", &self.flights)
            .finish()
    }
}

impl<K, T> Cacher<K, T>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: CacheName, config: CacheConfig) -> Self {
        let mut builder = InMemoryCache::builder()
            .name(name.as_ref())
            .expire_after(CacheExpiration);
        if let Some(capacity) = config.in_memory_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            name,
            config,
            cache: builder.build(),
            flights: SingleFlight::new(),
        }
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Returns the memoized entry for `key`, computing it with `populate` if necessary.
    ///
    /// A present value or a negative entry is returned without invoking `populate`. Otherwise
    /// the caller attaches to the pending computation for `key`, starting one if there is none.
    /// The computation runs in its own task, so dropping the returned future only detaches this
    /// caller.
    pub async fn compute_memoized<F, Fut>(&self, key: K, populate: F) -> CacheEntry<T>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1, "cache" => self.name.as_ref());

        if let Some(data) = self.lookup(&key) {
            return data;
        }

        let recheck_key = key.clone();
        let joined = self.flights.run_with(
            key,
            || self.lookup_quiet(&recheck_key),
            |key| self.populate(key, populate),
            installer(self.cache.clone(), self.config, self.name, Install::Always),
        );
        self.finish(joined.await)
    }

    /// Recomputes `key` even if a value is present.
    ///
    /// A computation that is already pending is joined instead of starting a second one.
    /// A present value is only replaced by another value: if the recomputation ends in
    /// [`CacheError::NotFound`], the caller gets the miss but the present value stays.
    pub async fn refresh<F, Fut>(&self, key: K, populate: F) -> CacheEntry<T>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1, "cache" => self.name.as_ref());

        let joined = self.flights.run_with(
            key,
            || None,
            |key| self.populate(key, populate),
            installer(self.cache.clone(), self.config, self.name, Install::KeepPresent),
        );
        self.finish(joined.await)
    }

    /// Returns the value for `key` if it is present. Never starts a computation.
    pub fn peek(&self, key: &K) -> Option<T> {
        self.cache.get(key).and_then(|item| item.data.ok())
    }

    /// Returns whatever is stored for `key`, including negative entries.
    pub fn peek_entry(&self, key: &K) -> Option<CacheEntry<T>> {
        self.cache.get(key).map(|item| item.data)
    }

    /// Like [`peek_entry`](Self::peek_entry), along with the time the entry was installed.
    pub fn peek_dated(&self, key: &K) -> Option<(CacheEntry<T>, SystemTime)> {
        self.cache.get(key).map(|item| (item.data, item.installed))
    }

    /// Removes the entry for `key`.
    ///
    /// A computation pending for `key` keeps running and its waiters still receive the result,
    /// but the result is not installed. The next lookup starts over.
    pub fn invalidate(&self, key: &K) {
        metric!(counter("caches.invalidated") += 1, "cache" => self.name.as_ref());
        self.cache.invalidate(key);
        self.flights.forget(key);
    }

    /// Removes all entries and detaches all pending computations.
    pub fn invalidate_all(&self) {
        metric!(counter("caches.invalidated") += 1, "cache" => self.name.as_ref());
        self.cache.invalidate_all();
        self.flights.forget_all();
    }

    /// All values that are currently present, in no particular order.
    pub fn values(&self) -> Vec<T> {
        self.cache
            .iter()
            .filter_map(|(_, item)| item.data.ok())
            .collect()
    }

    /// Number of live entries, negative ones included.
    pub fn len(&self) -> usize {
        self.cache.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a pending computation.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    fn lookup(&self, key: &K) -> Option<CacheEntry<T>> {
        let data = self.lookup_quiet(key)?;
        match data {
            Ok(_) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => self.name.as_ref());
            }
            Err(_) => {
                metric!(counter("caches.negative.hit") += 1, "cache" => self.name.as_ref());
            }
        }
        Some(data)
    }

    fn lookup_quiet(&self, key: &K) -> Option<CacheEntry<T>> {
        self.cache.get(key).map(|item| item.data)
    }

    fn populate<F, Fut>(&self, key: K, populate: F) -> Instrumented<Fut>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let name = self.name;
        metric!(counter("caches.computation") += 1, "cache" => name.as_ref());
        tracing::trace!(cache = %name, ?key, "Computing cache entry");

        let span = tracing::debug_span!("compute", cache = %name, key = ?key);
        populate(key).instrument(span)
    }

    fn finish(&self, joined: Result<CacheEntry<T>, super::Abandoned>) -> CacheEntry<T> {
        joined.unwrap_or_else(|e| {
            tracing::error!(cache = %self.name, error = &e as &dyn std::error::Error);
            Err(CacheError::InternalError)
        })
    }
}

/// Whether a finished computation may overwrite a present value with a negative entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    Always,
    KeepPresent,
}

/// Builds the hook that installs a finished computation according to its outcome.
fn installer<K, T>(
    cache: InMemoryCache<K, T>,
    config: CacheConfig,
    name: CacheName,
    install: Install,
) -> impl FnOnce(&K, &CacheEntry<T>) + Send + 'static
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    move |key, data| {
        let ttl = match data {
            Ok(_) => config.max_age,
            Err(err) if err.is_negative() => {
                let present = cache.get(key).is_some_and(|item| item.data.is_ok());
                if install == Install::KeepPresent && present {
                    tracing::debug!(cache = %name, ?key, "Keeping present value over miss");
                    return;
                }
                config.retry_misses_after
            }
            Err(err) => {
                metric!(
                    counter("caches.computation.error") += 1,
                    "cache" => name.as_ref(),
                    "error" => err.metrics_tag(),
                );
                tracing::debug!(
                    cache = %name,
                    ?key,
                    error = %err,
                    "Not caching failed computation"
                );
                return;
            }
        };
        let item = InMemoryItem {
            deadline: ttl.map(|ttl| Instant::now() + ttl),
            installed: SystemTime::now(),
            data: data.clone(),
        };
        cache.insert(key.clone(), item);
    }
}
