use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use gold_config::CacheConfig;

use crate::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// A refresh overran its wait; this is the last good value.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    pub value: V,
    pub freshness: Freshness,
}

impl<V> Cached<V> {
    fn fresh(value: V) -> Self {
        Self {
            value,
            freshness: Freshness::Fresh,
        }
    }

    fn stale(value: V) -> Self {
        Self {
            value,
            freshness: Freshness::Stale,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

/// Bounded LRU cache with a TTL and a bounded wait on refreshes.
///
/// A refresh that outlives `refresh_timeout` keeps running and stores its
/// result for later readers; the caller gets the previous value marked stale.
/// Without a previous value the caller waits for the refresh. A refresh that
/// started before an `invalidate` stores its result already stale.
pub struct RefreshCache<K, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    ttl: Duration,
    refresh_timeout: Duration,
}

impl<K, V> Clone for RefreshCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            ttl: self.ttl,
            refresh_timeout: self.refresh_timeout,
        }
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    in_flight: HashSet<K>,
    capacity: usize,
    tick: u64,
    /// Bumped by every `invalidate`.
    generation: u64,
}

struct CacheEntry<V> {
    value: V,
    loaded_at: Instant,
    last_used: u64,
    invalidated: bool,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Stores `value` loaded as of `generation`; older generations land
    /// invalidated.
    fn insert(&mut self, key: K, value: V, generation: u64) {
        if self.capacity == 0 {
            return;
        }

        let last_used = self.next_tick();
        let invalidated = generation != self.generation;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                loaded_at: Instant::now(),
                last_used,
                invalidated,
            },
        );

        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Clears a key's in-flight mark when the refresh task ends, even by panic.
struct InFlight<K: Eq + Hash, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    key: K,
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Stores the refreshed value; false when an `invalidate` overtook it.
    fn store(&self, value: V, generation: u64) -> bool {
        let mut state = lock(&self.state);
        state.insert(self.key.clone(), value, generation);
        state.generation == generation
    }
}

impl<K: Eq + Hash, V> Drop for InFlight<K, V> {
    fn drop(&mut self) {
        lock(&self.state).in_flight.remove(&self.key);
    }
}

impl<K, V> RefreshCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(capacity: usize, ttl: Duration, refresh_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashSet::new(),
                capacity,
                tick: 0,
                generation: 0,
            })),
            ttl,
            refresh_timeout,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.capacity,
            Duration::from_secs(config.ttl_secs),
            Duration::from_millis(config.refresh_timeout_ms),
        )
    }

    /// Returns the cached value, marked stale once expired or invalidated.
    pub fn peek(&self, key: &K) -> Option<Cached<V>> {
        let mut state = lock(&self.state);
        let tick = state.next_tick();
        let ttl = self.ttl;
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(if is_expired(entry, ttl) {
            Cached::stale(entry.value.clone())
        } else {
            Cached::fresh(entry.value.clone())
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let mut state = lock(&self.state);
        let generation = state.generation;
        state.insert(key, value, generation);
    }

    /// Expires every entry, including those of refreshes still running; they
    /// remain available as stale fallbacks.
    pub fn invalidate(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        for entry in state.entries.values_mut() {
            entry.invalidated = true;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn get_or_refresh<F>(&self, key: K, refresh: F) -> Result<Cached<V>, AnalysisError>
    where
        F: FnOnce() -> Result<V, AnalysisError> + Send + 'static,
    {
        let (stale, already_refreshing, generation) = {
            let mut state = lock(&self.state);
            let tick = state.next_tick();
            let stale = match state.entries.get_mut(&key) {
                Some(entry) if !is_expired(entry, self.ttl) => {
                    entry.last_used = tick;
                    return Ok(Cached::fresh(entry.value.clone()));
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            };
            let already_refreshing = !state.in_flight.insert(key.clone());
            (stale, already_refreshing, state.generation)
        };

        if already_refreshing {
            if let Some(value) = stale {
                return Ok(Cached::stale(value));
            }
        }

        let in_flight = InFlight {
            state: Arc::clone(&self.state),
            key,
        };
        let handle = tokio::task::spawn_blocking(move || -> Result<Cached<V>, AnalysisError> {
            let value = refresh()?;
            Ok(if in_flight.store(value.clone(), generation) {
                Cached::fresh(value)
            } else {
                Cached::stale(value)
            })
        });

        let Some(stale) = stale else {
            return join_refresh(handle.await);
        };

        match tokio::time::timeout(self.refresh_timeout, handle).await {
            Ok(joined) => join_refresh(joined),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.refresh_timeout.as_millis() as u64,
                    "cache refresh exceeded its wait, serving stale value"
                );
                Ok(Cached::stale(stale))
            }
        }
    }
}

fn is_expired<V>(entry: &CacheEntry<V>, ttl: Duration) -> bool {
    entry.invalidated || entry.loaded_at.elapsed() >= ttl
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_refresh<V>(
    joined: Result<Result<V, AnalysisError>, tokio::task::JoinError>,
) -> Result<V, AnalysisError> {
    joined.map_err(|err| AnalysisError::Cache(format!("refresh task failed: {err}")))?
}
