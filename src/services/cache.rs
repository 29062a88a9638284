//! Auto-expiring concurrent cache.
//!
//! A TTL map whose entries are garbage collected by a background sweep. The
//! sweep never drops an entry on its own: it asks a caller-supplied
//! [`CacheEvictor`], which may veto the removal (e.g. because an in-flight
//! transaction owns the entry, or because the write-back to durable storage
//! failed). Vetoed entries get a fresh lifetime and stay readable.
//!
//! Readers racing an eviction either complete before it or observe
//! `EntryBeingDeleted`; entries can also be pinned to exempt them from
//! expiry while a logged operation is in flight.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::error::{BudgetError, BudgetResult};

/// Decides whether an expired entry may actually be removed.
#[async_trait]
pub trait CacheEvictor<K, V>: Send + Sync {
    /// Returns true to allow removal; false re-arms the entry's lifetime.
    async fn on_before_eviction(&self, key: &K, value: &Arc<V>) -> bool;
}

struct CacheEntry<V> {
    value: Arc<V>,
    expires_at: Mutex<Instant>,
    pinned: AtomicBool,
    being_deleted: AtomicBool,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value: Arc::new(value),
            expires_at: Mutex::new(Instant::now() + ttl),
            pinned: AtomicBool::new(false),
            being_deleted: AtomicBool::new(false),
        }
    }

    fn extend(&self, ttl: Duration) {
        *self.expires_at.lock().unwrap() = Instant::now() + ttl;
    }

    fn is_expired(&self) -> bool {
        *self.expires_at.lock().unwrap() <= Instant::now()
    }
}

/// Concurrent map with per-entry expiry and veto-able garbage collection.
pub struct AutoExpiryCache<K, V> {
    entries: DashMap<K, Arc<CacheEntry<V>>>,
    ttl: Duration,
}

impl<K, V> AutoExpiryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Looks up the entry, inserting one built by `factory` when absent.
    /// Returns the value and whether it was freshly inserted. Access extends
    /// the entry's lifetime.
    pub fn get_or_insert_with(
        &self,
        key: K,
        factory: impl FnOnce() -> V,
    ) -> BudgetResult<(Arc<V>, bool)> {
        let mut inserted = false;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| {
                inserted = true;
                Arc::new(CacheEntry::new(factory(), self.ttl))
            })
            .value()
            .clone();

        if entry.being_deleted.load(Ordering::SeqCst) {
            return Err(BudgetError::EntryBeingDeleted);
        }
        entry.extend(self.ttl);
        Ok((entry.value.clone(), inserted))
    }

    /// Looks up an entry without inserting. Access extends its lifetime.
    pub fn get(&self, key: &K) -> BudgetResult<Option<Arc<V>>> {
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if entry.being_deleted.load(Ordering::SeqCst) {
            return Err(BudgetError::EntryBeingDeleted);
        }
        entry.extend(self.ttl);
        Ok(Some(entry.value.clone()))
    }

    /// Exempts the entry from expiry until unpinned.
    pub fn pin(&self, key: &K) {
        if let Some(entry) = self.entries.get(key) {
            entry.pinned.store(true, Ordering::SeqCst);
        }
    }

    /// Makes the entry evictable again, with a fresh lifetime.
    pub fn unpin(&self, key: &K) {
        if let Some(entry) = self.entries.get(key) {
            entry.pinned.store(false, Ordering::SeqCst);
            entry.extend(self.ttl);
        }
    }

    /// Removes an entry unconditionally, bypassing the evictor. Used by
    /// journal replay.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.remove(key).map(|(_, entry)| entry.value.clone())
    }

    /// Snapshot of all live entries.
    pub fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .iter()
            .filter(|e| !e.value().being_deleted.load(Ordering::SeqCst))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs one garbage-collection pass: every expired, unpinned entry is
    /// offered to the evictor and removed when the evictor agrees.
    pub async fn sweep(&self, evictor: &dyn CacheEvictor<K, V>) {
        let expired: Vec<(K, Arc<CacheEntry<V>>)> = self
            .entries
            .iter()
            .filter(|e| {
                !e.value().pinned.load(Ordering::SeqCst)
                    && !e.value().being_deleted.load(Ordering::SeqCst)
                    && e.value().is_expired()
            })
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (key, entry) in expired {
            self.try_evict(&key, &entry, evictor).await;
        }
    }

    /// Offers a single entry to the evictor regardless of expiry. Returns
    /// true when the entry was removed.
    pub async fn evict_now(&self, key: &K, evictor: &dyn CacheEvictor<K, V>) -> bool {
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return false;
        };
        if entry.pinned.load(Ordering::SeqCst)
            || entry.being_deleted.swap(true, Ordering::SeqCst)
        {
            return false;
        }
        self.finish_eviction(key, &entry, evictor).await
    }

    async fn try_evict(
        &self,
        key: &K,
        entry: &Arc<CacheEntry<V>>,
        evictor: &dyn CacheEvictor<K, V>,
    ) {
        // Claim the entry; readers now observe EntryBeingDeleted.
        if entry.being_deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finish_eviction(key, entry, evictor).await;
    }

    async fn finish_eviction(
        &self,
        key: &K,
        entry: &Arc<CacheEntry<V>>,
        evictor: &dyn CacheEvictor<K, V>,
    ) -> bool {
        if evictor.on_before_eviction(key, &entry.value).await {
            self.entries.remove(key);
            debug!(?key, "cache entry evicted");
            true
        } else {
            entry.extend(self.ttl);
            entry.being_deleted.store(false, Ordering::SeqCst);
            debug!(?key, "cache eviction vetoed");
            false
        }
    }

    /// Spawns the periodic sweeper. The task exits when the evictor is
    /// dropped or the returned handle is aborted.
    pub fn spawn_sweeper(
        cache: Arc<Self>,
        evictor: Weak<dyn CacheEvictor<K, V>>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(evictor) = evictor.upgrade() else {
                    break;
                };
                cache.sweep(&*evictor).await;
            }
        })
    }
}
