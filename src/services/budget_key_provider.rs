//! Budget key provider.
//!
//! Auto-expiring cache of budget keys by name, behaving as a write-through
//! cache with journaled side effects: inserting a key appends a
//! load-into-cache record before the key is loaded, and garbage collection
//! appends a delete-from-cache record before the entry is dropped. Replay
//! of those records rebuilds the cache, reconstructing each key under its
//! original id.
//!
//! Provider records are journaled under a fixed component id so recovery
//! can route them before any key exists.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::models::{
    BudgetKeyName, BudgetKeyProviderLogV1, BudgetKeyProviderOperation, CheckpointLog, LoadState,
};
use crate::domain::ports::{JournalService, JournalSubscriber, NoSqlDatabase};
use crate::infrastructure::PbsConfig;

use super::budget_key::BudgetKey;
use super::cache::{AutoExpiryCache, CacheEvictor};
use super::dispatcher::OperationDispatcher;

/// Well-known component id provider records are journaled under.
pub const PROVIDER_COMPONENT_ID: Uuid = Uuid::from_u64_pair(0xFFFF_FFF1, 0x0000_0002);

/// Cache slot pairing a budget key with its loading lifecycle flags.
pub struct BudgetKeyPair {
    pub budget_key: Arc<BudgetKey>,
    pub load_state: LoadState,
}

pub struct BudgetKeyProvider {
    journal: Arc<dyn JournalService>,
    database: Arc<dyn NoSqlDatabase>,
    config: PbsConfig,
    keys: Arc<AutoExpiryCache<BudgetKeyName, BudgetKeyPair>>,
    dispatcher: OperationDispatcher,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BudgetKeyProvider {
    /// Creates the provider and registers it for journal replay under the
    /// well-known provider component id.
    pub fn new(
        journal: Arc<dyn JournalService>,
        database: Arc<dyn NoSqlDatabase>,
        config: &PbsConfig,
    ) -> Arc<Self> {
        let provider = Arc::new(Self {
            journal: journal.clone(),
            database,
            config: config.clone(),
            keys: Arc::new(AutoExpiryCache::new(config.budget_key_ttl())),
            dispatcher: OperationDispatcher::new(
                config.retry_base_delay(),
                config.retry_max_attempts,
            ),
            sweep_interval: config.cache_sweep_interval(),
            sweeper: Mutex::new(None),
        });
        journal.register_subscriber(PROVIDER_COMPONENT_ID, provider.clone());
        provider
    }

    /// Returns the budget key for the name, loading it on first reference.
    ///
    /// The first caller inserts the entry, journals the load record and
    /// performs the load; concurrent callers observe `EntryIsLoading` until
    /// it finishes. A previously failed load hands the loader role to the
    /// next caller.
    pub async fn get_budget_key(&self, name: &BudgetKeyName) -> BudgetResult<Arc<BudgetKey>> {
        let (pair, inserted) = self.keys.get_or_insert_with(name.clone(), || BudgetKeyPair {
            budget_key: BudgetKey::new(
                name.clone(),
                Uuid::new_v4(),
                self.journal.clone(),
                self.database.clone(),
                &self.config,
            ),
            load_state: LoadState::new(),
        })?;

        if pair.load_state.is_loaded() {
            return Ok(pair.budget_key.clone());
        }
        let is_loader = inserted || pair.load_state.try_become_loader();
        if !is_loader {
            return Err(BudgetError::EntryIsLoading);
        }

        self.load_pair_guarded(name, &pair).await?;
        Ok(pair.budget_key.clone())
    }

    /// Starts the eviction sweeper and schedules a background load for any
    /// cached key that is not loaded (e.g. after journal recovery).
    pub fn run(self: &Arc<Self>) {
        for (name, pair) in self.keys.snapshot() {
            if pair.load_state.is_loaded() {
                continue;
            }
            let provider = self.clone();
            tokio::spawn(async move {
                if let Err(err) = provider.load_pair_guarded(&name, &pair).await {
                    warn!(key = %name, error = %err, "background budget key load failed");
                }
            });
        }

        let evictor_arc: Arc<dyn CacheEvictor<BudgetKeyName, BudgetKeyPair>> = self.clone();
        let evictor: Weak<dyn CacheEvictor<BudgetKeyName, BudgetKeyPair>> = Arc::downgrade(&evictor_arc);
        let handle =
            AutoExpiryCache::spawn_sweeper(self.keys.clone(), evictor, self.sweep_interval);
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Stops every referenced budget key; the first failure is returned.
    pub fn stop(&self) -> BudgetResult<()> {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        let mut result = Ok(());
        for (_, pair) in self.keys.snapshot() {
            let stopped = pair.budget_key.stop();
            if result.is_ok() {
                result = stopped;
            }
        }
        self.journal.unregister_subscriber(PROVIDER_COMPONENT_ID);
        result
    }

    /// Emits one load record per cached pair, each followed by the key's
    /// own checkpoint records, exactly what replay consumes.
    pub fn checkpoint(&self, checkpoint_logs: &mut Vec<CheckpointLog>) -> BudgetResult<()> {
        let mut pairs = self.keys.snapshot();
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (name, pair) in pairs {
            let bytes = BudgetKeyProviderLogV1 {
                id: pair.budget_key.id(),
                budget_key_name: name,
                operation: BudgetKeyProviderOperation::LoadIntoCache,
            }
            .encode()?;
            checkpoint_logs.push(CheckpointLog {
                component_id: PROVIDER_COMPONENT_ID,
                log_id: Uuid::new_v4(),
                bytes,
            });
            pair.budget_key.checkpoint(checkpoint_logs)?;
        }
        Ok(())
    }

    /// Runs the load path with the entry pinned; a failure hands the loader
    /// role back and leaves the entry evictable.
    async fn load_pair_guarded(&self, name: &BudgetKeyName, pair: &BudgetKeyPair) -> BudgetResult<()> {
        self.keys.pin(name);
        let result = self.load_pair(name, pair).await;
        self.keys.unpin(name);
        if result.is_err() {
            pair.load_state.mark_loader_needed();
        }
        result
    }

    async fn load_pair(&self, name: &BudgetKeyName, pair: &BudgetKeyPair) -> BudgetResult<()> {
        let bytes = BudgetKeyProviderLogV1 {
            id: pair.budget_key.id(),
            budget_key_name: name.clone(),
            operation: BudgetKeyProviderOperation::LoadIntoCache,
        }
        .encode()?;
        let log_id = Uuid::new_v4();
        self.dispatcher
            .dispatch(|| self.journal.append(PROVIDER_COMPONENT_ID, log_id, bytes.clone()))
            .await?;

        pair.budget_key.load_budget_key().await?;
        pair.load_state.mark_loaded();
        info!(key = %name, id = %pair.budget_key.id(), "budget key loaded into cache");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cached_pair(&self, name: &BudgetKeyName) -> Option<Arc<BudgetKeyPair>> {
        self.keys.get(name).ok().flatten()
    }

    #[cfg(test)]
    pub(crate) fn keys_cache(&self) -> &AutoExpiryCache<BudgetKeyName, BudgetKeyPair> {
        &self.keys
    }
}

/// Garbage collection: a key owned by an in-flight transaction is never
/// released; otherwise the removal is journaled before the entry is dropped.
/// A failed or retried journal append vetoes the collection and hands the
/// loader role back so the entry can be refreshed.
#[async_trait]
impl CacheEvictor<BudgetKeyName, BudgetKeyPair> for BudgetKeyProvider {
    async fn on_before_eviction(&self, name: &BudgetKeyName, pair: &Arc<BudgetKeyPair>) -> bool {
        if !pair.budget_key.can_unload() {
            debug!(key = %name, "eviction refused, key has an active transaction");
            return false;
        }

        let Ok(bytes) = (BudgetKeyProviderLogV1 {
            id: pair.budget_key.id(),
            budget_key_name: name.clone(),
            operation: BudgetKeyProviderOperation::DeleteFromCache,
        })
        .encode() else {
            return false;
        };
        let log_id = Uuid::new_v4();
        match self
            .dispatcher
            .dispatch(|| self.journal.append(PROVIDER_COMPONENT_ID, log_id, bytes.clone()))
            .await
        {
            Ok(()) => {
                let _ = pair.budget_key.stop();
                info!(key = %name, "budget key deleted from cache");
                true
            }
            Err(err) => {
                warn!(key = %name, error = %err, "delete-from-cache record failed");
                pair.load_state.mark_loader_needed();
                false
            }
        }
    }
}

#[async_trait]
impl JournalSubscriber for BudgetKeyProvider {
    async fn on_journal_replay(&self, bytes: &[u8]) -> BudgetResult<()> {
        let log = BudgetKeyProviderLogV1::decode(bytes)?;
        match log.operation {
            BudgetKeyProviderOperation::LoadIntoCache => {
                let (pair, inserted) =
                    self.keys.get_or_insert_with(log.budget_key_name.clone(), || BudgetKeyPair {
                        budget_key: BudgetKey::new(
                            log.budget_key_name.clone(),
                            log.id,
                            self.journal.clone(),
                            self.database.clone(),
                            &self.config,
                        ),
                        load_state: LoadState::new(),
                    })?;
                if !inserted && pair.budget_key.id() != log.id {
                    return Err(BudgetError::KeyIdConflict);
                }
                debug!(key = %log.budget_key_name, id = %log.id,
                    "budget key restored into cache");
            }
            BudgetKeyProviderOperation::DeleteFromCache => {
                if let Some(pair) = self.keys.remove(&log.budget_key_name) {
                    let _ = pair.budget_key.stop();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryJournal, MemoryNoSqlDatabase};

    struct Fixture {
        journal: Arc<MemoryJournal>,
        provider: Arc<BudgetKeyProvider>,
    }

    fn fixture() -> Fixture {
        let journal = MemoryJournal::new();
        let provider = BudgetKeyProvider::new(
            journal.clone(),
            MemoryNoSqlDatabase::new(),
            &PbsConfig::default(),
        );
        Fixture { journal, provider }
    }

    fn load_record(name: &str, id: Uuid) -> Vec<u8> {
        BudgetKeyProviderLogV1 {
            id,
            budget_key_name: name.to_string(),
            operation: BudgetKeyProviderOperation::LoadIntoCache,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_budget_key_loads_and_journals() {
        let f = fixture();
        let key = f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        assert_eq!(key.name(), "campaign-7");
        assert!(key.is_loaded());

        // One provider record plus the key's manager-id record.
        let entries = f.journal.store().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].component_id, PROVIDER_COMPONENT_ID);
        assert_eq!(entries[1].component_id, key.id());

        let log = BudgetKeyProviderLogV1::decode(&entries[0].bytes).unwrap();
        assert_eq!(log.operation, BudgetKeyProviderOperation::LoadIntoCache);
        assert_eq!(log.id, key.id());

        // A second lookup is served from cache without new records.
        let again = f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        assert_eq!(again.id(), key.id());
        assert_eq!(f.journal.store().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_load_hands_role_to_next_caller() {
        let f = fixture();
        f.journal.fail_appends_with(Some(BudgetError::JournalFailure("disk".into())));

        let result = f.provider.get_budget_key(&"campaign-7".to_string()).await;
        assert_eq!(result, Err(BudgetError::JournalFailure("disk".into())));

        let pair = f.provider.cached_pair(&"campaign-7".to_string()).unwrap();
        assert!(!pair.load_state.is_loaded());
        assert!(pair.load_state.needs_loader());

        // The next caller becomes the loader and succeeds.
        f.journal.fail_appends_with(None);
        let key = f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        assert!(key.is_loaded());
    }

    #[tokio::test]
    async fn test_unloaded_entry_without_loader_role_is_loading() {
        let f = fixture();
        f.journal.fail_appends_with(Some(BudgetError::JournalFailure("disk".into())));
        let _ = f.provider.get_budget_key(&"campaign-7".to_string()).await;

        // Claim the loader role out from under the next caller.
        let pair = f.provider.cached_pair(&"campaign-7".to_string()).unwrap();
        assert!(pair.load_state.try_become_loader());

        let result = f.provider.get_budget_key(&"campaign-7".to_string()).await;
        assert_eq!(result, Err(BudgetError::EntryIsLoading));
    }

    #[tokio::test]
    async fn test_replay_load_into_cache_is_idempotent_per_id() {
        let f = fixture();
        let id = Uuid::new_v4();

        f.provider.on_journal_replay(&load_record("campaign-7", id)).await.unwrap();
        let pair = f.provider.cached_pair(&"campaign-7".to_string()).unwrap();
        assert_eq!(pair.budget_key.id(), id);
        assert!(!pair.load_state.is_loaded());

        // Same id again: noop. Different id: conflict.
        f.provider.on_journal_replay(&load_record("campaign-7", id)).await.unwrap();
        let result = f.provider.on_journal_replay(&load_record("campaign-7", Uuid::new_v4())).await;
        assert_eq!(result, Err(BudgetError::KeyIdConflict));
    }

    #[tokio::test]
    async fn test_replay_delete_from_cache() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.provider.on_journal_replay(&load_record("campaign-7", id)).await.unwrap();

        let delete = BudgetKeyProviderLogV1 {
            id,
            budget_key_name: "campaign-7".to_string(),
            operation: BudgetKeyProviderOperation::DeleteFromCache,
        }
        .encode()
        .unwrap();
        f.provider.on_journal_replay(&delete).await.unwrap();
        assert!(f.provider.cached_pair(&"campaign-7".to_string()).is_none());

        // Deleting an absent entry is a noop.
        f.provider.on_journal_replay(&delete).await.unwrap();
    }

    #[tokio::test]
    async fn test_eviction_journals_delete_record() {
        let f = fixture();
        f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        let before = f.journal.store().len();

        let name = "campaign-7".to_string();
        let pair = f.provider.cached_pair(&name).unwrap();
        let allowed = CacheEvictor::on_before_eviction(&*f.provider, &name, &pair).await;
        assert!(allowed);

        let entries = f.journal.store().entries();
        assert_eq!(entries.len(), before + 1);
        let log = BudgetKeyProviderLogV1::decode(&entries.last().unwrap().bytes).unwrap();
        assert_eq!(log.operation, BudgetKeyProviderOperation::DeleteFromCache);
    }

    #[tokio::test]
    async fn test_eviction_refused_for_in_flight_transaction() {
        let f = fixture();
        let key = f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        key.consume_protocol()
            .unwrap()
            .commit(crate::domain::models::CommitConsumeBudgetRequest {
                transaction_id: Uuid::from_u64_pair(1, 2),
                reporting_time: crate::domain::models::reporting_time_for(19218, 0),
                token_count: 1,
            })
            .await
            .unwrap();

        let name = "campaign-7".to_string();
        let pair = f.provider.cached_pair(&name).unwrap();
        let allowed = CacheEvictor::on_before_eviction(&*f.provider, &name, &pair).await;
        assert!(!allowed);
        assert!(f.provider.cached_pair(&name).is_some());
    }

    #[tokio::test]
    async fn test_eviction_refused_when_journal_fails() {
        let f = fixture();
        f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        f.journal.fail_appends_with(Some(BudgetError::JournalUnavailable("backpressure".into())));

        let name = "campaign-7".to_string();
        let pair = f.provider.cached_pair(&name).unwrap();
        let allowed = CacheEvictor::on_before_eviction(&*f.provider, &name, &pair).await;
        assert!(!allowed);
        assert!(pair.load_state.needs_loader());
    }

    #[tokio::test]
    async fn test_run_schedules_loads_for_unloaded_keys() {
        let f = fixture();
        f.provider
            .on_journal_replay(&load_record("campaign-7", Uuid::new_v4()))
            .await
            .unwrap();
        assert!(!f.provider.cached_pair(&"campaign-7".to_string()).unwrap().load_state.is_loaded());

        f.provider.run();
        // Background load: poll until it lands.
        for _ in 0..50 {
            if f.provider.cached_pair(&"campaign-7".to_string()).unwrap().load_state.is_loaded() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(f.provider.cached_pair(&"campaign-7".to_string()).unwrap().load_state.is_loaded());
        f.provider.stop().unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_emits_pair_records_then_key_records() {
        let f = fixture();
        f.provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();

        let mut logs = Vec::new();
        f.provider.checkpoint(&mut logs).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].component_id, PROVIDER_COMPONENT_ID);

        let pair_record = BudgetKeyProviderLogV1::decode(&logs[0].bytes).unwrap();
        assert_eq!(pair_record.operation, BudgetKeyProviderOperation::LoadIntoCache);
        assert_eq!(logs[1].component_id, pair_record.id);
    }

    #[tokio::test]
    async fn test_stop_stops_all_keys() {
        let f = fixture();
        f.provider.get_budget_key(&"a".to_string()).await.unwrap();
        f.provider.get_budget_key(&"b".to_string()).await.unwrap();
        assert_eq!(f.provider.keys_cache().len(), 2);
        f.provider.stop().unwrap();
    }
}
