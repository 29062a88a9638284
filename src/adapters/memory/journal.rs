//! In-memory journal service.
//!
//! Backed by a shared [`MemoryJournalStore`], so several journal-service
//! instances (e.g. the live data path and a checkpoint cycle) can route
//! replays independently over the same record stream. Appends receive
//! strictly increasing record ids; recovery visits records in append order
//! and routes each to the subscriber registered for its component id at the
//! moment the record is visited, which lets replayed records register the
//! subscribers that later records address.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::models::JournalId;
use crate::domain::ports::{JournalService, JournalSubscriber, RecoveryOutcome};

/// One appended record.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: JournalId,
    pub component_id: Uuid,
    pub log_id: Uuid,
    pub bytes: Vec<u8>,
    pub appended_at: DateTime<Utc>,
}

/// Durable record stream shared between journal-service instances.
#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    entries: Mutex<Vec<JournalEntry>>,
    next_id: AtomicU64,
}

impl MemoryJournalStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) })
    }

    fn push(&self, component_id: Uuid, log_id: Uuid, bytes: Vec<u8>) -> JournalId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = JournalEntry { id, component_id, log_id, bytes, appended_at: Utc::now() };
        self.entries.lock().unwrap().push(entry);
        id
    }

    /// Snapshot of all records in append order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// In-memory [`JournalService`] adapter.
pub struct MemoryJournal {
    store: Arc<MemoryJournalStore>,
    subscribers: DashMap<Uuid, Arc<dyn JournalSubscriber>>,
    fail_appends_with: Mutex<Option<BudgetError>>,
}

impl MemoryJournal {
    pub fn new() -> Arc<Self> {
        Self::with_store(MemoryJournalStore::new())
    }

    /// Creates a journal service over an existing record stream.
    pub fn with_store(store: Arc<MemoryJournalStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            subscribers: DashMap::new(),
            fail_appends_with: Mutex::new(None),
        })
    }

    pub fn store(&self) -> Arc<MemoryJournalStore> {
        self.store.clone()
    }

    /// Makes every subsequent append fail with the given error, until
    /// cleared with `None`. Test hook.
    pub fn fail_appends_with(&self, error: Option<BudgetError>) {
        *self.fail_appends_with.lock().unwrap() = error;
    }

    /// True if a replay subscriber is registered for the component. Test hook.
    pub fn has_subscriber(&self, component_id: Uuid) -> bool {
        self.subscribers.contains_key(&component_id)
    }
}

#[async_trait]
impl JournalService for MemoryJournal {
    async fn append(&self, component_id: Uuid, log_id: Uuid, bytes: Vec<u8>) -> BudgetResult<()> {
        if let Some(error) = self.fail_appends_with.lock().unwrap().clone() {
            return Err(error);
        }
        let id = self.store.push(component_id, log_id, bytes);
        debug!(journal_id = id, %component_id, "journal record appended");
        Ok(())
    }

    fn register_subscriber(&self, component_id: Uuid, subscriber: Arc<dyn JournalSubscriber>) {
        self.subscribers.insert(component_id, subscriber);
    }

    fn unregister_subscriber(&self, component_id: Uuid) {
        self.subscribers.remove(&component_id);
    }

    async fn recover(&self) -> BudgetResult<RecoveryOutcome> {
        let entries = self.store.entries();
        let mut last_processed_journal_id = None;
        let mut replayed_count = 0;

        for entry in entries {
            // Look up per record: replaying one record may register the
            // subscriber the next record addresses.
            let subscriber = self.subscribers.get(&entry.component_id).map(|s| s.value().clone());
            match subscriber {
                Some(subscriber) => {
                    subscriber.on_journal_replay(&entry.bytes).await?;
                    replayed_count += 1;
                }
                None => {
                    warn!(component_id = %entry.component_id, journal_id = entry.id,
                        "no subscriber for replayed record, skipping");
                }
            }
            last_processed_journal_id = Some(entry.id);
        }

        debug!(replayed_count, "journal recovery pass finished");
        Ok(RecoveryOutcome { last_processed_journal_id, replayed_count })
    }
}
