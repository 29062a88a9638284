//! Budget key.
//!
//! Thin façade binding a key name and id to its timeframe manager and the
//! two consume-budget transaction protocols. The key journals its own
//! lifecycle: loading a key appends a record announcing the manager id, and
//! replaying that record reconstructs the manager so subsequent records for
//! the manager id land on it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::models::{
    BudgetKeyLogV1, BudgetKeyName, CheckpointLog, GetBudgetRequest, GetBudgetResponse,
    LoadTimeframesRequest,
};
use crate::domain::ports::{JournalService, JournalSubscriber, NoSqlDatabase};
use crate::infrastructure::PbsConfig;

use super::dispatcher::OperationDispatcher;
use super::timeframe_manager::BudgetKeyTimeframeManager;
use super::transaction::{
    BatchConsumeBudgetTransactionProtocol, ConsumeBudgetTransactionProtocol,
};

struct LoadedState {
    manager: Arc<BudgetKeyTimeframeManager>,
    consume_protocol: Arc<ConsumeBudgetTransactionProtocol>,
    batch_consume_protocol: Arc<BatchConsumeBudgetTransactionProtocol>,
}

pub struct BudgetKey {
    name: BudgetKeyName,
    id: Uuid,
    journal: Arc<dyn JournalService>,
    database: Arc<dyn NoSqlDatabase>,
    config: PbsConfig,
    dispatcher: OperationDispatcher,
    loaded: Mutex<Option<LoadedState>>,
}

impl BudgetKey {
    /// Creates the key and registers it for journal replay under its id.
    pub fn new(
        name: BudgetKeyName,
        id: Uuid,
        journal: Arc<dyn JournalService>,
        database: Arc<dyn NoSqlDatabase>,
        config: &PbsConfig,
    ) -> Arc<Self> {
        let key = Arc::new(Self {
            name,
            id,
            journal: journal.clone(),
            database,
            config: config.clone(),
            dispatcher: OperationDispatcher::new(
                config.retry_base_delay(),
                config.retry_max_attempts,
            ),
            loaded: Mutex::new(None),
        });
        journal.register_subscriber(id, key.clone());
        key
    }

    pub fn name(&self) -> &BudgetKeyName {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Journals the timeframe-manager id, then constructs the manager and
    /// the protocol objects bound to it. On any journal result other than
    /// success nothing is constructed.
    pub async fn load_budget_key(&self) -> BudgetResult<()> {
        if self.loaded.lock().unwrap().is_some() {
            return Ok(());
        }

        let manager_id = Uuid::new_v4();
        let bytes = BudgetKeyLogV1 { timeframe_manager_id: manager_id }.encode()?;
        let log_id = Uuid::new_v4();
        self.dispatcher
            .dispatch(|| self.journal.append(self.id, log_id, bytes.clone()))
            .await?;

        self.install_manager(manager_id);
        info!(key = %self.name, %manager_id, "budget key loaded");
        Ok(())
    }

    /// Reads the committed token balance of one bucket.
    pub async fn get_budget(&self, request: GetBudgetRequest) -> BudgetResult<GetBudgetResponse> {
        let manager = self.manager()?;
        let response = manager
            .load(LoadTimeframesRequest { reporting_times: vec![request.reporting_time] })
            .await?;
        Ok(GetBudgetResponse { token_count: response.timeframes[0].token_count() })
    }

    pub fn consume_protocol(&self) -> BudgetResult<Arc<ConsumeBudgetTransactionProtocol>> {
        let loaded = self.loaded.lock().unwrap();
        loaded
            .as_ref()
            .map(|state| state.consume_protocol.clone())
            .ok_or(BudgetError::EntryIsLoading)
    }

    pub fn batch_consume_protocol(
        &self,
    ) -> BudgetResult<Arc<BatchConsumeBudgetTransactionProtocol>> {
        let loaded = self.loaded.lock().unwrap();
        loaded
            .as_ref()
            .map(|state| state.batch_consume_protocol.clone())
            .ok_or(BudgetError::EntryIsLoading)
    }

    /// A key may unload only when none of its timeframes is owned by an
    /// in-flight transaction.
    pub fn can_unload(&self) -> bool {
        let loaded = self.loaded.lock().unwrap();
        match loaded.as_ref() {
            Some(state) => state.manager.can_unload(),
            None => true,
        }
    }

    /// Appends a record announcing the current manager id, then the
    /// manager's own group-snapshot records.
    pub fn checkpoint(&self, checkpoint_logs: &mut Vec<CheckpointLog>) -> BudgetResult<()> {
        let manager = {
            let loaded = self.loaded.lock().unwrap();
            match loaded.as_ref() {
                Some(state) => state.manager.clone(),
                None => return Ok(()),
            }
        };

        let bytes = BudgetKeyLogV1 { timeframe_manager_id: manager.id() }.encode()?;
        checkpoint_logs.push(CheckpointLog {
            component_id: self.id,
            log_id: Uuid::new_v4(),
            bytes,
        });
        manager.checkpoint(checkpoint_logs)
    }

    /// Stops the manager and drops the key's journal registration.
    pub fn stop(&self) -> BudgetResult<()> {
        let manager = {
            let loaded = self.loaded.lock().unwrap();
            loaded.as_ref().map(|state| state.manager.clone())
        };
        if let Some(manager) = manager {
            manager.stop()?;
        }
        self.journal.unregister_subscriber(self.id);
        Ok(())
    }

    fn manager(&self) -> BudgetResult<Arc<BudgetKeyTimeframeManager>> {
        let loaded = self.loaded.lock().unwrap();
        loaded
            .as_ref()
            .map(|state| state.manager.clone())
            .ok_or(BudgetError::EntryIsLoading)
    }

    fn install_manager(&self, manager_id: Uuid) {
        let manager = BudgetKeyTimeframeManager::new(
            manager_id,
            self.name.clone(),
            self.journal.clone(),
            self.database.clone(),
            &self.config,
        );
        manager.run();
        let state = LoadedState {
            consume_protocol: Arc::new(ConsumeBudgetTransactionProtocol::new(manager.clone())),
            batch_consume_protocol: Arc::new(BatchConsumeBudgetTransactionProtocol::new(
                manager.clone(),
            )),
            manager,
        };
        *self.loaded.lock().unwrap() = Some(state);
    }

    // Exposed for provider internals and tests.
    pub(crate) fn timeframe_manager(&self) -> Option<Arc<BudgetKeyTimeframeManager>> {
        self.loaded.lock().unwrap().as_ref().map(|state| state.manager.clone())
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.lock().unwrap().is_some()
    }
}

impl std::fmt::Debug for BudgetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetKey").field("name", &self.name).field("id", &self.id).finish()
    }
}

impl PartialEq for BudgetKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[async_trait]
impl JournalSubscriber for BudgetKey {
    async fn on_journal_replay(&self, bytes: &[u8]) -> BudgetResult<()> {
        let log = BudgetKeyLogV1::decode(bytes)?;

        let previous = {
            let loaded = self.loaded.lock().unwrap();
            match loaded.as_ref() {
                Some(state) if state.manager.id() == log.timeframe_manager_id => return Ok(()),
                Some(state) => Some(state.manager.clone()),
                None => None,
            }
        };
        // A later record superseding the manager id tears the old manager
        // down first; its sweeper and journal registration must not outlive
        // the replacement.
        if let Some(previous) = previous {
            previous.stop()?;
        }
        self.install_manager(log.timeframe_manager_id);
        debug!(key = %self.name, manager_id = %log.timeframe_manager_id,
            "budget key restored from journal");
        Ok(())
    }
}
