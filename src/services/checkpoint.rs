//! Checkpoint service.
//!
//! Periodic worker that compacts the journal into a checkpoint blob. Each
//! cycle builds fresh recovery components, replays the journal into them,
//! collects every component's replayable state, writes the checkpoint blob
//! and finally the `last_checkpoint` pointer, then shuts the cycle
//! components down. Once a checkpoint is stored, journal segments up to its
//! recorded id are no longer needed for recovery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::models::{
    CheckpointBlob, CheckpointLog, CheckpointMetadata, JournalId, LastCheckpointMetadata,
};
use crate::domain::ports::{BlobStore, JournalService};

use super::budget_key_provider::BudgetKeyProvider;

/// Components recovered and checkpointed by one cycle.
pub struct CheckpointCycle {
    pub journal: Arc<dyn JournalService>,
    pub budget_key_provider: Arc<BudgetKeyProvider>,
}

/// Builds the recovery components for a cycle. Called once per checkpoint
/// run; the produced journal service must read the same record stream the
/// live data path appends to.
pub type CheckpointCycleFactory = Box<dyn Fn() -> CheckpointCycle + Send + Sync>;

pub struct CheckpointService {
    partition_name: String,
    blob_store: Arc<dyn BlobStore>,
    cycle_factory: CheckpointCycleFactory,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointService {
    pub fn new(
        partition_name: String,
        blob_store: Arc<dyn BlobStore>,
        cycle_factory: CheckpointCycleFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            partition_name,
            blob_store,
            cycle_factory,
            worker: Mutex::new(None),
        })
    }

    /// Runs one bootstrap/recover/checkpoint/store/shutdown cycle and
    /// returns the stored checkpoint id.
    pub async fn run_once(&self) -> BudgetResult<u64> {
        self.blob_store.verify_writable().await?;

        let cycle = (self.cycle_factory)();
        let result = self.run_cycle(&cycle).await;

        // Shutdown happens regardless of the cycle outcome.
        let stopped = cycle.budget_key_provider.stop();
        match (result, stopped) {
            (Ok(checkpoint_id), Ok(())) => Ok(checkpoint_id),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    async fn run_cycle(&self, cycle: &CheckpointCycle) -> BudgetResult<u64> {
        let outcome = cycle.journal.recover().await?;
        let Some(last_processed_journal_id) = outcome.last_processed_journal_id else {
            return Err(BudgetError::NoLogsToProcess);
        };

        let mut checkpoint_logs: Vec<CheckpointLog> = Vec::new();
        cycle.budget_key_provider.checkpoint(&mut checkpoint_logs)?;

        let checkpoint_id = self
            .store(last_processed_journal_id, checkpoint_logs)
            .await?;
        info!(checkpoint_id, last_processed_journal_id, "checkpoint stored");
        Ok(checkpoint_id)
    }

    /// Writes the checkpoint blob, then atomically repoints
    /// `last_checkpoint` at it. The pointer is written only after the blob
    /// itself succeeded, so readers never observe a dangling pointer.
    async fn store(
        &self,
        last_processed_journal_id: JournalId,
        logs: Vec<CheckpointLog>,
    ) -> BudgetResult<u64> {
        let checkpoint_id = last_processed_journal_id;
        let blob = CheckpointBlob {
            logs,
            metadata: CheckpointMetadata { last_processed_journal_id },
        };

        let checkpoint_name = checkpoint_blob_name(&self.partition_name, checkpoint_id);
        self.blob_store.put_blob(&checkpoint_name, blob.encode()?).await?;

        let pointer = LastCheckpointMetadata { last_checkpoint_id: checkpoint_id };
        self.blob_store
            .put_blob(&last_checkpoint_blob_name(&self.partition_name), pointer.encode()?)
            .await?;
        Ok(checkpoint_id)
    }

    /// Starts the periodic worker.
    pub fn run(self: &Arc<Self>, interval: Duration) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.run_once().await {
                    Ok(checkpoint_id) => {
                        info!(checkpoint_id, "checkpoint cycle finished");
                    }
                    Err(BudgetError::NoLogsToProcess) => {}
                    Err(err) => {
                        warn!(error = %err, "checkpoint cycle failed");
                    }
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// `<partition>/checkpoint_<20-digit-zero-padded-id>`
pub fn checkpoint_blob_name(partition_name: &str, checkpoint_id: u64) -> String {
    format!("{partition_name}/checkpoint_{checkpoint_id:020}")
}

/// `<partition>/last_checkpoint`
pub fn last_checkpoint_blob_name(partition_name: &str) -> String {
    format!("{partition_name}/last_checkpoint")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryBlobStore, MemoryJournal, MemoryNoSqlDatabase};
    use crate::infrastructure::PbsConfig;

    fn service_over(
        journal: &Arc<MemoryJournal>,
        database: &Arc<MemoryNoSqlDatabase>,
        blob_store: &Arc<MemoryBlobStore>,
    ) -> Arc<CheckpointService> {
        let store = journal.store();
        let database = database.clone();
        let factory: CheckpointCycleFactory = Box::new(move || {
            let journal = MemoryJournal::with_store(store.clone());
            let budget_key_provider =
                BudgetKeyProvider::new(journal.clone(), database.clone(), &PbsConfig::default());
            CheckpointCycle { journal, budget_key_provider }
        });
        CheckpointService::new("partition-0".to_string(), blob_store.clone(), factory)
    }

    #[test]
    fn test_blob_names() {
        assert_eq!(
            checkpoint_blob_name("partition-0", 123_456),
            "partition-0/checkpoint_00000000000000123456"
        );
        assert_eq!(last_checkpoint_blob_name("partition-0"), "partition-0/last_checkpoint");
    }

    #[tokio::test]
    async fn test_empty_journal_yields_no_logs_to_process() {
        let journal = MemoryJournal::new();
        let database = MemoryNoSqlDatabase::new();
        let blob_store = MemoryBlobStore::new();
        let service = service_over(&journal, &database, &blob_store);

        assert_eq!(service.run_once().await, Err(BudgetError::NoLogsToProcess));
        assert!(blob_store.blob_names().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_propagates() {
        let journal = MemoryJournal::new();
        let database = MemoryNoSqlDatabase::new();
        let blob_store = MemoryBlobStore::new();
        blob_store.fail_puts_with(Some(BudgetError::BlobUnavailable("throttled".into())));
        let service = service_over(&journal, &database, &blob_store);

        assert_eq!(
            service.run_once().await,
            Err(BudgetError::BlobUnavailable("throttled".into()))
        );
    }

    #[tokio::test]
    async fn test_cycle_writes_checkpoint_then_pointer() {
        let journal = MemoryJournal::new();
        let database = MemoryNoSqlDatabase::new();
        let blob_store = MemoryBlobStore::new();

        // Live traffic: one key loaded and one budget consumed.
        let provider = BudgetKeyProvider::new(journal.clone(), database.clone(), &PbsConfig::default());
        let key = provider.get_budget_key(&"campaign-7".to_string()).await.unwrap();
        key.consume_protocol()
            .unwrap()
            .commit(crate::domain::models::CommitConsumeBudgetRequest {
                transaction_id: uuid::Uuid::from_u64_pair(1, 2),
                reporting_time: crate::domain::models::reporting_time_for(19218, 0),
                token_count: 1,
            })
            .await
            .unwrap();
        provider.stop().unwrap();

        let service = service_over(&journal, &database, &blob_store);
        let checkpoint_id = service.run_once().await.unwrap();
        assert_eq!(checkpoint_id, journal.store().entries().last().unwrap().id);

        let names = blob_store.blob_names();
        assert_eq!(
            names,
            vec![
                checkpoint_blob_name("partition-0", checkpoint_id),
                last_checkpoint_blob_name("partition-0"),
            ]
        );

        let pointer_bytes =
            blob_store.get_blob(&last_checkpoint_blob_name("partition-0")).await.unwrap().unwrap();
        let pointer = LastCheckpointMetadata::decode(&pointer_bytes).unwrap();
        assert_eq!(pointer.last_checkpoint_id, checkpoint_id);

        let blob_bytes = blob_store
            .get_blob(&checkpoint_blob_name("partition-0", checkpoint_id))
            .await
            .unwrap()
            .unwrap();
        let blob = CheckpointBlob::decode(&blob_bytes).unwrap();
        assert_eq!(blob.metadata.last_processed_journal_id, checkpoint_id);
        // Provider pair record, key manager record, group snapshot record.
        assert_eq!(blob.logs.len(), 3);
    }
}
