//! Budget-key timeframe manager.
//!
//! Owns one key's timeframe groups: a day's worth of hourly timeframes per
//! group, loaded lazily from the NoSQL store and evicted back to it. Every
//! in-memory mutation is journaled first; tentative transaction state lives
//! only in memory and in the journal, never in the NoSQL row.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::models::{
    time_bucket_of, time_group_of, BatchTimeframeLogV1, BudgetKeyName, BudgetKeyTimeframe,
    BudgetKeyTimeframeGroup, CheckpointLog, LoadTimeframesRequest, LoadTimeframesResponse,
    TimeBucket, TimeGroup, TimeframeGroupLogV1, TimeframeLogV1, TimeframeManagerLogV1,
    TimeframeManagerOperation, Timestamp, TokenCount, UpdateTimeframesRequest, HOURS_PER_DAY,
};
use crate::domain::ports::{
    GetItemRequest, ItemAttribute, ItemKey, JournalService, JournalSubscriber, NoSqlDatabase,
    UpsertItemRequest,
};
use crate::infrastructure::PbsConfig;

use super::cache::{AutoExpiryCache, CacheEvictor};
use super::dispatcher::OperationDispatcher;

/// Partition key attribute: the budget-key name.
pub const PARTITION_KEY_ATTRIBUTE: &str = "Budget_Key";
/// Sort key attribute: the day index as a decimal string.
pub const SORT_KEY_ATTRIBUTE: &str = "Timeframe";
/// Data attribute holding the 24 space-separated hourly balances.
pub const TOKEN_COUNT_ATTRIBUTE: &str = "TokenCount";

pub struct BudgetKeyTimeframeManager {
    id: Uuid,
    budget_key_name: BudgetKeyName,
    journal: Arc<dyn JournalService>,
    database: Arc<dyn NoSqlDatabase>,
    table_name: String,
    max_token_count: TokenCount,
    groups: Arc<AutoExpiryCache<TimeGroup, BudgetKeyTimeframeGroup>>,
    dispatcher: OperationDispatcher,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BudgetKeyTimeframeManager {
    /// Creates the manager and registers it for journal replay under its id.
    pub fn new(
        id: Uuid,
        budget_key_name: BudgetKeyName,
        journal: Arc<dyn JournalService>,
        database: Arc<dyn NoSqlDatabase>,
        config: &PbsConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            id,
            budget_key_name,
            journal: journal.clone(),
            database,
            table_name: config.budget_key_table_name.clone(),
            max_token_count: config.max_token_count,
            groups: Arc::new(AutoExpiryCache::new(config.timeframe_group_ttl())),
            dispatcher: OperationDispatcher::new(
                config.retry_base_delay(),
                config.retry_max_attempts,
            ),
            sweep_interval: config.cache_sweep_interval(),
            sweeper: Mutex::new(None),
        });
        journal.register_subscriber(id, manager.clone());
        manager
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Starts the background eviction sweeper.
    pub fn run(self: &Arc<Self>) {
        let evictor_arc: Arc<dyn CacheEvictor<TimeGroup, BudgetKeyTimeframeGroup>> = self.clone();
        let evictor: Weak<dyn CacheEvictor<TimeGroup, BudgetKeyTimeframeGroup>> =
            Arc::downgrade(&evictor_arc);
        let handle =
            AutoExpiryCache::spawn_sweeper(self.groups.clone(), evictor, self.sweep_interval);
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Stops the sweeper and drops the journal registration.
    pub fn stop(&self) -> BudgetResult<()> {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.journal.unregister_subscriber(self.id);
        Ok(())
    }

    /// True when no timeframe of any group is locked by a transaction.
    pub fn can_unload(&self) -> bool {
        self.groups.snapshot().iter().all(|(_, group)| !group.has_active_transaction())
    }

    /// Loads the timeframes addressed by the request, fetching the day's row
    /// from the NoSQL store when the group is not yet cached. At most one
    /// caller loads a group at a time; others observe `EntryIsLoading`. A
    /// group that finished loading can be extended by any caller: buckets a
    /// fresh day has not materialized yet start at the full balance.
    pub async fn load(&self, request: LoadTimeframesRequest) -> BudgetResult<LoadTimeframesResponse> {
        let time_group = Self::validate_reporting_times(&request.reporting_times)?;
        let buckets: Vec<TimeBucket> =
            request.reporting_times.iter().map(|t| time_bucket_of(*t)).collect();

        let (group, inserted) = self
            .groups
            .get_or_insert_with(time_group, || BudgetKeyTimeframeGroup::new(time_group))?;

        if buckets.iter().all(|bucket| group.contains(*bucket)) {
            return Self::respond_with(&group, &buckets);
        }

        let is_loader =
            inserted || group.load_state.try_become_loader() || group.load_state.is_loaded();
        if !is_loader {
            return Err(BudgetError::EntryIsLoading);
        }

        self.groups.pin(&time_group);
        let result = self.load_group_from_database(time_group, &group, &buckets).await;
        self.groups.unpin(&time_group);

        match result {
            Ok(()) => Self::respond_with(&group, &buckets),
            Err(err) => {
                group.load_state.mark_loader_needed();
                Err(err)
            }
        }
    }

    /// Journals the proposed timeframe states and, once the record is
    /// durable, applies them to the in-memory frames. On any journal result
    /// other than success the in-memory state is untouched.
    pub async fn update(&self, request: UpdateTimeframesRequest) -> BudgetResult<()> {
        let times: Vec<Timestamp> =
            request.timeframes_to_update.iter().map(|u| u.reporting_time).collect();
        let time_group = Self::validate_reporting_times(&times)?;

        let group = self.groups.get(&time_group)?.ok_or(BudgetError::EntryDoesNotExist)?;

        let mut frames: Vec<Arc<BudgetKeyTimeframe>> =
            Vec::with_capacity(request.timeframes_to_update.len());
        for update in &request.timeframes_to_update {
            let bucket = time_bucket_of(update.reporting_time);
            frames.push(group.timeframe(bucket).ok_or(BudgetError::EntryDoesNotExist)?);
        }

        let items: Vec<TimeframeLogV1> = request
            .timeframes_to_update
            .iter()
            .map(|update| TimeframeLogV1 {
                time_bucket: time_bucket_of(update.reporting_time),
                token_count: update.token_count,
                active_token_count: update.active_token_count,
                active_transaction_id: update.active_transaction_id,
            })
            .collect();
        let log = if items.len() == 1 {
            TimeframeManagerLogV1::update_timeframe(time_group, &items[0])?
        } else {
            TimeframeManagerLogV1::batch_update_timeframes(
                time_group,
                &BatchTimeframeLogV1 { items: items.clone() },
            )?
        };
        let bytes = log.encode()?;
        let log_id = Uuid::new_v4();

        self.groups.pin(&time_group);
        let appended = self
            .dispatcher
            .dispatch(|| self.journal.append(self.id, log_id, bytes.clone()))
            .await;
        self.groups.unpin(&time_group);
        appended?;

        for (frame, item) in frames.iter().zip(items.iter()) {
            frame.apply(item.token_count, item.active_token_count, item.active_transaction_id);
        }
        debug!(key = %self.budget_key_name, time_group, updated = items.len(),
            "timeframes updated");
        Ok(())
    }

    /// Appends one group-snapshot record per live group; replaying them
    /// rebuilds the cache without consulting the NoSQL store.
    pub fn checkpoint(&self, checkpoint_logs: &mut Vec<CheckpointLog>) -> BudgetResult<()> {
        let mut groups = self.groups.snapshot();
        groups.sort_by_key(|(time_group, _)| *time_group);

        for (time_group, group) in groups {
            let items: Vec<TimeframeLogV1> =
                group.snapshot().into_iter().map(TimeframeLogV1::from).collect();
            let log = TimeframeManagerLogV1::insert_timegroup(
                time_group,
                &TimeframeGroupLogV1 { items },
            )?;
            checkpoint_logs.push(CheckpointLog {
                component_id: self.id,
                log_id: Uuid::new_v4(),
                bytes: log.encode()?,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Load path
    // -------------------------------------------------------------------------

    fn validate_reporting_times(reporting_times: &[Timestamp]) -> BudgetResult<TimeGroup> {
        let Some(first) = reporting_times.first() else {
            return Err(BudgetError::EmptyRequest);
        };
        let time_group = time_group_of(*first);
        if reporting_times.iter().any(|t| time_group_of(*t) != time_group) {
            return Err(BudgetError::MultipleTimeframeGroups);
        }
        let mut seen = HashSet::with_capacity(reporting_times.len());
        if !reporting_times.iter().all(|t| seen.insert(time_bucket_of(*t))) {
            return Err(BudgetError::RepeatedTimeBuckets);
        }
        Ok(time_group)
    }

    fn respond_with(
        group: &BudgetKeyTimeframeGroup,
        buckets: &[TimeBucket],
    ) -> BudgetResult<LoadTimeframesResponse> {
        let timeframes = buckets
            .iter()
            .map(|bucket| group.timeframe(*bucket).ok_or(BudgetError::EntryDoesNotExist))
            .collect::<BudgetResult<Vec<_>>>()?;
        Ok(LoadTimeframesResponse { timeframes })
    }

    fn row_key(&self, time_group: TimeGroup) -> ItemKey {
        ItemKey {
            table_name: self.table_name.clone(),
            partition_key: ItemAttribute::new(PARTITION_KEY_ATTRIBUTE, self.budget_key_name.clone()),
            sort_key: ItemAttribute::new(SORT_KEY_ATTRIBUTE, time_group.to_string()),
        }
    }

    async fn load_group_from_database(
        &self,
        time_group: TimeGroup,
        group: &Arc<BudgetKeyTimeframeGroup>,
        requested_buckets: &[TimeBucket],
    ) -> BudgetResult<()> {
        if group.load_state.is_loaded() {
            // The day's row was already consulted and the in-memory group is
            // authoritative. A requested bucket absent from it never had a
            // stored balance, so it starts full.
            for bucket in requested_buckets {
                group.get_or_insert_timeframe(*bucket, self.max_token_count);
            }
        } else {
            let item =
                self.database.get_item(GetItemRequest { key: self.row_key(time_group) }).await?;

            match item {
                None => {
                    // Fresh day: every requested bucket starts at the full balance.
                    for bucket in requested_buckets {
                        group.get_or_insert_timeframe(*bucket, self.max_token_count);
                    }
                    debug!(key = %self.budget_key_name, time_group, "fresh timeframe group created");
                }
                Some(item) => {
                    let token_counts = Self::parse_token_counts(&item.attributes)?;
                    for (bucket, token_count) in token_counts.iter().enumerate() {
                        group.get_or_insert_timeframe(bucket as TimeBucket, *token_count);
                    }
                }
            }
        }

        // Journal the group snapshot so replay can rebuild the cache, and so
        // later update records find their group.
        let items: Vec<TimeframeLogV1> =
            group.snapshot().into_iter().map(TimeframeLogV1::from).collect();
        let log =
            TimeframeManagerLogV1::insert_timegroup(time_group, &TimeframeGroupLogV1 { items })?;
        let bytes = log.encode()?;
        let log_id = Uuid::new_v4();
        self.dispatcher.dispatch(|| self.journal.append(self.id, log_id, bytes.clone())).await?;

        group.load_state.mark_loaded();
        info!(key = %self.budget_key_name, time_group, "timeframe group loaded into cache");
        Ok(())
    }

    /// The stored attribute must be exactly 24 space-separated non-negative
    /// integers; anything else is corrupted metadata.
    fn parse_token_counts(attributes: &[ItemAttribute]) -> BudgetResult<Vec<TokenCount>> {
        let attribute = attributes
            .iter()
            .find(|a| a.name == TOKEN_COUNT_ATTRIBUTE)
            .ok_or(BudgetError::CorruptedKeyMetadata)?;

        let token_counts = attribute
            .value
            .split(' ')
            .map(|cell| cell.parse::<TokenCount>().map_err(|_| BudgetError::CorruptedKeyMetadata))
            .collect::<BudgetResult<Vec<_>>>()?;

        if token_counts.len() != HOURS_PER_DAY as usize {
            return Err(BudgetError::CorruptedKeyMetadata);
        }
        Ok(token_counts)
    }

    fn render_token_counts(&self, group: &BudgetKeyTimeframeGroup) -> String {
        (0..HOURS_PER_DAY)
            .map(|bucket| {
                group
                    .timeframe(bucket)
                    .map_or(self.max_token_count, |frame| frame.token_count())
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Eviction write-back: committed balances move to the NoSQL row, then a
/// removal record is journaled so replay converges on the evicted state. A
/// group owned by an in-flight transaction is never released.
#[async_trait]
impl CacheEvictor<TimeGroup, BudgetKeyTimeframeGroup> for BudgetKeyTimeframeManager {
    async fn on_before_eviction(
        &self,
        time_group: &TimeGroup,
        group: &Arc<BudgetKeyTimeframeGroup>,
    ) -> bool {
        if group.has_active_transaction() {
            debug!(key = %self.budget_key_name, time_group,
                "eviction refused, group has an active transaction");
            return false;
        }

        let request = UpsertItemRequest {
            key: self.row_key(*time_group),
            attributes: vec![ItemAttribute::new(
                TOKEN_COUNT_ATTRIBUTE,
                self.render_token_counts(group),
            )],
        };
        if let Err(err) = self.database.upsert_item(request).await {
            warn!(key = %self.budget_key_name, time_group, error = %err,
                "eviction write-back failed");
            return false;
        }

        let log = TimeframeManagerLogV1::remove_timegroup(*time_group);
        let Ok(bytes) = log.encode() else {
            return false;
        };
        let log_id = Uuid::new_v4();
        match self.dispatcher.dispatch(|| self.journal.append(self.id, log_id, bytes.clone())).await
        {
            Ok(()) => {
                info!(key = %self.budget_key_name, time_group, "timeframe group evicted");
                true
            }
            Err(err) => {
                warn!(key = %self.budget_key_name, time_group, error = %err,
                    "eviction removal record failed");
                false
            }
        }
    }
}

#[async_trait]
impl JournalSubscriber for BudgetKeyTimeframeManager {
    async fn on_journal_replay(&self, bytes: &[u8]) -> BudgetResult<()> {
        let log = TimeframeManagerLogV1::decode(bytes)?;
        match log.operation {
            TimeframeManagerOperation::InsertTimegroupIntoCache => {
                if log.log_body.is_empty() {
                    return Err(BudgetError::CorruptedKeyMetadata);
                }
                let body = log.group_body()?;
                let (group, _) = self
                    .groups
                    .get_or_insert_with(log.time_group, || {
                        BudgetKeyTimeframeGroup::new(log.time_group)
                    })?;
                for item in body.items {
                    let frame = BudgetKeyTimeframe::new(item.time_bucket, item.token_count);
                    frame.apply(item.token_count, item.active_token_count, item.active_transaction_id);
                    group.insert_timeframe(frame);
                }
                group.load_state.mark_loaded();
            }
            TimeframeManagerOperation::RemoveTimegroupFromCache => {
                self.groups.remove(&log.time_group);
            }
            TimeframeManagerOperation::UpdateTimeframeRecord => {
                let group =
                    self.groups.get(&log.time_group)?.ok_or(BudgetError::EntryDoesNotExist)?;
                let item = log.timeframe_body()?;
                let frame = group.get_or_insert_timeframe(item.time_bucket, item.token_count);
                frame.apply(item.token_count, item.active_token_count, item.active_transaction_id);
            }
            TimeframeManagerOperation::BatchUpdateTimeframeRecords => {
                let group =
                    self.groups.get(&log.time_group)?.ok_or(BudgetError::EntryDoesNotExist)?;
                for item in log.batch_body()?.items {
                    let frame = group.get_or_insert_timeframe(item.time_bucket, item.token_count);
                    frame.apply(item.token_count, item.active_token_count, item.active_transaction_id);
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
    use crate::domain::models::{reporting_time_for, TimeframeUpdate};

    struct Fixture {
        journal: Arc<MemoryJournal>,
        database: Arc<MemoryNoSqlDatabase>,
        manager: Arc<BudgetKeyTimeframeManager>,
    }

    fn fixture() -> Fixture {
        let journal = MemoryJournal::new();
        let database = MemoryNoSqlDatabase::new();
        let manager = BudgetKeyTimeframeManager::new(
            Uuid::new_v4(),
            "campaign-7".to_string(),
            journal.clone(),
            database.clone(),
            &PbsConfig::default(),
        );
        Fixture { journal, database, manager }
    }

    fn load_request(time_group: TimeGroup, buckets: &[TimeBucket]) -> LoadTimeframesRequest {
        LoadTimeframesRequest {
            reporting_times: buckets.iter().map(|b| reporting_time_for(time_group, *b)).collect(),
        }
    }

    #[tokio::test]
    async fn test_load_validations() {
        let f = fixture();

        let err = f.manager.load(LoadTimeframesRequest { reporting_times: vec![] }).await;
        assert_eq!(err, Err(BudgetError::EmptyRequest));

        let err = f
            .manager
            .load(LoadTimeframesRequest {
                reporting_times: vec![reporting_time_for(1, 0), reporting_time_for(2, 0)],
            })
            .await;
        assert_eq!(err, Err(BudgetError::MultipleTimeframeGroups));

        let err = f
            .manager
            .load(LoadTimeframesRequest {
                reporting_times: vec![reporting_time_for(1, 3), reporting_time_for(1, 3) + 59],
            })
            .await;
        assert_eq!(err, Err(BudgetError::RepeatedTimeBuckets));
    }

    #[tokio::test]
    async fn test_load_fresh_day_starts_at_full_balance() {
        let f = fixture();
        let response = f.manager.load(load_request(19218, &[0, 5])).await.unwrap();
        assert_eq!(response.timeframes.len(), 2);
        assert_eq!(response.timeframes[0].token_count(), 24);
        assert_eq!(response.timeframes[1].token_count(), 24);

        // The group snapshot was journaled so later update records replay.
        assert_eq!(f.journal.store().len(), 1);
        let log = TimeframeManagerLogV1::decode(&f.journal.store().entries()[0].bytes).unwrap();
        assert_eq!(log.operation, TimeframeManagerOperation::InsertTimegroupIntoCache);
        assert_eq!(log.group_body().unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_day_extends_bucket_by_bucket() {
        let f = fixture();

        // Separate single-bucket requests against the same fresh day, the
        // way get_budget and the single-variant protocol address hours.
        let first = f.manager.load(load_request(19218, &[0])).await.unwrap();
        assert_eq!(first.timeframes[0].token_count(), 24);
        first.timeframes[0].apply(20, 0, Uuid::nil());

        let second = f.manager.load(load_request(19218, &[1])).await.unwrap();
        assert_eq!(second.timeframes[0].token_count(), 24);

        // The earlier bucket kept its state across the extension.
        let both = f.manager.load(load_request(19218, &[0, 1])).await.unwrap();
        assert_eq!(both.timeframes[0].token_count(), 20);
        assert_eq!(both.timeframes[1].token_count(), 24);

        // Each extension journaled a refreshed group snapshot.
        let entries = f.journal.store().entries();
        assert_eq!(entries.len(), 2);
        let log = TimeframeManagerLogV1::decode(&entries.last().unwrap().bytes).unwrap();
        assert_eq!(log.operation, TimeframeManagerOperation::InsertTimegroupIntoCache);
        assert_eq!(log.group_body().unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn test_load_from_stored_row_installs_all_buckets_and_journals() {
        let f = fixture();
        let mut cells: Vec<String> = vec!["24".to_string(); 24];
        cells[0] = "7".to_string();
        f.database.seed_row(
            "PBS_BudgetKeys",
            "campaign-7",
            "19218",
            vec![ItemAttribute::new(TOKEN_COUNT_ATTRIBUTE, cells.join(" "))],
        );

        let response = f.manager.load(load_request(19218, &[0])).await.unwrap();
        assert_eq!(response.timeframes[0].token_count(), 7);

        // The whole day is now cached and a group snapshot was journaled.
        let again = f.manager.load(load_request(19218, &[23])).await.unwrap();
        assert_eq!(again.timeframes[0].token_count(), 24);
        assert_eq!(f.journal.store().len(), 1);
    }

    #[tokio::test]
    async fn test_load_corrupted_rows() {
        let f = fixture();
        for bad in ["1 2 3", "24 24 x 24", ""] {
            let sort = "19218";
            f.database.seed_row(
                "PBS_BudgetKeys",
                "campaign-7",
                sort,
                vec![ItemAttribute::new(TOKEN_COUNT_ATTRIBUTE, bad)],
            );
            let result = f.manager.load(load_request(19218, &[0])).await;
            assert_eq!(result, Err(BudgetError::CorruptedKeyMetadata), "for {bad:?}");
        }

        // Wrong attribute name is corrupt too.
        f.database.seed_row(
            "PBS_BudgetKeys",
            "campaign-7",
            "19219",
            vec![ItemAttribute::new("Tokens", "24 24")],
        );
        let result = f.manager.load(load_request(19219, &[0])).await;
        assert_eq!(result, Err(BudgetError::CorruptedKeyMetadata));
    }

    #[tokio::test]
    async fn test_database_error_hands_loader_role_back() {
        let f = fixture();
        f.database.fail_gets_with(Some(BudgetError::DatabaseUnavailable("throttled".into())));
        let result = f.manager.load(load_request(1, &[0])).await;
        assert_eq!(result, Err(BudgetError::DatabaseUnavailable("throttled".into())));

        // The failed loader handed the role back; the next caller takes it.
        f.database.fail_gets_with(None);
        let response = f.manager.load(load_request(1, &[0])).await.unwrap();
        assert_eq!(response.timeframes[0].token_count(), 24);
    }

    #[tokio::test]
    async fn test_update_journals_then_applies() {
        let f = fixture();
        f.manager.load(load_request(1, &[0, 2])).await.unwrap();
        let txn = Uuid::new_v4();

        f.manager
            .update(UpdateTimeframesRequest {
                timeframes_to_update: vec![
                    TimeframeUpdate {
                        reporting_time: reporting_time_for(1, 0),
                        active_transaction_id: txn,
                        active_token_count: 3,
                        token_count: 24,
                    },
                    TimeframeUpdate {
                        reporting_time: reporting_time_for(1, 2),
                        active_transaction_id: txn,
                        active_token_count: 1,
                        token_count: 24,
                    },
                ],
            })
            .await
            .unwrap();

        let response = f.manager.load(load_request(1, &[0, 2])).await.unwrap();
        assert_eq!(response.timeframes[0].active_token_count(), 3);
        assert_eq!(response.timeframes[1].active_token_count(), 1);
        assert_eq!(response.timeframes[0].active_transaction_id(), txn);

        // One batch record was appended after the load-time group snapshot.
        assert_eq!(f.journal.store().len(), 2);
        let entries = f.journal.store().entries();
        let log = TimeframeManagerLogV1::decode(&entries.last().unwrap().bytes).unwrap();
        assert_eq!(log.operation, TimeframeManagerOperation::BatchUpdateTimeframeRecords);
    }

    #[tokio::test]
    async fn test_update_single_uses_single_record() {
        let f = fixture();
        f.manager.load(load_request(1, &[4])).await.unwrap();

        f.manager
            .update(UpdateTimeframesRequest {
                timeframes_to_update: vec![TimeframeUpdate {
                    reporting_time: reporting_time_for(1, 4),
                    active_transaction_id: Uuid::nil(),
                    active_token_count: 0,
                    token_count: 20,
                }],
            })
            .await
            .unwrap();

        let entries = f.journal.store().entries();
        let log = TimeframeManagerLogV1::decode(&entries.last().unwrap().bytes).unwrap();
        assert_eq!(log.operation, TimeframeManagerOperation::UpdateTimeframeRecord);
        assert_eq!(log.timeframe_body().unwrap().token_count, 20);
    }

    #[tokio::test]
    async fn test_update_failure_leaves_memory_untouched() {
        let f = fixture();
        f.manager.load(load_request(1, &[0])).await.unwrap();
        f.journal.fail_appends_with(Some(BudgetError::JournalFailure("disk".into())));

        let result = f
            .manager
            .update(UpdateTimeframesRequest {
                timeframes_to_update: vec![TimeframeUpdate {
                    reporting_time: reporting_time_for(1, 0),
                    active_transaction_id: Uuid::new_v4(),
                    active_token_count: 9,
                    token_count: 9,
                }],
            })
            .await;
        assert_eq!(result, Err(BudgetError::JournalFailure("disk".into())));

        let response = f.manager.load(load_request(1, &[0])).await.unwrap();
        assert_eq!(response.timeframes[0].token_count(), 24);
        assert_eq!(response.timeframes[0].active_token_count(), 0);
    }

    #[tokio::test]
    async fn test_update_unknown_group_or_bucket() {
        let f = fixture();
        let update = UpdateTimeframesRequest {
            timeframes_to_update: vec![TimeframeUpdate {
                reporting_time: reporting_time_for(9, 0),
                active_transaction_id: Uuid::nil(),
                active_token_count: 0,
                token_count: 1,
            }],
        };
        assert_eq!(f.manager.update(update.clone()).await, Err(BudgetError::EntryDoesNotExist));

        // Group cached, bucket absent.
        f.manager.load(load_request(9, &[5])).await.unwrap();
        assert_eq!(f.manager.update(update).await, Err(BudgetError::EntryDoesNotExist));
    }

    #[tokio::test]
    async fn test_eviction_refused_while_transaction_active() {
        let f = fixture();
        let response = f.manager.load(load_request(19218, &[0])).await.unwrap();
        response.timeframes[0].try_acquire(Uuid::new_v4());

        let (_, group) = &f.manager.groups.snapshot()[0];
        let allowed =
            CacheEvictor::on_before_eviction(&*f.manager, &19218, group).await;
        assert!(!allowed);
        assert!(f.database.row("PBS_BudgetKeys", "campaign-7", "19218").is_none());
    }

    #[tokio::test]
    async fn test_eviction_writes_back_and_journals_removal() {
        let f = fixture();
        let response = f.manager.load(load_request(19218, &[0])).await.unwrap();
        response.timeframes[0].apply(23, 0, Uuid::nil());

        let (_, group) = &f.manager.groups.snapshot()[0];
        let allowed =
            CacheEvictor::on_before_eviction(&*f.manager, &19218, group).await;
        assert!(allowed);

        let row = f.database.row("PBS_BudgetKeys", "campaign-7", "19218").unwrap();
        let expected = std::iter::once("23".to_string())
            .chain(std::iter::repeat("24".to_string()).take(23))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(row, vec![ItemAttribute::new(TOKEN_COUNT_ATTRIBUTE, expected)]);

        let entries = f.journal.store().entries();
        let log = TimeframeManagerLogV1::decode(&entries.last().unwrap().bytes).unwrap();
        assert_eq!(log.operation, TimeframeManagerOperation::RemoveTimegroupFromCache);
    }

    #[tokio::test]
    async fn test_eviction_refused_when_write_back_fails() {
        let f = fixture();
        f.manager.load(load_request(19218, &[0])).await.unwrap();
        f.database.fail_upserts_with(Some(BudgetError::DatabaseUnavailable("throttled".into())));

        let (_, group) = &f.manager.groups.snapshot()[0];
        let allowed =
            CacheEvictor::on_before_eviction(&*f.manager, &19218, group).await;
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_replay_insert_then_update_then_remove() {
        let f = fixture();
        let txn = Uuid::new_v4();

        let insert = TimeframeManagerLogV1::insert_timegroup(
            7,
            &TimeframeGroupLogV1 {
                items: vec![TimeframeLogV1 {
                    time_bucket: 0,
                    token_count: 24,
                    active_token_count: 0,
                    active_transaction_id: Uuid::nil(),
                }],
            },
        )
        .unwrap();
        f.manager.on_journal_replay(&insert.encode().unwrap()).await.unwrap();

        let update = TimeframeManagerLogV1::update_timeframe(
            7,
            &TimeframeLogV1 {
                time_bucket: 0,
                token_count: 24,
                active_token_count: 2,
                active_transaction_id: txn,
            },
        )
        .unwrap();
        f.manager.on_journal_replay(&update.encode().unwrap()).await.unwrap();

        let group = f.manager.groups.get(&7).unwrap().unwrap();
        assert!(group.load_state.is_loaded());
        let frame = group.timeframe(0).unwrap();
        assert_eq!(frame.active_token_count(), 2);
        assert_eq!(frame.active_transaction_id(), txn);

        let remove = TimeframeManagerLogV1::remove_timegroup(7);
        f.manager.on_journal_replay(&remove.encode().unwrap()).await.unwrap();
        assert!(f.manager.groups.get(&7).unwrap().is_none());

        // Removing an absent group is a noop.
        let remove = TimeframeManagerLogV1::remove_timegroup(7);
        f.manager.on_journal_replay(&remove.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_update_without_group_fails() {
        let f = fixture();
        let update = TimeframeManagerLogV1::update_timeframe(
            3,
            &TimeframeLogV1 {
                time_bucket: 1,
                token_count: 10,
                active_token_count: 0,
                active_transaction_id: Uuid::nil(),
            },
        )
        .unwrap();
        let result = f.manager.on_journal_replay(&update.encode().unwrap()).await;
        assert_eq!(result, Err(BudgetError::EntryDoesNotExist));
    }

    #[tokio::test]
    async fn test_replay_update_leaves_is_loaded_clear() {
        let f = fixture();
        let insert = TimeframeManagerLogV1::insert_timegroup(
            2,
            &TimeframeGroupLogV1 { items: vec![] },
        )
        .unwrap();
        // An empty snapshot still marks the group loaded; an empty body does not decode.
        f.manager.on_journal_replay(&insert.encode().unwrap()).await.unwrap();

        // A group created by update replay only must stay unloaded.
        f.manager.groups.get_or_insert_with(5, || BudgetKeyTimeframeGroup::new(5)).unwrap();
        let update = TimeframeManagerLogV1::update_timeframe(
            5,
            &TimeframeLogV1 {
                time_bucket: 0,
                token_count: 20,
                active_token_count: 0,
                active_transaction_id: Uuid::nil(),
            },
        )
        .unwrap();
        f.manager.on_journal_replay(&update.encode().unwrap()).await.unwrap();
        let group = f.manager.groups.get(&5).unwrap().unwrap();
        assert!(!group.load_state.is_loaded());
        assert_eq!(group.timeframe(0).unwrap().token_count(), 20);
    }

    #[tokio::test]
    async fn test_replay_insert_with_empty_body_is_corrupt() {
        let f = fixture();
        let log = TimeframeManagerLogV1 {
            time_group: 1,
            operation: TimeframeManagerOperation::InsertTimegroupIntoCache,
            log_body: Vec::new(),
        };
        let result = f.manager.on_journal_replay(&log.encode().unwrap()).await;
        assert_eq!(result, Err(BudgetError::CorruptedKeyMetadata));
    }

    #[tokio::test]
    async fn test_checkpoint_replays_into_equivalent_manager() {
        let f = fixture();
        let txn = Uuid::new_v4();
        let response = f.manager.load(load_request(19218, &[0, 3])).await.unwrap();
        response.timeframes[0].apply(20, 4, txn);

        let mut logs = Vec::new();
        f.manager.checkpoint(&mut logs).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].component_id, f.manager.id());

        let other = fixture();
        other.manager.on_journal_replay(&logs[0].bytes).await.unwrap();

        let group = other.manager.groups.get(&19218).unwrap().unwrap();
        assert_eq!(group.snapshot(), f.manager.groups.get(&19218).unwrap().unwrap().snapshot());
    }

    #[tokio::test]
    async fn test_can_unload() {
        let f = fixture();
        assert!(f.manager.can_unload());

        let response = f.manager.load(load_request(1, &[0])).await.unwrap();
        assert!(f.manager.can_unload());

        response.timeframes[0].try_acquire(Uuid::new_v4());
        assert!(!f.manager.can_unload());
    }
}
