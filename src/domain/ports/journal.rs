//! Journal service port.
//!
//! The journal is the engine's write-ahead log. Components append opaque,
//! self-describing records under their component id; on recovery the journal
//! replays every record, in global append order, to the subscriber
//! registered for its component id. Subscribers may register while a replay
//! is in progress: a replayed provider record registers the budget key it
//! announces, whose own records follow later in the stream.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::error::BudgetResult;
use crate::domain::models::JournalId;

/// Receives replayed log records for one component id.
#[async_trait]
pub trait JournalSubscriber: Send + Sync {
    async fn on_journal_replay(&self, bytes: &[u8]) -> BudgetResult<()>;
}

/// Result of a journal recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Id of the last record visited, if any record was present.
    pub last_processed_journal_id: Option<JournalId>,
    /// Number of records replayed to a subscriber.
    pub replayed_count: u64,
}

/// Append-only log with per-component replay routing.
#[async_trait]
pub trait JournalService: Send + Sync {
    /// Durably appends a record for the given component. Records become
    /// visible to recovery in append order.
    async fn append(&self, component_id: Uuid, log_id: Uuid, bytes: Vec<u8>) -> BudgetResult<()>;

    /// Registers the replay subscriber for a component id, replacing any
    /// previous registration.
    fn register_subscriber(&self, component_id: Uuid, subscriber: std::sync::Arc<dyn JournalSubscriber>);

    /// Drops the replay subscriber for a component id.
    fn unregister_subscriber(&self, component_id: Uuid);

    /// Replays all records to their subscribers and reports the last
    /// processed record id. Subscriber errors abort the pass.
    async fn recover(&self) -> BudgetResult<RecoveryOutcome>;
}
