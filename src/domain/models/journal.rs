//! Versioned journal log records.
//!
//! Every log body is a two-level envelope: an outer message carrying an
//! explicit `{major, minor}` version plus an opaque byte string, and a
//! version-specific inner message inside it. Only version `{1, 0}` is
//! accepted; any other version is rejected with
//! [`BudgetError::VersionIsInvalid`], without attempting to decode the body.
//!
//! Three envelope families exist: budget-key records (announcing a key's
//! timeframe-manager id), budget-key-provider records (cache load/delete),
//! and timeframe-manager records (group insert/remove and timeframe
//! updates).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::{BudgetError, BudgetResult};

use super::time::{TimeBucket, TimeGroup, TokenCount};
use super::timeframe::TimeframeSnapshot;

/// Monotone id assigned to appended journal records.
pub type JournalId = u64;

/// Envelope version. Only `{1, 0}` is currently in service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogVersion {
    pub major: u32,
    pub minor: u32,
}

impl LogVersion {
    pub const V1_0: Self = Self { major: 1, minor: 0 };

    pub fn is_supported(self) -> bool {
        self == Self::V1_0
    }
}

fn encode_message<T: Serialize>(message: &T) -> BudgetResult<Vec<u8>> {
    bincode::serialize(message).map_err(|_| BudgetError::LogSerializationFailed)
}

fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> BudgetResult<T> {
    bincode::deserialize(bytes).map_err(|_| BudgetError::LogDeserializationFailed)
}

/// Outer envelope shared by all three log families.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: LogVersion,
    log_body: Vec<u8>,
}

fn wrap<T: Serialize>(inner: &T) -> BudgetResult<Vec<u8>> {
    let log_body = encode_message(inner)?;
    encode_message(&Envelope { version: LogVersion::V1_0, log_body })
}

fn unwrap<T: DeserializeOwned>(bytes: &[u8]) -> BudgetResult<T> {
    let envelope: Envelope = decode_message(bytes)?;
    if !envelope.version.is_supported() {
        return Err(BudgetError::VersionIsInvalid);
    }
    decode_message(&envelope.log_body)
}

// ============================================================================
// Budget key records
// ============================================================================

/// Announces the timeframe-manager id bound to a budget key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetKeyLogV1 {
    pub timeframe_manager_id: Uuid,
}

impl BudgetKeyLogV1 {
    pub fn encode(&self) -> BudgetResult<Vec<u8>> {
        wrap(self)
    }

    pub fn decode(bytes: &[u8]) -> BudgetResult<Self> {
        unwrap(bytes)
    }
}

// ============================================================================
// Budget key provider records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetKeyProviderOperation {
    LoadIntoCache = 1,
    DeleteFromCache = 2,
}

/// Records a budget key entering or leaving the provider cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetKeyProviderLogV1 {
    pub id: Uuid,
    pub budget_key_name: String,
    pub operation: BudgetKeyProviderOperation,
}

impl BudgetKeyProviderLogV1 {
    pub fn encode(&self) -> BudgetResult<Vec<u8>> {
        wrap(self)
    }

    pub fn decode(bytes: &[u8]) -> BudgetResult<Self> {
        unwrap(bytes)
    }
}

// ============================================================================
// Timeframe manager records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeframeManagerOperation {
    InsertTimegroupIntoCache = 1,
    RemoveTimegroupFromCache = 2,
    UpdateTimeframeRecord = 3,
    BatchUpdateTimeframeRecords = 4,
}

/// One timeframe's full mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeLogV1 {
    pub time_bucket: TimeBucket,
    pub token_count: TokenCount,
    pub active_token_count: TokenCount,
    pub active_transaction_id: Uuid,
}

impl From<TimeframeSnapshot> for TimeframeLogV1 {
    fn from(snapshot: TimeframeSnapshot) -> Self {
        Self {
            time_bucket: snapshot.time_bucket,
            token_count: snapshot.token_count,
            active_token_count: snapshot.active_token_count,
            active_transaction_id: snapshot.active_transaction_id,
        }
    }
}

/// Multiple timeframe states of one group, one record per updated bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTimeframeLogV1 {
    pub items: Vec<TimeframeLogV1>,
}

/// Full snapshot of a timeframe group, sufficient to rebuild it in memory
/// without consulting the NoSQL store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeGroupLogV1 {
    pub items: Vec<TimeframeLogV1>,
}

/// A timeframe-manager mutation record. The inner `log_body` depends on the
/// operation: a [`TimeframeGroupLogV1`] for inserts, a [`TimeframeLogV1`]
/// for single updates, a [`BatchTimeframeLogV1`] for batch updates, and an
/// empty body for removals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeManagerLogV1 {
    pub time_group: TimeGroup,
    pub operation: TimeframeManagerOperation,
    pub log_body: Vec<u8>,
}

impl TimeframeManagerLogV1 {
    pub fn insert_timegroup(time_group: TimeGroup, group: &TimeframeGroupLogV1) -> BudgetResult<Self> {
        Ok(Self {
            time_group,
            operation: TimeframeManagerOperation::InsertTimegroupIntoCache,
            log_body: encode_message(group)?,
        })
    }

    pub fn remove_timegroup(time_group: TimeGroup) -> Self {
        Self {
            time_group,
            operation: TimeframeManagerOperation::RemoveTimegroupFromCache,
            log_body: Vec::new(),
        }
    }

    pub fn update_timeframe(time_group: TimeGroup, item: &TimeframeLogV1) -> BudgetResult<Self> {
        Ok(Self {
            time_group,
            operation: TimeframeManagerOperation::UpdateTimeframeRecord,
            log_body: encode_message(item)?,
        })
    }

    pub fn batch_update_timeframes(
        time_group: TimeGroup,
        batch: &BatchTimeframeLogV1,
    ) -> BudgetResult<Self> {
        Ok(Self {
            time_group,
            operation: TimeframeManagerOperation::BatchUpdateTimeframeRecords,
            log_body: encode_message(batch)?,
        })
    }

    pub fn group_body(&self) -> BudgetResult<TimeframeGroupLogV1> {
        decode_message(&self.log_body)
    }

    pub fn timeframe_body(&self) -> BudgetResult<TimeframeLogV1> {
        decode_message(&self.log_body)
    }

    pub fn batch_body(&self) -> BudgetResult<BatchTimeframeLogV1> {
        decode_message(&self.log_body)
    }

    pub fn encode(&self) -> BudgetResult<Vec<u8>> {
        wrap(self)
    }

    pub fn decode(bytes: &[u8]) -> BudgetResult<Self> {
        unwrap(bytes)
    }
}

// ============================================================================
// Checkpoint records
// ============================================================================

/// One component's worth of replayable state inside a checkpoint blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointLog {
    pub component_id: Uuid,
    pub log_id: Uuid,
    pub bytes: Vec<u8>,
}

/// Trailer of a checkpoint blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub last_processed_journal_id: JournalId,
}

/// Contents of the `last_checkpoint` pointer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCheckpointMetadata {
    pub last_checkpoint_id: u64,
}

/// A whole checkpoint blob: the collected component records followed by the
/// metadata trailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBlob {
    pub logs: Vec<CheckpointLog>,
    pub metadata: CheckpointMetadata,
}

impl CheckpointBlob {
    pub fn encode(&self) -> BudgetResult<Vec<u8>> {
        encode_message(self)
    }

    pub fn decode(bytes: &[u8]) -> BudgetResult<Self> {
        decode_message(bytes)
    }
}

impl LastCheckpointMetadata {
    pub fn encode(&self) -> BudgetResult<Vec<u8>> {
        encode_message(self)
    }

    pub fn decode(bytes: &[u8]) -> BudgetResult<Self> {
        decode_message(bytes)
    }
}
