//! Core domain models for the privacy-budget engine.

pub mod journal;
pub mod load_state;
pub mod requests;
pub mod time;
pub mod timeframe;

pub use journal::{
    BatchTimeframeLogV1, BudgetKeyLogV1, BudgetKeyProviderLogV1, BudgetKeyProviderOperation,
    CheckpointBlob, CheckpointLog, CheckpointMetadata, JournalId, LastCheckpointMetadata,
    LogVersion, TimeframeGroupLogV1, TimeframeLogV1, TimeframeManagerLogV1,
    TimeframeManagerOperation,
};
pub use load_state::LoadState;
pub use requests::{
    AbortBatchConsumeBudgetRequest, AbortConsumeBudgetRequest, BudgetConsumption, BudgetKeyName,
    CommitBatchConsumeBudgetRequest, CommitConsumeBudgetRequest, GetBudgetRequest,
    GetBudgetResponse, LoadTimeframesRequest, LoadTimeframesResponse,
    NotifyBatchConsumeBudgetRequest, NotifyConsumeBudgetRequest,
    PrepareBatchConsumeBudgetRequest, PrepareConsumeBudgetRequest, TimeframeUpdate,
    UpdateTimeframesRequest,
};
pub use time::{
    time_bucket_of, time_group_of, reporting_time_for, TimeBucket, TimeGroup, Timestamp,
    TokenCount, DEFAULT_MAX_TOKEN_COUNT, HOURS_PER_DAY, NANOS_PER_DAY, NANOS_PER_HOUR,
};
pub use timeframe::{BudgetKeyTimeframe, BudgetKeyTimeframeGroup, LockAcquire, TimeframeSnapshot};
