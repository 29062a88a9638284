//! Request and response types for the budget-key data path.
//!
//! All timeframe-addressing fields carry reporting times (nanosecond
//! timestamps); the engine floors them to hourly buckets internally.

use std::sync::Arc;

use uuid::Uuid;

use super::time::{Timestamp, TokenCount};
use super::timeframe::BudgetKeyTimeframe;

/// Name a budget key is registered under. Unique within a partition.
pub type BudgetKeyName = String;

/// Loads the timeframes for the given reporting times. All times must fall
/// into the same time group and address pairwise distinct buckets.
#[derive(Debug, Clone)]
pub struct LoadTimeframesRequest {
    pub reporting_times: Vec<Timestamp>,
}

/// Loaded frames, in the order of the request's reporting times.
#[derive(Debug, Clone)]
pub struct LoadTimeframesResponse {
    pub timeframes: Vec<Arc<BudgetKeyTimeframe>>,
}

impl PartialEq for LoadTimeframesResponse {
    fn eq(&self, other: &Self) -> bool {
        self.timeframes.len() == other.timeframes.len()
            && self.timeframes.iter().zip(&other.timeframes).all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

/// Proposed state for one timeframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeframeUpdate {
    pub reporting_time: Timestamp,
    pub active_transaction_id: Uuid,
    pub active_token_count: TokenCount,
    pub token_count: TokenCount,
}

/// Journals and applies the given timeframe states. Subject to the same
/// validation as [`LoadTimeframesRequest`].
#[derive(Debug, Clone)]
pub struct UpdateTimeframesRequest {
    pub timeframes_to_update: Vec<TimeframeUpdate>,
}

/// Reads the committed token balance of one bucket.
#[derive(Debug, Clone)]
pub struct GetBudgetRequest {
    pub reporting_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBudgetResponse {
    pub token_count: TokenCount,
}

/// One bucket's worth of consumption in a batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetConsumption {
    pub reporting_time: Timestamp,
    pub token_count: TokenCount,
}

/// Single-timeframe 2PC requests. Prepare and Commit carry the amount to
/// consume; Notify and Abort only address the bucket.
#[derive(Debug, Clone)]
pub struct PrepareConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub reporting_time: Timestamp,
    pub token_count: TokenCount,
}

#[derive(Debug, Clone)]
pub struct CommitConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub reporting_time: Timestamp,
    pub token_count: TokenCount,
}

#[derive(Debug, Clone)]
pub struct NotifyConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub reporting_time: Timestamp,
}

#[derive(Debug, Clone)]
pub struct AbortConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub reporting_time: Timestamp,
}

/// Batch 2PC requests over multiple buckets of one time group.
/// `budget_consumptions` must be sorted by reporting time ascending for
/// Commit calls.
#[derive(Debug, Clone)]
pub struct PrepareBatchConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub budget_consumptions: Vec<BudgetConsumption>,
}

#[derive(Debug, Clone)]
pub struct CommitBatchConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub budget_consumptions: Vec<BudgetConsumption>,
}

#[derive(Debug, Clone)]
pub struct NotifyBatchConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub reporting_times: Vec<Timestamp>,
}

#[derive(Debug, Clone)]
pub struct AbortBatchConsumeBudgetRequest {
    pub transaction_id: Uuid,
    pub reporting_times: Vec<Timestamp>,
}
