//! Error types for the privacy-budget engine.
//!
//! All fallible operations return [`BudgetError`]. Every variant belongs to
//! one of four kinds: caller-side validation failures, transient conflicts
//! the caller may retry, budget denials, and durability or data faults.

use thiserror::Error;

/// How an error should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed; retrying the same request cannot succeed.
    Validation,
    /// A transient conflict; the same request may succeed if retried.
    Retry,
    /// A hard failure; not locally recoverable.
    Failure,
}

/// Errors surfaced by the budget-key data path and its durability layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    /// The request carried the zero transaction id.
    #[error("Transaction id must be non-zero")]
    InvalidTransactionId,

    /// The request addressed no reporting times.
    #[error("Request contains no reporting times")]
    EmptyRequest,

    /// Two request entries resolved to the same time bucket.
    #[error("Request repeats a time bucket")]
    RepeatedTimeBuckets,

    /// Request entries span more than one time group.
    #[error("Request spans multiple timeframe groups")]
    MultipleTimeframeGroups,

    /// A batch request carried no budgets to consume.
    #[error("Batch request has no budgets to consume")]
    BatchHasNoBudgets,

    /// Batch commit entries were not sorted by time bucket ascending.
    #[error("Batch request buckets are not in ascending order")]
    BatchInvalidOrder,

    /// The cache entry is being loaded by another caller.
    #[error("Entry is loading")]
    EntryIsLoading,

    /// The cache entry is being garbage collected.
    #[error("Entry is being deleted")]
    EntryBeingDeleted,

    /// Another transaction holds the timeframe lock.
    #[error("Another transaction is in progress on the timeframe")]
    ActiveTransactionInProgress,

    /// One or more buckets had fewer tokens than requested. The indices
    /// refer to entries of the originating batch request; empty for the
    /// single-timeframe protocol.
    #[error("Insufficient budget")]
    InsufficientBudget { failed_indices: Vec<usize> },

    /// A log envelope carried an unsupported version.
    #[error("Log version is invalid")]
    VersionIsInvalid,

    /// A log body could not be decoded.
    #[error("Log deserialization failed")]
    LogDeserializationFailed,

    /// A log body could not be encoded.
    #[error("Log serialization failed")]
    LogSerializationFailed,

    /// A replayed log record was structurally invalid for its operation.
    #[error("Invalid log record")]
    InvalidLog,

    /// The stored row for a key and day was malformed.
    #[error("Corrupted key metadata")]
    CorruptedKeyMetadata,

    /// The addressed cache entry does not exist.
    #[error("Entry does not exist")]
    EntryDoesNotExist,

    /// A replayed load record named a key already cached under a different id.
    #[error("Cached key id conflicts with logged id")]
    KeyIdConflict,

    /// The journal holds no records to recover from.
    #[error("No logs to process")]
    NoLogsToProcess,

    /// The journal rejected an append transiently.
    #[error("Journal unavailable: {0}")]
    JournalUnavailable(String),

    /// The journal failed an append permanently.
    #[error("Journal failure: {0}")]
    JournalFailure(String),

    /// The NoSQL store rejected a request transiently.
    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    /// The NoSQL store failed a request permanently.
    #[error("Database failure: {0}")]
    DatabaseFailure(String),

    /// The blob store rejected a request transiently.
    #[error("Blob storage unavailable: {0}")]
    BlobUnavailable(String),

    /// The blob store failed a request permanently.
    #[error("Blob storage failure: {0}")]
    BlobFailure(String),
}

impl BudgetError {
    /// The handling kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransactionId
            | Self::EmptyRequest
            | Self::RepeatedTimeBuckets
            | Self::MultipleTimeframeGroups
            | Self::BatchHasNoBudgets
            | Self::BatchInvalidOrder => ErrorKind::Validation,

            Self::EntryIsLoading
            | Self::EntryBeingDeleted
            | Self::ActiveTransactionInProgress
            | Self::JournalUnavailable(_)
            | Self::DatabaseUnavailable(_)
            | Self::BlobUnavailable(_) => ErrorKind::Retry,

            Self::InsufficientBudget { .. }
            | Self::VersionIsInvalid
            | Self::LogDeserializationFailed
            | Self::LogSerializationFailed
            | Self::InvalidLog
            | Self::CorruptedKeyMetadata
            | Self::EntryDoesNotExist
            | Self::KeyIdConflict
            | Self::NoLogsToProcess
            | Self::JournalFailure(_)
            | Self::DatabaseFailure(_)
            | Self::BlobFailure(_) => ErrorKind::Failure,
        }
    }

    /// Returns true if the same request may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retry
    }

    /// Returns true if this error is a caller-side validation failure.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

/// Result alias used across the engine.
pub type BudgetResult<T> = Result<T, BudgetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_not_retryable() {
        assert!(BudgetError::InvalidTransactionId.is_validation());
        assert!(BudgetError::BatchInvalidOrder.is_validation());
        assert!(!BudgetError::EmptyRequest.is_retryable());
    }

    #[test]
    fn test_transient_conflicts_are_retryable() {
        assert!(BudgetError::EntryIsLoading.is_retryable());
        assert!(BudgetError::EntryBeingDeleted.is_retryable());
        assert!(BudgetError::ActiveTransactionInProgress.is_retryable());
        assert!(BudgetError::JournalUnavailable("backpressure".into()).is_retryable());
    }

    #[test]
    fn test_durability_faults_are_hard_failures() {
        assert_eq!(BudgetError::VersionIsInvalid.kind(), ErrorKind::Failure);
        assert_eq!(BudgetError::CorruptedKeyMetadata.kind(), ErrorKind::Failure);
        assert_eq!(
            BudgetError::InsufficientBudget { failed_indices: vec![0] }.kind(),
            ErrorKind::Failure
        );
    }

    #[test]
    fn test_insufficient_budget_carries_indices() {
        let err = BudgetError::InsufficientBudget { failed_indices: vec![0, 2] };
        match err {
            BudgetError::InsufficientBudget { failed_indices } => {
                assert_eq!(failed_indices, vec![0, 2]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BudgetError::ActiveTransactionInProgress.to_string(),
            "Another transaction is in progress on the timeframe"
        );
        assert_eq!(
            BudgetError::DatabaseUnavailable("timeout".into()).to_string(),
            "Database unavailable: timeout"
        );
    }
}
