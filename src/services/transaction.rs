//! Consume-budget transaction protocols.
//!
//! Two flavors over the same four-phase state machine: Prepare checks the
//! balance without mutating, Commit takes the per-timeframe lock and journals
//! the tentative consumption, Notify converts it into a committed deduction,
//! Abort releases the tentative state. Notify and Abort silently skip
//! timeframes not locked by the calling transaction, so late or duplicate
//! deliveries are harmless.
//!
//! Batch commits acquire locks in request order and callers must submit
//! buckets sorted ascending; overlapping transactions therefore contend on
//! the shared prefix instead of deadlocking.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::models::{
    AbortBatchConsumeBudgetRequest, AbortConsumeBudgetRequest, BudgetKeyTimeframe,
    CommitBatchConsumeBudgetRequest, CommitConsumeBudgetRequest, LoadTimeframesRequest,
    LockAcquire, NotifyBatchConsumeBudgetRequest, NotifyConsumeBudgetRequest,
    PrepareBatchConsumeBudgetRequest, PrepareConsumeBudgetRequest, TimeframeUpdate,
    Timestamp, UpdateTimeframesRequest,
};

use super::timeframe_manager::BudgetKeyTimeframeManager;

fn validate_transaction_id(transaction_id: Uuid) -> BudgetResult<()> {
    if transaction_id.is_nil() {
        return Err(BudgetError::InvalidTransactionId);
    }
    Ok(())
}

async fn load_frames(
    manager: &BudgetKeyTimeframeManager,
    reporting_times: Vec<Timestamp>,
) -> BudgetResult<Vec<Arc<BudgetKeyTimeframe>>> {
    Ok(manager.load(LoadTimeframesRequest { reporting_times }).await?.timeframes)
}

// ============================================================================
// Single-timeframe protocol
// ============================================================================

/// Consume-budget 2PC over a single timeframe.
pub struct ConsumeBudgetTransactionProtocol {
    manager: Arc<BudgetKeyTimeframeManager>,
}

impl ConsumeBudgetTransactionProtocol {
    pub fn new(manager: Arc<BudgetKeyTimeframeManager>) -> Self {
        Self { manager }
    }

    /// Advisory balance check. Takes no lock; two prepares may both succeed
    /// even though only one later commit can win.
    pub async fn prepare(&self, request: PrepareConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        let frames = load_frames(&self.manager, vec![request.reporting_time]).await?;
        let frame = &frames[0];

        if frame.is_locked() && !frame.is_locked_by(request.transaction_id) {
            return Err(BudgetError::ActiveTransactionInProgress);
        }
        if request.token_count > frame.token_count() {
            return Err(BudgetError::InsufficientBudget { failed_indices: vec![] });
        }
        Ok(())
    }

    /// Takes the timeframe lock for the transaction and journals the
    /// tentative consumption. A commit from the lock holder is accepted
    /// again and overwrites the tentative amount.
    pub async fn commit(&self, request: CommitConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        let frames = load_frames(&self.manager, vec![request.reporting_time]).await?;
        let frame = &frames[0];

        let acquired = frame.try_acquire(request.transaction_id);
        if acquired == LockAcquire::HeldByOther {
            return Err(BudgetError::ActiveTransactionInProgress);
        }
        if request.token_count > frame.token_count() {
            frame.release(request.transaction_id);
            return Err(BudgetError::InsufficientBudget { failed_indices: vec![] });
        }

        let update = UpdateTimeframesRequest {
            timeframes_to_update: vec![TimeframeUpdate {
                reporting_time: request.reporting_time,
                active_transaction_id: request.transaction_id,
                active_token_count: request.token_count,
                token_count: frame.token_count(),
            }],
        };
        if let Err(err) = self.manager.update(update).await {
            frame.release(request.transaction_id);
            return Err(err);
        }
        debug!(transaction_id = %request.transaction_id, "budget consumption committed");
        Ok(())
    }

    /// Converts the tentative consumption into a committed deduction. A
    /// timeframe not locked by the transaction is skipped silently.
    pub async fn notify(&self, request: NotifyConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        let frames = load_frames(&self.manager, vec![request.reporting_time]).await?;
        let frame = &frames[0];

        if !frame.is_locked_by(request.transaction_id) {
            return Ok(());
        }
        let update = UpdateTimeframesRequest {
            timeframes_to_update: vec![TimeframeUpdate {
                reporting_time: request.reporting_time,
                active_transaction_id: Uuid::nil(),
                active_token_count: 0,
                token_count: frame.token_count() - frame.active_token_count(),
            }],
        };
        self.manager.update(update).await
    }

    /// Releases the tentative state without touching the committed balance.
    /// A timeframe not locked by the transaction is skipped silently.
    pub async fn abort(&self, request: AbortConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        let frames = load_frames(&self.manager, vec![request.reporting_time]).await?;
        let frame = &frames[0];

        if !frame.is_locked_by(request.transaction_id) {
            return Ok(());
        }
        let update = UpdateTimeframesRequest {
            timeframes_to_update: vec![TimeframeUpdate {
                reporting_time: request.reporting_time,
                active_transaction_id: Uuid::nil(),
                active_token_count: 0,
                token_count: frame.token_count(),
            }],
        };
        self.manager.update(update).await
    }
}

// ============================================================================
// Batch protocol
// ============================================================================

/// Consume-budget 2PC over multiple timeframes of one time group.
pub struct BatchConsumeBudgetTransactionProtocol {
    manager: Arc<BudgetKeyTimeframeManager>,
}

impl BatchConsumeBudgetTransactionProtocol {
    pub fn new(manager: Arc<BudgetKeyTimeframeManager>) -> Self {
        Self { manager }
    }

    /// Advisory balance check over all requested buckets. Reports every
    /// failing index at once so the caller can reshape the batch.
    pub async fn prepare(&self, request: PrepareBatchConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        if request.budget_consumptions.is_empty() {
            return Err(BudgetError::BatchHasNoBudgets);
        }

        let times: Vec<Timestamp> =
            request.budget_consumptions.iter().map(|c| c.reporting_time).collect();
        let frames = load_frames(&self.manager, times).await?;

        let mut failed_indices = Vec::new();
        for (index, (frame, consumption)) in
            frames.iter().zip(request.budget_consumptions.iter()).enumerate()
        {
            if frame.is_locked() && !frame.is_locked_by(request.transaction_id) {
                return Err(BudgetError::ActiveTransactionInProgress);
            }
            if consumption.token_count > frame.token_count() {
                failed_indices.push(index);
            }
        }
        if !failed_indices.is_empty() {
            return Err(BudgetError::InsufficientBudget { failed_indices });
        }
        Ok(())
    }

    /// Acquires every timeframe lock in request order, then journals the
    /// batch of tentative consumptions. Any failure releases the locks this
    /// call acquired.
    pub async fn commit(&self, request: CommitBatchConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        if request.budget_consumptions.is_empty() {
            return Err(BudgetError::BatchHasNoBudgets);
        }
        if !request
            .budget_consumptions
            .windows(2)
            .all(|pair| pair[0].reporting_time < pair[1].reporting_time)
        {
            return Err(BudgetError::BatchInvalidOrder);
        }

        let times: Vec<Timestamp> =
            request.budget_consumptions.iter().map(|c| c.reporting_time).collect();
        let frames = load_frames(&self.manager, times).await?;

        // Lock acquisition, in request order. Reentrant holds are accepted
        // but only locks taken by this call are released on failure.
        let mut acquired: Vec<&Arc<BudgetKeyTimeframe>> = Vec::new();
        for frame in &frames {
            match frame.try_acquire(request.transaction_id) {
                LockAcquire::Acquired => acquired.push(frame),
                LockAcquire::Reentrant => {}
                LockAcquire::HeldByOther => {
                    for locked in &acquired {
                        locked.release(request.transaction_id);
                    }
                    return Err(BudgetError::ActiveTransactionInProgress);
                }
            }
        }

        let failed_indices: Vec<usize> = frames
            .iter()
            .zip(request.budget_consumptions.iter())
            .enumerate()
            .filter(|(_, (frame, consumption))| consumption.token_count > frame.token_count())
            .map(|(index, _)| index)
            .collect();
        if !failed_indices.is_empty() {
            for frame in &frames {
                frame.release(request.transaction_id);
            }
            return Err(BudgetError::InsufficientBudget { failed_indices });
        }

        let update = UpdateTimeframesRequest {
            timeframes_to_update: frames
                .iter()
                .zip(request.budget_consumptions.iter())
                .map(|(frame, consumption)| TimeframeUpdate {
                    reporting_time: consumption.reporting_time,
                    active_transaction_id: request.transaction_id,
                    active_token_count: consumption.token_count,
                    token_count: frame.token_count(),
                })
                .collect(),
        };
        if let Err(err) = self.manager.update(update).await {
            for frame in &frames {
                frame.release(request.transaction_id);
            }
            return Err(err);
        }
        debug!(transaction_id = %request.transaction_id,
            buckets = request.budget_consumptions.len(), "batch budget consumption committed");
        Ok(())
    }

    /// Converts tentative consumptions into committed deductions, skipping
    /// timeframes the transaction does not hold.
    pub async fn notify(&self, request: NotifyBatchConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        self.settle(request.transaction_id, request.reporting_times, true).await
    }

    /// Releases tentative consumptions, leaving committed balances as they
    /// were. Skips timeframes the transaction does not hold.
    pub async fn abort(&self, request: AbortBatchConsumeBudgetRequest) -> BudgetResult<()> {
        validate_transaction_id(request.transaction_id)?;
        self.settle(request.transaction_id, request.reporting_times, false).await
    }

    async fn settle(
        &self,
        transaction_id: Uuid,
        reporting_times: Vec<Timestamp>,
        deduct: bool,
    ) -> BudgetResult<()> {
        if reporting_times.is_empty() {
            return Err(BudgetError::EmptyRequest);
        }
        let frames = load_frames(&self.manager, reporting_times.clone()).await?;

        let staged: Vec<TimeframeUpdate> = frames
            .iter()
            .zip(reporting_times)
            .filter(|(frame, _)| frame.is_locked_by(transaction_id))
            .map(|(frame, reporting_time)| TimeframeUpdate {
                reporting_time,
                active_transaction_id: Uuid::nil(),
                active_token_count: 0,
                token_count: if deduct {
                    frame.token_count() - frame.active_token_count()
                } else {
                    frame.token_count()
                },
            })
            .collect();

        if staged.is_empty() {
            return Ok(());
        }
        self.manager.update(UpdateTimeframesRequest { timeframes_to_update: staged }).await
    }
}
