//! Budget-key timeframes.
//!
//! A timeframe holds one hour's worth of tokens for one key. Timeframes of
//! the same day are collected into a [`BudgetKeyTimeframeGroup`]. The
//! `active_transaction_id` field doubles as the per-timeframe transaction
//! lock: the nil uuid means unlocked, anything else names the transaction
//! that owns the frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use uuid::Uuid;

use super::load_state::LoadState;
use super::time::{TimeBucket, TimeGroup, TokenCount};

/// Outcome of attempting to take the timeframe lock for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    /// The lock transitioned from unlocked to this transaction.
    Acquired,
    /// The transaction already held the lock.
    Reentrant,
    /// A different transaction holds the lock.
    HeldByOther,
}

/// Plain-data view of a timeframe, used for journaling and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeframeSnapshot {
    pub time_bucket: TimeBucket,
    pub token_count: TokenCount,
    pub active_token_count: TokenCount,
    pub active_transaction_id: Uuid,
}

/// One hour of budget for one key.
#[derive(Debug)]
pub struct BudgetKeyTimeframe {
    time_bucket_index: TimeBucket,
    token_count: AtomicU64,
    active_token_count: AtomicU64,
    // Guards lock transitions and whole-frame updates; never held across await.
    active_transaction_id: Mutex<Uuid>,
}

impl BudgetKeyTimeframe {
    pub fn new(time_bucket_index: TimeBucket, token_count: TokenCount) -> Self {
        Self {
            time_bucket_index,
            token_count: AtomicU64::new(token_count),
            active_token_count: AtomicU64::new(0),
            active_transaction_id: Mutex::new(Uuid::nil()),
        }
    }

    pub fn time_bucket_index(&self) -> TimeBucket {
        self.time_bucket_index
    }

    /// Committed remaining tokens.
    pub fn token_count(&self) -> TokenCount {
        self.token_count.load(Ordering::SeqCst)
    }

    /// Tokens tentatively consumed by the lock holder.
    pub fn active_token_count(&self) -> TokenCount {
        self.active_token_count.load(Ordering::SeqCst)
    }

    /// Current lock holder; nil means unlocked.
    pub fn active_transaction_id(&self) -> Uuid {
        *self.active_transaction_id.lock().unwrap()
    }

    pub fn is_locked(&self) -> bool {
        !self.active_transaction_id().is_nil()
    }

    pub fn is_locked_by(&self, transaction_id: Uuid) -> bool {
        self.active_transaction_id() == transaction_id
    }

    /// Attempts the `nil -> transaction_id` lock transition. A frame already
    /// locked by the same transaction is accepted as reentrant.
    pub fn try_acquire(&self, transaction_id: Uuid) -> LockAcquire {
        let mut holder = self.active_transaction_id.lock().unwrap();
        if holder.is_nil() {
            *holder = transaction_id;
            LockAcquire::Acquired
        } else if *holder == transaction_id {
            LockAcquire::Reentrant
        } else {
            LockAcquire::HeldByOther
        }
    }

    /// Releases the lock if held by `transaction_id`, clearing the tentative
    /// token count. Returns true if the lock was released.
    pub fn release(&self, transaction_id: Uuid) -> bool {
        let mut holder = self.active_transaction_id.lock().unwrap();
        if *holder == transaction_id {
            *holder = Uuid::nil();
            self.active_token_count.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Applies a logged update to all three mutable fields at once.
    pub fn apply(
        &self,
        token_count: TokenCount,
        active_token_count: TokenCount,
        active_transaction_id: Uuid,
    ) {
        let mut holder = self.active_transaction_id.lock().unwrap();
        self.token_count.store(token_count, Ordering::SeqCst);
        self.active_token_count.store(active_token_count, Ordering::SeqCst);
        *holder = active_transaction_id;
    }

    pub fn snapshot(&self) -> TimeframeSnapshot {
        let holder = self.active_transaction_id.lock().unwrap();
        TimeframeSnapshot {
            time_bucket: self.time_bucket_index,
            token_count: self.token_count.load(Ordering::SeqCst),
            active_token_count: self.active_token_count.load(Ordering::SeqCst),
            active_transaction_id: *holder,
        }
    }
}

/// A day's worth of timeframes for one key.
///
/// Structural edits go through the concurrent map; the loading lifecycle is
/// tracked by the embedded [`LoadState`] so that at most one caller loads
/// the group from storage at a time.
#[derive(Debug)]
pub struct BudgetKeyTimeframeGroup {
    time_group: TimeGroup,
    timeframes: DashMap<TimeBucket, std::sync::Arc<BudgetKeyTimeframe>>,
    pub load_state: LoadState,
}

impl BudgetKeyTimeframeGroup {
    pub fn new(time_group: TimeGroup) -> Self {
        Self { time_group, timeframes: DashMap::new(), load_state: LoadState::new() }
    }

    pub fn time_group(&self) -> TimeGroup {
        self.time_group
    }

    pub fn timeframe(&self, time_bucket: TimeBucket) -> Option<std::sync::Arc<BudgetKeyTimeframe>> {
        self.timeframes.get(&time_bucket).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, time_bucket: TimeBucket) -> bool {
        self.timeframes.contains_key(&time_bucket)
    }

    /// Inserts a timeframe, replacing any existing frame for the bucket.
    pub fn insert_timeframe(&self, timeframe: BudgetKeyTimeframe) -> std::sync::Arc<BudgetKeyTimeframe> {
        let frame = std::sync::Arc::new(timeframe);
        self.timeframes.insert(frame.time_bucket_index(), frame.clone());
        frame
    }

    /// Returns the frame for the bucket, creating it with the given initial
    /// balance when absent.
    pub fn get_or_insert_timeframe(
        &self,
        time_bucket: TimeBucket,
        initial_token_count: TokenCount,
    ) -> std::sync::Arc<BudgetKeyTimeframe> {
        self.timeframes
            .entry(time_bucket)
            .or_insert_with(|| {
                std::sync::Arc::new(BudgetKeyTimeframe::new(time_bucket, initial_token_count))
            })
            .value()
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.timeframes.is_empty()
    }

    /// True if any frame in the group is locked by a transaction.
    pub fn has_active_transaction(&self) -> bool {
        self.timeframes.iter().any(|entry| entry.value().is_locked())
    }

    /// Snapshot of every present frame, ordered by bucket.
    pub fn snapshot(&self) -> Vec<TimeframeSnapshot> {
        let mut items: Vec<TimeframeSnapshot> =
            self.timeframes.iter().map(|entry| entry.value().snapshot()).collect();
        items.sort_by_key(|item| item.time_bucket);
        items
    }
}
