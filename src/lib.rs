//! pbs-core - Privacy Budget Service core
//!
//! A transactional, crash-recoverable, in-memory budget accounting engine:
//! - Budget keys expose hourly token buckets over daily time groups
//! - Consumption runs under a two-phase-commit protocol with per-timeframe locks
//! - Every mutation is journaled before it becomes visible in memory
//! - Committed balances are written back to a NoSQL row on cache eviction
//! - A checkpoint service compacts the journal into replayable blobs

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::{BudgetError, BudgetResult, ErrorKind};
pub use infrastructure::PbsConfig;
pub use services::{BudgetKey, BudgetKeyProvider, CheckpointService};
