//! Engine configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::models::{TokenCount, DEFAULT_MAX_TOKEN_COUNT};

/// Runtime configuration for the budget engine.
///
/// Loaded from programmatic defaults overridden by `PBS_*` environment
/// variables (e.g. `PBS_BUDGET_KEY_TABLE_NAME`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbsConfig {
    /// NoSQL table holding committed per-day balances.
    #[serde(default = "default_table_name")]
    pub budget_key_table_name: String,

    /// Initial token balance of a freshly created hourly timeframe.
    #[serde(default = "default_max_token_count")]
    pub max_token_count: TokenCount,

    /// Base delay of the journal-append retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum journal-append attempts.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Lifetime of an untouched timeframe group before eviction.
    #[serde(default = "default_timeframe_group_ttl_secs")]
    pub timeframe_group_ttl_secs: u64,

    /// Lifetime of an untouched budget key before eviction.
    #[serde(default = "default_budget_key_ttl_secs")]
    pub budget_key_ttl_secs: u64,

    /// Interval between cache eviction sweeps, in milliseconds.
    #[serde(default = "default_cache_sweep_interval_ms")]
    pub cache_sweep_interval_ms: u64,

    /// Bucket checkpoint blobs are stored in.
    #[serde(default = "default_checkpoint_bucket_name")]
    pub checkpoint_bucket_name: String,

    /// Partition prefix of checkpoint blob names.
    #[serde(default = "default_checkpoint_partition_name")]
    pub checkpoint_partition_name: String,
}

fn default_table_name() -> String {
    "PBS_BudgetKeys".to_string()
}

fn default_max_token_count() -> TokenCount {
    DEFAULT_MAX_TOKEN_COUNT
}

fn default_retry_base_delay_ms() -> u64 {
    31
}

fn default_retry_max_attempts() -> u32 {
    12
}

fn default_timeframe_group_ttl_secs() -> u64 {
    100
}

fn default_budget_key_ttl_secs() -> u64 {
    300
}

fn default_cache_sweep_interval_ms() -> u64 {
    1_000
}

fn default_checkpoint_bucket_name() -> String {
    "pbs-checkpoints".to_string()
}

fn default_checkpoint_partition_name() -> String {
    "partition-0".to_string()
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            budget_key_table_name: default_table_name(),
            max_token_count: default_max_token_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            timeframe_group_ttl_secs: default_timeframe_group_ttl_secs(),
            budget_key_ttl_secs: default_budget_key_ttl_secs(),
            cache_sweep_interval_ms: default_cache_sweep_interval_ms(),
            checkpoint_bucket_name: default_checkpoint_bucket_name(),
            checkpoint_partition_name: default_checkpoint_partition_name(),
        }
    }
}

impl PbsConfig {
    /// Load configuration: defaults, then `PBS_*` environment overrides.
    pub fn load() -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("PBS_"))
            .extract()
            .context("failed to load PBS configuration")
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn timeframe_group_ttl(&self) -> Duration {
        Duration::from_secs(self.timeframe_group_ttl_secs)
    }

    pub fn budget_key_ttl(&self) -> Duration {
        Duration::from_secs(self.budget_key_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }
}
