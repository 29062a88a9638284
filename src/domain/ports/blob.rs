//! Checkpoint blob store port.

use async_trait::async_trait;

use crate::domain::error::BudgetResult;

/// Flat blob storage for checkpoint artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Confirms the store accepts writes. Called once per checkpoint cycle
    /// before any work is done.
    async fn verify_writable(&self) -> BudgetResult<()>;

    /// Writes a blob, replacing any previous content under the name.
    async fn put_blob(&self, blob_name: &str, bytes: Vec<u8>) -> BudgetResult<()>;

    /// Reads a blob; `None` when absent.
    async fn get_blob(&self, blob_name: &str) -> BudgetResult<Option<Vec<u8>>>;
}
