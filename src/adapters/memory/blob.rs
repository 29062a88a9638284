//! In-memory blob store adapter.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::ports::BlobStore;

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
    fail_puts_with: Mutex<Option<BudgetError>>,
}

impl MemoryBlobStore {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn blob_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn fail_puts_with(&self, error: Option<BudgetError>) {
        *self.fail_puts_with.lock().unwrap() = error;
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn verify_writable(&self) -> BudgetResult<()> {
        if let Some(error) = self.fail_puts_with.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn put_blob(&self, blob_name: &str, bytes: Vec<u8>) -> BudgetResult<()> {
        if let Some(error) = self.fail_puts_with.lock().unwrap().clone() {
            return Err(error);
        }
        self.blobs.insert(blob_name.to_string(), bytes);
        Ok(())
    }

    async fn get_blob(&self, blob_name: &str) -> BudgetResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(blob_name).map(|b| b.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryBlobStore::new();
        store.put_blob("p/checkpoint_1", vec![1, 2]).await.unwrap();
        assert_eq!(store.get_blob("p/checkpoint_1").await.unwrap(), Some(vec![1, 2]));
        assert_eq!(store.get_blob("p/absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_failure_injection() {
        let store = MemoryBlobStore::new();
        store.fail_puts_with(Some(BudgetError::BlobUnavailable("throttled".into())));
        assert!(store.verify_writable().await.is_err());
        assert!(store.put_blob("x", vec![]).await.is_err());
    }
}
