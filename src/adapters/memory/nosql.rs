//! In-memory NoSQL database adapter.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::error::{BudgetError, BudgetResult};
use crate::domain::ports::{GetItemRequest, Item, ItemAttribute, NoSqlDatabase, UpsertItemRequest};

type RowKey = (String, String, String);

/// Partition/sort keyed store held in a concurrent map. Test hooks allow
/// injecting failures on either operation.
#[derive(Default)]
pub struct MemoryNoSqlDatabase {
    rows: DashMap<RowKey, Vec<ItemAttribute>>,
    fail_gets_with: Mutex<Option<BudgetError>>,
    fail_upserts_with: Mutex<Option<BudgetError>>,
}

impl MemoryNoSqlDatabase {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    fn row_key(request_key: &crate::domain::ports::ItemKey) -> RowKey {
        (
            request_key.table_name.clone(),
            request_key.partition_key.value.clone(),
            request_key.sort_key.value.clone(),
        )
    }

    /// Directly seeds a row. Test hook.
    pub fn seed_row(
        &self,
        table_name: &str,
        partition_value: &str,
        sort_value: &str,
        attributes: Vec<ItemAttribute>,
    ) {
        self.rows.insert(
            (table_name.to_string(), partition_value.to_string(), sort_value.to_string()),
            attributes,
        );
    }

    /// Reads a row's attributes without going through the port. Test hook.
    pub fn row(
        &self,
        table_name: &str,
        partition_value: &str,
        sort_value: &str,
    ) -> Option<Vec<ItemAttribute>> {
        self.rows
            .get(&(table_name.to_string(), partition_value.to_string(), sort_value.to_string()))
            .map(|row| row.value().clone())
    }

    pub fn fail_gets_with(&self, error: Option<BudgetError>) {
        *self.fail_gets_with.lock().unwrap() = error;
    }

    pub fn fail_upserts_with(&self, error: Option<BudgetError>) {
        *self.fail_upserts_with.lock().unwrap() = error;
    }
}

#[async_trait]
impl NoSqlDatabase for MemoryNoSqlDatabase {
    async fn get_item(&self, request: GetItemRequest) -> BudgetResult<Option<Item>> {
        if let Some(error) = self.fail_gets_with.lock().unwrap().clone() {
            return Err(error);
        }
        let key = Self::row_key(&request.key);
        Ok(self
            .rows
            .get(&key)
            .map(|row| Item { key: request.key.clone(), attributes: row.value().clone() }))
    }

    async fn upsert_item(&self, request: UpsertItemRequest) -> BudgetResult<()> {
        if let Some(error) = self.fail_upserts_with.lock().unwrap().clone() {
            return Err(error);
        }
        self.rows.insert(Self::row_key(&request.key), request.attributes);
        Ok(())
    }
}
