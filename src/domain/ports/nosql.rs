//! NoSQL database port.
//!
//! Committed budget balances are persisted to a partition/sort keyed table:
//! partition key = budget-key name, sort key = day index rendered as a
//! decimal string, one data attribute holding the 24 hourly balances.
//! Tentative transaction state never reaches this store.

use async_trait::async_trait;

use crate::domain::error::BudgetResult;

/// A named string attribute of a stored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAttribute {
    pub name: String,
    pub value: String,
}

impl ItemAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Fully qualified key of a stored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    pub table_name: String,
    pub partition_key: ItemAttribute,
    pub sort_key: ItemAttribute,
}

/// A stored item: its key plus data attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: ItemKey,
    pub attributes: Vec<ItemAttribute>,
}

#[derive(Debug, Clone)]
pub struct GetItemRequest {
    pub key: ItemKey,
}

#[derive(Debug, Clone)]
pub struct UpsertItemRequest {
    pub key: ItemKey,
    pub attributes: Vec<ItemAttribute>,
}

/// Partition/sort keyed record store.
#[async_trait]
pub trait NoSqlDatabase: Send + Sync {
    /// Fetches an item; `None` when no record exists for the key.
    async fn get_item(&self, request: GetItemRequest) -> BudgetResult<Option<Item>>;

    /// Creates or replaces an item.
    async fn upsert_item(&self, request: UpsertItemRequest) -> BudgetResult<()>;
}
