//! Ports to external collaborators: the journal, the NoSQL store, and the
//! checkpoint blob store. The engine depends only on these traits; concrete
//! adapters live under `crate::adapters`.

pub mod blob;
pub mod journal;
pub mod nosql;

pub use blob::BlobStore;
pub use journal::{JournalService, JournalSubscriber, RecoveryOutcome};
pub use nosql::{GetItemRequest, Item, ItemAttribute, ItemKey, NoSqlDatabase, UpsertItemRequest};
