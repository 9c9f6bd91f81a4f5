//! Collection catalog storage layer

pub mod catalog;
pub mod collection;
pub mod engine;
pub mod feature_tracker;
pub mod kv_storage;
pub mod metadata;
pub mod namespace;
pub mod registry;
pub mod transaction;

// Re-export core types
pub use catalog::{CatalogStore, DocumentFeatureTracker, FEATURE_DOCUMENT_KEY, JsonCatalogStore};
pub use collection::CollectionHandle;
pub use engine::{KvEngine, MemoryKvEngine, MemoryRecordStore, RecordStore};
pub use feature_tracker::{FeatureTracker, NonRepairableFeature, RepairableFeature};
pub use kv_storage::KvStorageEngine;
pub use metadata::{
    CatalogDocument, Collation, CollectionMetadata, CollectionOptions, IndexMetaData, IndexSpec,
};
pub use namespace::{Ident, KvPrefix, NamespaceString, PrefixAllocator};
pub use registry::CollectionRegistry;
pub use transaction::{
    Change, LockManager, LockMode, Transaction, TransactionManager, TransactionState, TxnId,
};
