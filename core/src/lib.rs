//! MonoDB collection catalog
//!
//! Per-database registry of collections layered over a persistent catalog
//! store and a key-value storage engine.

pub mod config;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::CatalogConfig;
pub use error::{CatalogError, CatalogResult};
pub use logging::init_logging;
pub use storage::{
    CatalogStore, Change, CollectionHandle, CollectionOptions, CollectionRegistry, Ident,
    IndexSpec, JsonCatalogStore, KvEngine, KvPrefix, KvStorageEngine, LockMode, MemoryKvEngine,
    NamespaceString, RecordStore, Transaction, TransactionManager,
};
