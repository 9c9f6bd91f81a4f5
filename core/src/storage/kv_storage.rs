//! Engine-wide entry point
//!
//! [`KvStorageEngine`] ties one catalog store and one storage engine together
//! and hands out a [`CollectionRegistry`] per database.

use crate::config::CatalogConfig;
use crate::error::CatalogResult;
use crate::storage::{
    CatalogStore, CollectionRegistry, JsonCatalogStore, KvEngine, MemoryKvEngine, Transaction,
    TransactionManager,
};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

pub struct KvStorageEngine {
    engine: Arc<dyn KvEngine>,
    catalog: Arc<dyn CatalogStore>,
    databases: DashMap<String, Arc<CollectionRegistry>>,
    txn_manager: TransactionManager,
    config: CatalogConfig,
}

impl KvStorageEngine {
    /// Open the on-disk catalog under `config.data_dir` backed by the
    /// in-memory engine.
    pub fn open(config: CatalogConfig) -> CatalogResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let catalog = JsonCatalogStore::open(
            config.catalog_path(),
            config.group_collections,
            config.sync_on_write,
        )?;
        info!(path = ?config.catalog_path(), "opened catalog");

        Self::new(Arc::new(MemoryKvEngine::new()), Arc::new(catalog), config)
    }

    /// Fails if the catalog uses features this build cannot handle.
    pub fn new(
        engine: Arc<dyn KvEngine>,
        catalog: Arc<dyn CatalogStore>,
        config: CatalogConfig,
    ) -> CatalogResult<Self> {
        catalog.feature_tracker().is_compatible_with_current_code()?;

        Ok(Self {
            engine,
            catalog,
            databases: DashMap::new(),
            txn_manager: TransactionManager::new(),
            config,
        })
    }

    /// Registry for `db`, created on first use.
    pub fn database_catalog_entry(&self, db: &str) -> CatalogResult<Arc<CollectionRegistry>> {
        if let Some(registry) = self.databases.get(db) {
            return Ok(Arc::clone(registry.value()));
        }

        let registry = Arc::new(CollectionRegistry::new(
            db,
            Arc::clone(&self.engine),
            Arc::clone(&self.catalog),
        ));
        if self.config.load_on_startup {
            for ns in self.catalog.all_namespaces() {
                if ns.db() == db {
                    registry.init_collection(&ns)?;
                }
            }
            debug!(db, collections = registry.collection_count(), "loaded database catalog");
        }

        let entry = self
            .databases
            .entry(db.to_string())
            .or_insert_with(|| registry);
        Ok(Arc::clone(entry.value()))
    }

    /// Forget the registry for `db`. Its record stores are released once the
    /// last outstanding reference goes away; nothing is dropped on disk.
    pub fn close_database(&self, db: &str) -> bool {
        let closed = self.databases.remove(db).is_some();
        if closed {
            debug!(db, "closed database catalog");
        }
        closed
    }

    /// Every database with at least one persisted collection.
    pub fn list_databases(&self) -> BTreeSet<String> {
        self.catalog
            .all_namespaces()
            .into_iter()
            .map(|ns| ns.db().to_string())
            .collect()
    }

    pub fn begin_transaction(&self) -> Transaction {
        self.txn_manager.begin()
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }
}
