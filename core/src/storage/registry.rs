//! Per-database collection registry
//!
//! [`CollectionRegistry`] maps namespaces to live [`CollectionHandle`]s for one
//! database. Handles are materialized lazily from the catalog store on first
//! access. Create, drop and rename write through the catalog store first, then
//! update the in-memory map, then register a [`CollectionChange`] with the
//! caller's transaction so the in-memory effect is undone (and physical storage
//! reclaimed best-effort) if the transaction aborts.
//!
//! Mutating operations require the caller to hold the database's exclusive lock
//! for the whole transaction. The registry does not take that lock; it only
//! checks for it in debug builds. The map itself sits behind its own mutex so
//! concurrent readers racing a lazy load always converge on one handle.
//!
//! Lifetime rule: the registry must outlive every transaction that mutated it.
//! Registered changes hold only a weak reference to the map; if the registry
//! is gone when a change fires, the in-memory part of the undo is skipped.

use crate::error::{CatalogError, CatalogResult};
use crate::storage::metadata::{
    CollectionOptions, IndexSpec, is_feature_document, parse_collection_entry,
};
use crate::storage::{
    CatalogStore, Change, CollectionHandle, Ident, KvEngine, NamespaceString,
    NonRepairableFeature, RecordStore, Transaction,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type CollectionMap = HashMap<NamespaceString, Arc<CollectionHandle>>;

struct RegistryInner {
    db: String,
    engine: Arc<dyn KvEngine>,
    catalog: Arc<dyn CatalogStore>,
    collections: Mutex<CollectionMap>,
}

/// Owns the namespace → handle map of one database.
pub struct CollectionRegistry {
    inner: Arc<RegistryInner>,
}

impl CollectionRegistry {
    pub fn new(
        db: impl Into<String>,
        engine: Arc<dyn KvEngine>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                db: db.into(),
                engine,
                catalog,
                collections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.inner.db
    }

    /// Cached handle for `ns`, loading it from the catalog on a miss. Returns
    /// `None` when the catalog has no collection document for `ns`.
    pub fn get(&self, ns: &NamespaceString) -> CatalogResult<Option<Arc<CollectionHandle>>> {
        if ns.is_empty() || ns.db() != self.inner.db {
            return Ok(None);
        }
        if let Some(handle) = self.inner.collections.lock().get(ns) {
            return Ok(Some(Arc::clone(handle)));
        }
        self.load(ns)
    }

    pub fn get_record_store(
        &self,
        ns: &NamespaceString,
    ) -> CatalogResult<Option<Arc<dyn RecordStore>>> {
        Ok(self.get(ns)?.and_then(|h| h.record_store()))
    }

    fn load(&self, ns: &NamespaceString) -> CatalogResult<Option<Arc<CollectionHandle>>> {
        let Some(doc) = self.inner.catalog.find_entry(ns)? else {
            return Ok(None);
        };
        debug!(%ns, "fetched catalog entry");

        if is_feature_document(&doc) {
            return Ok(None);
        }

        let (ident, md) = parse_collection_entry(ns, &doc)?;
        let rs = self.inner.engine.get_or_create_grouped_record_store(
            ns,
            &ident,
            &md.options,
            md.prefix,
        )?;
        let handle = Arc::new(CollectionHandle::new(
            ns.clone(),
            ident,
            md,
            Arc::from(rs),
            Arc::clone(&self.inner.catalog),
        ));

        let mut collections = self.inner.collections.lock();
        let cached = collections
            .entry(ns.clone())
            .or_insert_with(|| Arc::clone(&handle));
        if !Arc::ptr_eq(cached, &handle) {
            debug!(%ns, "another loader cached this collection first, discarding ours");
        }
        Ok(Some(Arc::clone(cached)))
    }

    /// Create a collection.
    ///
    /// The catalog store validates and persists the new document; any failure
    /// there is returned before the map is touched.
    ///
    /// An error after the document is written (opening the record store,
    /// marking the collation feature) leaves the write in `txn`. The caller
    /// must abort `txn`; the registered changes then remove the document, the
    /// handle and the new ident.
    pub fn create_collection(
        &self,
        txn: &Transaction,
        ns: &NamespaceString,
        options: &CollectionOptions,
        id_index_spec: Option<&IndexSpec>,
    ) -> CatalogResult<()> {
        self.assert_exclusive(txn);
        if ns.is_empty() {
            return Err(CatalogError::InvalidArgument(
                "Collection namespace cannot be empty".into(),
            ));
        }
        self.check_database(ns)?;
        txn.ensure_active()?;

        self.inner
            .catalog
            .new_collection(txn, ns, options, id_index_spec)?;

        // Undo is registered before any fallible step below.
        let ident = self.inner.catalog.get_collection_ident(ns)?;
        txn.register_change(Box::new(CollectionChange::AddCollection {
            registry: Arc::downgrade(&self.inner),
            engine: Arc::clone(&self.inner.engine),
            ns: ns.clone(),
            ident: ident.clone(),
            drop_on_rollback: true,
            renamed_from: None,
        }))?;

        // Someone may have materialized the entry already.
        let cached = self.inner.collections.lock().contains_key(ns);
        if !cached {
            let md = self.inner.catalog.get_metadata(ns)?;
            let rs = self.inner.engine.get_or_create_grouped_record_store(
                ns,
                &ident,
                &md.options,
                md.prefix,
            )?;
            let handle = Arc::new(CollectionHandle::new(
                ns.clone(),
                ident.clone(),
                md,
                Arc::from(rs),
                Arc::clone(&self.inner.catalog),
            ));
            self.inner
                .collections
                .lock()
                .entry(ns.clone())
                .or_insert(handle);
        }

        if options.has_non_simple_collation() {
            let tracker = self.inner.catalog.feature_tracker();
            let feature = NonRepairableFeature::Collation;
            if !tracker.is_non_repairable_feature_in_use(feature)? {
                tracker.mark_non_repairable_feature_as_in_use(txn, feature)?;
            }
        }

        info!(%ns, %ident, "created collection");
        Ok(())
    }

    /// Drop a collection.
    ///
    /// The handle is evicted immediately. Physical storage is reclaimed when the
    /// transaction commits; an aborted drop leaves it intact.
    pub fn drop_collection(&self, txn: &Transaction, ns: &NamespaceString) -> CatalogResult<()> {
        self.assert_exclusive(txn);
        if ns.is_empty() {
            return Err(CatalogError::InvalidArgument(
                "Collection namespace cannot be empty".into(),
            ));
        }
        self.check_database(ns)?;
        txn.ensure_active()?;

        let evicted = self.inner.collections.lock().remove(ns);

        let (ident, index_idents) = match self.drop_persisted(txn, ns, evicted.as_deref()) {
            Ok(idents) => idents,
            Err(e) => {
                // The catalog still has the collection, so the map must too.
                if let Some(handle) = evicted {
                    self.inner
                        .collections
                        .lock()
                        .entry(ns.clone())
                        .or_insert(handle);
                }
                return Err(e);
            }
        };

        info!(%ns, %ident, "dropped collection");
        txn.register_change(Box::new(CollectionChange::RemoveCollection {
            engine: Arc::clone(&self.inner.engine),
            ns: ns.clone(),
            ident,
            handle: evicted,
            index_idents,
            drop_on_commit: true,
        }))
    }

    fn drop_persisted(
        &self,
        txn: &Transaction,
        ns: &NamespaceString,
        evicted: Option<&CollectionHandle>,
    ) -> CatalogResult<(Ident, Vec<Ident>)> {
        let ident = match evicted {
            Some(handle) => handle.ident().clone(),
            None => self.inner.catalog.get_collection_ident(ns)?,
        };
        let index_idents = self.index_idents(ns)?;

        self.inner.catalog.drop_collection(txn, ns)?;
        Ok((ident, index_idents))
    }

    fn index_idents(&self, ns: &NamespaceString) -> CatalogResult<Vec<Ident>> {
        let md = self.inner.catalog.get_metadata(ns)?;
        md.index_names()
            .iter()
            .map(|name| self.inner.catalog.get_index_ident(ns, name))
            .collect()
    }

    /// Rename a collection within this database. Ident and prefix carry over;
    /// the record store moves to the new handle and the old handle is retired.
    pub fn rename_collection(
        &self,
        txn: &Transaction,
        from: &NamespaceString,
        to: &NamespaceString,
        stay_temp: bool,
    ) -> CatalogResult<()> {
        self.assert_exclusive(txn);
        if from.is_empty() || to.is_empty() {
            return Err(CatalogError::InvalidArgument(
                "rename namespaces cannot be empty".into(),
            ));
        }
        self.check_database(from)?;
        self.check_database(to)?;
        txn.ensure_active()?;

        let source = self.get(from)?.ok_or_else(|| {
            CatalogError::NotFound(format!("rename cannot find collection '{}'", from))
        })?;

        if self.inner.collections.lock().contains_key(to)
            || self.inner.catalog.find_entry(to)?.is_some()
        {
            return Err(CatalogError::AlreadyExists(format!(
                "rename target '{}' already exists",
                to
            )));
        }

        let source_rs = source.record_store().ok_or_else(|| {
            CatalogError::Internal(format!("collection '{}' has no record store", from))
        })?;
        let ident_from = self.inner.catalog.get_collection_ident(from)?;
        self.inner
            .engine
            .ok_to_rename(from, to, &ident_from, source_rs.as_ref())?;
        drop(source_rs);

        self.inner
            .catalog
            .rename_collection(txn, from, to, stay_temp)?;

        let ident_to = self.inner.catalog.get_collection_ident(to)?;
        if ident_to != ident_from {
            return Err(CatalogError::Internal(format!(
                "rename of '{}' changed ident from '{}' to '{}'",
                from, ident_from, ident_to
            )));
        }
        let md = self.inner.catalog.get_metadata(to)?;

        self.inner.engine.rename_collection(from, to, &ident_to)?;

        txn.register_change(Box::new(CollectionChange::AddCollection {
            registry: Arc::downgrade(&self.inner),
            engine: Arc::clone(&self.inner.engine),
            ns: to.clone(),
            ident: ident_to.clone(),
            drop_on_rollback: false,
            renamed_from: Some(from.clone()),
        }))?;

        let renamed = Arc::new(source.renamed(to.clone(), md)?);
        {
            // Insert before erasing so the database never looks empty to a
            // concurrent enumeration.
            let mut collections = self.inner.collections.lock();
            collections.insert(to.clone(), renamed);
            collections.remove(from);
        }

        info!(%from, %to, ident = %ident_to, "renamed collection");
        Ok(())
    }

    /// Materialize a persisted collection eagerly, e.g. at startup.
    pub fn init_collection(&self, ns: &NamespaceString) -> CatalogResult<()> {
        if self.inner.collections.lock().contains_key(ns) {
            return Err(CatalogError::AlreadyExists(format!(
                "collection '{}' is already initialized",
                ns
            )));
        }

        let md = self.inner.catalog.get_metadata(ns)?;
        let ident = self.inner.catalog.get_collection_ident(ns)?;
        let rs = self.inner.engine.get_or_create_grouped_record_store(
            ns,
            &ident,
            &md.options,
            md.prefix,
        )?;
        let handle = Arc::new(CollectionHandle::new(
            ns.clone(),
            ident,
            md,
            Arc::from(rs),
            Arc::clone(&self.inner.catalog),
        ));

        let mut collections = self.inner.collections.lock();
        if collections.contains_key(ns) {
            return Err(CatalogError::AlreadyExists(format!(
                "collection '{}' is already initialized",
                ns
            )));
        }
        collections.insert(ns.clone(), handle);
        Ok(())
    }

    /// Collection namespaces as the storage engine lists them.
    pub fn list_namespaces(&self) -> BTreeSet<NamespaceString> {
        self.inner.engine.list_collections(&self.inner.db)
    }

    /// Bytes used by every cached collection and all of its indexes.
    pub fn size_on_disk(&self) -> CatalogResult<u64> {
        let handles: Vec<Arc<CollectionHandle>> =
            self.inner.collections.lock().values().cloned().collect();

        let mut size = 0;
        for handle in handles {
            if let Some(rs) = handle.record_store() {
                size += rs.storage_size();
            }
            for index_name in handle.all_indexes()? {
                let ident = handle.index_ident(&index_name)?;
                size += self.inner.engine.get_ident_size(&ident);
            }
        }
        Ok(size)
    }

    pub fn is_compatible_with_current_code(&self) -> CatalogResult<()> {
        self.inner
            .catalog
            .feature_tracker()
            .is_compatible_with_current_code()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.collections.lock().is_empty()
    }

    pub fn collection_count(&self) -> usize {
        self.inner.collections.lock().len()
    }

    pub fn cached_namespaces(&self) -> Vec<NamespaceString> {
        let mut names: Vec<_> = self.inner.collections.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn check_database(&self, ns: &NamespaceString) -> CatalogResult<()> {
        if ns.db() != self.inner.db {
            return Err(CatalogError::InvalidArgument(format!(
                "namespace '{}' does not belong to database '{}'",
                ns, self.inner.db
            )));
        }
        Ok(())
    }

    fn assert_exclusive(&self, txn: &Transaction) {
        debug_assert!(
            txn.is_db_locked_exclusive(&self.inner.db),
            "database '{}' must be locked exclusively by {}",
            self.inner.db,
            txn.id
        );
    }
}

impl Drop for CollectionRegistry {
    fn drop(&mut self) {
        let mut collections = self.inner.collections.lock();
        debug!(db = %self.inner.db, collections = collections.len(), "closing database catalog");
        collections.clear();
    }
}

/// Undo/cleanup action for a registry mutation.
enum CollectionChange {
    /// A handle was inserted. Commit keeps it; rollback evicts it and, for a
    /// create, drops the new ident.
    AddCollection {
        registry: Weak<RegistryInner>,
        engine: Arc<dyn KvEngine>,
        ns: NamespaceString,
        ident: Ident,
        drop_on_rollback: bool,
        renamed_from: Option<NamespaceString>,
    },
    /// A handle was evicted. Commit releases it and drops its idents; rollback
    /// does nothing, the next lookup reloads it from the restored catalog.
    RemoveCollection {
        engine: Arc<dyn KvEngine>,
        ns: NamespaceString,
        ident: Ident,
        handle: Option<Arc<CollectionHandle>>,
        index_idents: Vec<Ident>,
        drop_on_commit: bool,
    },
}

fn drop_ident_ignoring_failure(engine: &dyn KvEngine, ns: &NamespaceString, ident: &Ident) {
    // The catalog no longer points at this ident; a failure only leaks space.
    if let Err(e) = engine.drop_ident(ident) {
        warn!(%ns, %ident, error = %e, "ignoring failure to drop ident");
    }
}

impl Change for CollectionChange {
    fn commit(self: Box<Self>) {
        match *self {
            CollectionChange::AddCollection { .. } => {}
            CollectionChange::RemoveCollection {
                engine,
                ns,
                ident,
                handle,
                index_idents,
                drop_on_commit,
            } => {
                drop(handle);
                if drop_on_commit {
                    drop_ident_ignoring_failure(engine.as_ref(), &ns, &ident);
                    for index_ident in &index_idents {
                        drop_ident_ignoring_failure(engine.as_ref(), &ns, index_ident);
                    }
                }
            }
        }
    }

    fn rollback(self: Box<Self>) {
        match *self {
            CollectionChange::AddCollection {
                registry,
                engine,
                ns,
                ident,
                drop_on_rollback,
                renamed_from,
            } => {
                let evicted = registry
                    .upgrade()
                    .and_then(|inner| inner.collections.lock().remove(&ns));
                if evicted.is_some() {
                    debug!(%ns, "evicted collection on rollback");
                }
                drop(evicted);

                if let Some(from) = renamed_from {
                    if let Err(e) = engine.rename_collection(&ns, &from, &ident) {
                        warn!(%ns, %from, error = %e, "failed to restore engine name after aborted rename");
                    }
                }
                if drop_on_rollback {
                    drop_ident_ignoring_failure(engine.as_ref(), &ns, &ident);
                }
            }
            CollectionChange::RemoveCollection { .. } => {}
        }
    }
}
