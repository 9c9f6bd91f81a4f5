//! Storage engine interface and the in-memory engine
//!
//! The catalog only ever talks to physical storage through [`KvEngine`]: it
//! opens record stores by ident, drops idents, and asks for sizes. Record stores
//! are identified by ident alone; the namespace an engine remembers for an ident
//! is a label for listing, never the store's identity.

use crate::error::{CatalogError, CatalogResult};
use crate::storage::metadata::CollectionOptions;
use crate::storage::{Ident, KvPrefix, NamespaceString};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// An open physical record store.
pub trait RecordStore: Send + Sync + fmt::Debug {
    fn ident(&self) -> &Ident;

    fn prefix(&self) -> KvPrefix;

    /// Bytes the store occupies on disk.
    fn storage_size(&self) -> u64;
}

/// Storage engine operations the catalog consumes.
pub trait KvEngine: Send + Sync {
    /// Open the record store for `ident`, creating the physical object if it
    /// does not exist yet.
    fn get_or_create_grouped_record_store(
        &self,
        ns: &NamespaceString,
        ident: &Ident,
        options: &CollectionOptions,
        prefix: KvPrefix,
    ) -> CatalogResult<Box<dyn RecordStore>>;

    /// Delete the physical object behind `ident`. Callers treat failure as
    /// non-fatal.
    fn drop_ident(&self, ident: &Ident) -> CatalogResult<()>;

    fn get_ident_size(&self, ident: &Ident) -> u64;

    /// Namespaces of the collections the engine holds for `db`.
    fn list_collections(&self, db: &str) -> BTreeSet<NamespaceString>;

    /// Whether `from` may be renamed to `to`.
    fn ok_to_rename(
        &self,
        from: &NamespaceString,
        to: &NamespaceString,
        ident: &Ident,
        record_store: &dyn RecordStore,
    ) -> CatalogResult<()>;

    /// Relabel `ident` after a catalog rename. The physical object is untouched.
    fn rename_collection(
        &self,
        from: &NamespaceString,
        to: &NamespaceString,
        ident: &Ident,
    ) -> CatalogResult<()>;
}

#[derive(Debug, Default)]
struct IdentEntry {
    ns: Option<NamespaceString>,
    size: u64,
    open: usize,
}

type IdentTable = Arc<Mutex<HashMap<Ident, IdentEntry>>>;

/// Engine keeping every ident in memory. Sizes are whatever the owner sets.
pub struct MemoryKvEngine {
    idents: IdentTable,
    fail_drops: AtomicBool,
    fail_opens: AtomicBool,
}

impl MemoryKvEngine {
    pub fn new() -> Self {
        Self {
            idents: Arc::new(Mutex::new(HashMap::new())),
            fail_drops: AtomicBool::new(false),
            fail_opens: AtomicBool::new(false),
        }
    }

    /// Set the reported size of an ident, creating an unlabelled one if needed.
    pub fn set_ident_size(&self, ident: &Ident, bytes: u64) {
        self.idents.lock().entry(ident.clone()).or_default().size = bytes;
    }

    pub fn has_ident(&self, ident: &Ident) -> bool {
        self.idents.lock().contains_key(ident)
    }

    /// Number of live record store objects for `ident`.
    pub fn open_count(&self, ident: &Ident) -> usize {
        self.idents.lock().get(ident).map_or(0, |e| e.open)
    }

    /// Make every subsequent `drop_ident` fail.
    pub fn set_fail_drops(&self, fail: bool) {
        self.fail_drops.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent record store open fail.
    pub fn set_fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryKvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemoryKvEngine {
    fn get_or_create_grouped_record_store(
        &self,
        ns: &NamespaceString,
        ident: &Ident,
        _options: &CollectionOptions,
        prefix: KvPrefix,
    ) -> CatalogResult<Box<dyn RecordStore>> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(CatalogError::Storage(format!("injected failure opening '{}'", ident)));
        }

        let mut idents = self.idents.lock();
        let entry = idents.entry(ident.clone()).or_default();
        entry.ns = Some(ns.clone());
        entry.open += 1;
        debug!(%ns, %ident, %prefix, open = entry.open, "opened record store");

        Ok(Box::new(MemoryRecordStore {
            ident: ident.clone(),
            prefix,
            idents: Arc::clone(&self.idents),
        }))
    }

    fn drop_ident(&self, ident: &Ident) -> CatalogResult<()> {
        if self.fail_drops.load(Ordering::SeqCst) {
            return Err(CatalogError::Storage(format!("injected failure dropping '{}'", ident)));
        }

        let mut idents = self.idents.lock();
        match idents.get(ident) {
            // Already gone counts as dropped.
            None => Ok(()),
            Some(entry) if entry.open > 0 => Err(CatalogError::Storage(format!(
                "ident '{}' is busy ({} open handles)",
                ident, entry.open
            ))),
            Some(_) => {
                idents.remove(ident);
                debug!(%ident, "dropped ident");
                Ok(())
            }
        }
    }

    fn get_ident_size(&self, ident: &Ident) -> u64 {
        self.idents.lock().get(ident).map_or(0, |e| e.size)
    }

    fn list_collections(&self, db: &str) -> BTreeSet<NamespaceString> {
        self.idents
            .lock()
            .values()
            .filter_map(|e| e.ns.as_ref())
            .filter(|ns| ns.db() == db)
            .cloned()
            .collect()
    }

    fn ok_to_rename(
        &self,
        _from: &NamespaceString,
        to: &NamespaceString,
        ident: &Ident,
        _record_store: &dyn RecordStore,
    ) -> CatalogResult<()> {
        let idents = self.idents.lock();
        if !idents.contains_key(ident) {
            return Err(CatalogError::NotFound(format!("unknown ident '{}'", ident)));
        }
        if idents.values().any(|e| e.ns.as_ref() == Some(to)) {
            return Err(CatalogError::AlreadyExists(format!(
                "engine already holds a collection named '{}'",
                to
            )));
        }
        Ok(())
    }

    fn rename_collection(
        &self,
        _from: &NamespaceString,
        to: &NamespaceString,
        ident: &Ident,
    ) -> CatalogResult<()> {
        let mut idents = self.idents.lock();
        let entry = idents
            .get_mut(ident)
            .ok_or_else(|| CatalogError::NotFound(format!("unknown ident '{}'", ident)))?;
        entry.ns = Some(to.clone());
        Ok(())
    }
}

/// Record store handed out by [`MemoryKvEngine`]. Releasing it closes the
/// handle; the ident itself stays until dropped.
pub struct MemoryRecordStore {
    ident: Ident,
    prefix: KvPrefix,
    idents: IdentTable,
}

impl RecordStore for MemoryRecordStore {
    fn ident(&self) -> &Ident {
        &self.ident
    }

    fn prefix(&self) -> KvPrefix {
        self.prefix
    }

    fn storage_size(&self) -> u64 {
        self.idents.lock().get(&self.ident).map_or(0, |e| e.size)
    }
}

impl Drop for MemoryRecordStore {
    fn drop(&mut self) {
        if let Some(entry) = self.idents.lock().get_mut(&self.ident) {
            entry.open = entry.open.saturating_sub(1);
        }
    }
}

impl fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRecordStore")
            .field("ident", &self.ident)
            .field("prefix", &self.prefix)
            .finish()
    }
}
