//! In-memory collection handle

use crate::error::{CatalogError, CatalogResult};
use crate::storage::metadata::{CollectionMetadata, CollectionOptions};
use crate::storage::{CatalogStore, Ident, KvPrefix, NamespaceString, RecordStore};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Pairs one namespace's ident and cached metadata with the record store the
/// registry opened for it.
///
/// The registry is the only long-term holder of a handle. Callers get shared
/// references for the duration of an operation; once a handle leaves the
/// registry and those references are gone, its record store is released. The
/// physical storage is not deleted by that release.
///
/// A rename moves the record store into the handle for the new name. The old
/// handle is left without a store and must not be used for storage access.
pub struct CollectionHandle {
    ns: NamespaceString,
    ident: Ident,
    metadata: RwLock<CollectionMetadata>,
    record_store: Mutex<Option<Arc<dyn RecordStore>>>,
    catalog: Arc<dyn CatalogStore>,
}

impl CollectionHandle {
    pub fn new(
        ns: NamespaceString,
        ident: Ident,
        metadata: CollectionMetadata,
        record_store: Arc<dyn RecordStore>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            ns,
            ident,
            metadata: RwLock::new(metadata),
            record_store: Mutex::new(Some(record_store)),
            catalog,
        }
    }

    pub fn ns(&self) -> &NamespaceString {
        &self.ns
    }

    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    pub fn prefix(&self) -> KvPrefix {
        self.metadata.read().prefix
    }

    pub fn options(&self) -> CollectionOptions {
        self.metadata.read().options.clone()
    }

    /// Metadata as of the last load or refresh.
    pub fn metadata(&self) -> CollectionMetadata {
        self.metadata.read().clone()
    }

    /// `None` once the store has moved to a renamed handle.
    pub fn record_store(&self) -> Option<Arc<dyn RecordStore>> {
        self.record_store.lock().clone()
    }

    /// Whether this handle still owns its record store.
    pub fn is_live(&self) -> bool {
        self.record_store.lock().is_some()
    }

    /// Names of every index, read from the catalog rather than the cache.
    pub fn all_indexes(&self) -> CatalogResult<Vec<String>> {
        Ok(self.catalog.get_metadata(&self.ns)?.index_names())
    }

    pub fn index_ident(&self, index_name: &str) -> CatalogResult<Ident> {
        self.catalog.get_index_ident(&self.ns, index_name)
    }

    /// Reload the cached metadata from the catalog.
    pub fn refresh_metadata(&self) -> CatalogResult<()> {
        let md = self.catalog.get_metadata(&self.ns)?;
        *self.metadata.write() = md;
        Ok(())
    }

    /// A handle for `to` that takes over this handle's record store. This
    /// handle is left without one.
    pub(crate) fn renamed(
        &self,
        to: NamespaceString,
        metadata: CollectionMetadata,
    ) -> CatalogResult<Self> {
        let record_store = self.record_store.lock().take().ok_or_else(|| {
            CatalogError::Internal(format!(
                "collection '{}' no longer owns its record store",
                self.ns
            ))
        })?;

        Ok(Self {
            ns: to,
            ident: self.ident.clone(),
            metadata: RwLock::new(metadata),
            record_store: Mutex::new(Some(record_store)),
            catalog: Arc::clone(&self.catalog),
        })
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("ns", &self.ns)
            .field("ident", &self.ident)
            .field("prefix", &self.prefix())
            .field("live", &self.is_live())
            .finish()
    }
}
