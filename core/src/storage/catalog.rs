//! Persistent collection catalog
//!
//! [`CatalogStore`] is the repository of collection metadata documents the
//! registry consumes. [`JsonCatalogStore`] keeps the documents in memory and
//! rewrites one JSON file after every mutation. Each mutation also registers a
//! change with the caller's transaction that restores the previous documents if
//! the transaction rolls back.

use crate::error::{CatalogError, CatalogResult};
use crate::storage::feature_tracker::check_feature_bits;
use crate::storage::metadata::{
    CatalogDocument, CollectionMetadata, CollectionOptions, FeatureDocument, IndexMetaData,
    IndexSpec, is_feature_document,
};
use crate::storage::{
    Change, FeatureTracker, Ident, NamespaceString, NonRepairableFeature, PrefixAllocator,
    RepairableFeature, Transaction,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Key the feature sentinel document is stored under. It looks like a
/// namespace so lookups by namespace can run into it.
pub const FEATURE_DOCUMENT_KEY: &str = "_mdb_catalog.$features";

/// Persistent repository of collection metadata documents.
pub trait CatalogStore: Send + Sync {
    /// Raw catalog document for `ns`, if any. May be the feature sentinel.
    fn find_entry(&self, ns: &NamespaceString) -> CatalogResult<Option<Value>>;

    /// Persist a document for a new collection, assigning its ident and prefix.
    fn new_collection(
        &self,
        txn: &Transaction,
        ns: &NamespaceString,
        options: &CollectionOptions,
        id_index_spec: Option<&IndexSpec>,
    ) -> CatalogResult<()>;

    fn drop_collection(&self, txn: &Transaction, ns: &NamespaceString) -> CatalogResult<()>;

    /// Move a document to a new namespace. The ident does not change.
    fn rename_collection(
        &self,
        txn: &Transaction,
        from: &NamespaceString,
        to: &NamespaceString,
        stay_temp: bool,
    ) -> CatalogResult<()>;

    /// Record a new index on `ns` and return the ident assigned to it.
    fn add_index(
        &self,
        txn: &Transaction,
        ns: &NamespaceString,
        spec: IndexSpec,
    ) -> CatalogResult<Ident>;

    fn get_metadata(&self, ns: &NamespaceString) -> CatalogResult<CollectionMetadata>;

    fn get_collection_ident(&self, ns: &NamespaceString) -> CatalogResult<Ident>;

    fn get_index_ident(&self, ns: &NamespaceString, index_name: &str) -> CatalogResult<Ident>;

    /// Every collection namespace with a document, sentinel excluded.
    fn all_namespaces(&self) -> Vec<NamespaceString>;

    fn feature_tracker(&self) -> &dyn FeatureTracker;
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    next_ident: u64,
    documents: Vec<Value>,
}

struct CatalogState {
    documents: RwLock<BTreeMap<String, Value>>,
    path: Option<PathBuf>,
    sync_on_write: bool,
    next_ident: AtomicU64,
}

impl CatalogState {
    /// Save catalog to disk
    fn persist(&self, documents: &BTreeMap<String, Value>) -> CatalogResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = CatalogFile {
            next_ident: self.next_ident.load(Ordering::SeqCst),
            documents: documents.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        out.write_all(json.as_bytes())?;
        if self.sync_on_write {
            out.sync_all()?;
        }

        Ok(())
    }

    fn next_ident(&self, kind: &str) -> Ident {
        let n = self.next_ident.fetch_add(1, Ordering::SeqCst);
        Ident::new(format!("{}-{}-{}", kind, n, Uuid::new_v4().simple()))
    }

    fn collection_document(&self, ns: &NamespaceString) -> CatalogResult<CatalogDocument> {
        let documents = self.documents.read();
        match documents.get(ns.as_str()) {
            Some(doc) if !is_feature_document(doc) => CatalogDocument::from_value(doc),
            _ => Err(CatalogError::NotFound(format!("no catalog entry for '{}'", ns))),
        }
    }
}

fn restore(documents: &mut BTreeMap<String, Value>, previous: &[(String, Option<Value>)]) {
    for (key, value) in previous.iter().rev() {
        match value {
            Some(doc) => {
                documents.insert(key.clone(), doc.clone());
            }
            None => {
                documents.remove(key);
            }
        }
    }
}

/// Puts documents back the way they were before a write.
struct RestoreDocuments {
    state: Arc<CatalogState>,
    previous: Vec<(String, Option<Value>)>,
}

impl Change for RestoreDocuments {
    fn commit(self: Box<Self>) {}

    fn rollback(self: Box<Self>) {
        let mut documents = self.state.documents.write();
        restore(&mut documents, &self.previous);
        if let Err(e) = self.state.persist(&documents) {
            error!(error = %e, "failed to persist catalog after rollback");
        }
    }
}

/// Catalog store backed by a single JSON file.
pub struct JsonCatalogStore {
    state: Arc<CatalogState>,
    prefixes: Arc<PrefixAllocator>,
    tracker: DocumentFeatureTracker,
}

impl JsonCatalogStore {
    /// A catalog that is never written to disk.
    pub fn in_memory(group_collections: bool) -> Self {
        Self::from_parts(BTreeMap::new(), None, false, 0, group_collections)
    }

    /// Load catalog from disk, starting empty if the file does not exist.
    pub fn open<P: AsRef<Path>>(
        path: P,
        group_collections: bool,
        sync_on_write: bool,
    ) -> CatalogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(mut file) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                serde_json::from_str::<CatalogFile>(&contents).map_err(|e| {
                    CatalogError::Storage(format!("Failed to parse catalog: {}", e))
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogFile {
                next_ident: 0,
                documents: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };

        let mut documents = BTreeMap::new();
        for doc in file.documents {
            if is_feature_document(&doc) {
                documents.insert(FEATURE_DOCUMENT_KEY.to_string(), doc);
                continue;
            }
            let Some(ns) = doc.get("ns").and_then(Value::as_str) else {
                warn!(?path, "skipping catalog document without a namespace");
                continue;
            };
            documents.insert(ns.to_string(), doc);
        }

        debug!(?path, collections = documents.len(), "loaded catalog");
        let store = Self::from_parts(
            documents,
            Some(path),
            sync_on_write,
            file.next_ident,
            group_collections,
        );
        store.observe_prefixes();
        Ok(store)
    }

    fn from_parts(
        documents: BTreeMap<String, Value>,
        path: Option<PathBuf>,
        sync_on_write: bool,
        next_ident: u64,
        group_collections: bool,
    ) -> Self {
        let state = Arc::new(CatalogState {
            documents: RwLock::new(documents),
            path,
            sync_on_write,
            next_ident: AtomicU64::new(next_ident),
        });
        Self {
            tracker: DocumentFeatureTracker {
                state: Arc::clone(&state),
                writes: AtomicU64::new(0),
            },
            state,
            prefixes: Arc::new(PrefixAllocator::new(group_collections)),
        }
    }

    /// Seed the prefix allocator above every persisted prefix.
    fn observe_prefixes(&self) {
        let documents = self.state.documents.read();
        for doc in documents.values().filter(|d| !is_feature_document(d)) {
            if let Ok(entry) = CatalogDocument::from_value(doc) {
                self.prefixes.observe(entry.md.prefix);
                for index in &entry.md.indexes {
                    self.prefixes.observe(index.prefix);
                }
            }
        }
    }

    /// Number of times the feature document has been written.
    pub fn feature_document_writes(&self) -> u64 {
        self.tracker.writes.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> Option<&Path> {
        self.state.path.as_deref()
    }

    fn write<F>(&self, txn: &Transaction, edit: F) -> CatalogResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> CatalogResult<Vec<(String, Option<Value>)>>,
    {
        write_documents(&self.state, txn, edit)
    }
}

/// Apply `edit` to the document map and persist. If persisting fails the
/// in-memory map is put back and the error returned; nothing is registered.
/// `edit` returns the previous value of every key it touched.
fn write_documents<F>(state: &Arc<CatalogState>, txn: &Transaction, edit: F) -> CatalogResult<()>
where
    F: FnOnce(&mut BTreeMap<String, Value>) -> CatalogResult<Vec<(String, Option<Value>)>>,
{
    txn.ensure_active()?;
    let mut documents = state.documents.write();
    let previous = edit(&mut documents)?;

    if let Err(e) = state.persist(&documents) {
        restore(&mut documents, &previous);
        return Err(e);
    }
    drop(documents);

    txn.register_change(Box::new(RestoreDocuments {
        state: Arc::clone(state),
        previous,
    }))
}

impl CatalogStore for JsonCatalogStore {
    fn find_entry(&self, ns: &NamespaceString) -> CatalogResult<Option<Value>> {
        Ok(self.state.documents.read().get(ns.as_str()).cloned())
    }

    fn new_collection(
        &self,
        txn: &Transaction,
        ns: &NamespaceString,
        options: &CollectionOptions,
        id_index_spec: Option<&IndexSpec>,
    ) -> CatalogResult<()> {
        if ns.is_empty() {
            return Err(CatalogError::InvalidArgument(
                "Collection namespace cannot be empty".into(),
            ));
        }
        if ns.as_str() == FEATURE_DOCUMENT_KEY {
            return Err(CatalogError::InvalidArgument(format!(
                "namespace '{}' is reserved",
                ns
            )));
        }
        options.validate()?;
        if let Some(spec) = id_index_spec {
            spec.validate_id_index()?;
        }

        self.write(txn, |documents| {
            if documents.contains_key(ns.as_str()) {
                return Err(CatalogError::AlreadyExists(format!(
                    "collection '{}' already exists",
                    ns
                )));
            }

            let mut md = CollectionMetadata::new(ns.clone(), options.clone(), self.prefixes.next_prefix());
            let mut idx_ident = BTreeMap::new();
            if let Some(spec) = id_index_spec {
                idx_ident.insert(spec.name.clone(), self.state.next_ident("index"));
                md.indexes.push(IndexMetaData {
                    spec: spec.clone(),
                    ready: true,
                    multikey: false,
                    prefix: self.prefixes.next_prefix(),
                });
            }

            let entry = CatalogDocument {
                ns: ns.clone(),
                ident: self.state.next_ident("collection"),
                md,
                idx_ident,
            };
            debug!(%ns, ident = %entry.ident, prefix = %entry.md.prefix, "new catalog entry");
            documents.insert(ns.as_str().to_string(), entry.to_value()?);
            Ok(vec![(ns.as_str().to_string(), None)])
        })
    }

    fn drop_collection(&self, txn: &Transaction, ns: &NamespaceString) -> CatalogResult<()> {
        self.write(txn, |documents| {
            match documents.get(ns.as_str()) {
                Some(doc) if !is_feature_document(doc) => {}
                _ => {
                    return Err(CatalogError::NotFound(format!(
                        "cannot find collection '{}' to drop",
                        ns
                    )));
                }
            }
            let previous = documents.remove(ns.as_str());
            Ok(vec![(ns.as_str().to_string(), previous)])
        })
    }

    fn rename_collection(
        &self,
        txn: &Transaction,
        from: &NamespaceString,
        to: &NamespaceString,
        stay_temp: bool,
    ) -> CatalogResult<()> {
        self.write(txn, |documents| {
            if documents.contains_key(to.as_str()) {
                return Err(CatalogError::AlreadyExists(format!(
                    "rename target '{}' already exists",
                    to
                )));
            }
            let old = match documents.get(from.as_str()) {
                Some(doc) if !is_feature_document(doc) => doc.clone(),
                _ => {
                    return Err(CatalogError::NotFound(format!(
                        "rename cannot find collection '{}'",
                        from
                    )));
                }
            };

            let mut entry = CatalogDocument::from_value(&old)?;
            entry.ns = to.clone();
            entry.md.ns = to.clone();
            if !stay_temp {
                entry.md.options.temp = false;
            }

            documents.insert(to.as_str().to_string(), entry.to_value()?);
            documents.remove(from.as_str());
            Ok(vec![
                (from.as_str().to_string(), Some(old)),
                (to.as_str().to_string(), None),
            ])
        })
    }

    fn add_index(
        &self,
        txn: &Transaction,
        ns: &NamespaceString,
        spec: IndexSpec,
    ) -> CatalogResult<Ident> {
        spec.validate()?;
        let mut assigned = None;

        self.write(txn, |documents| {
            let old = match documents.get(ns.as_str()) {
                Some(doc) if !is_feature_document(doc) => doc.clone(),
                _ => {
                    return Err(CatalogError::NotFound(format!(
                        "cannot add index to missing collection '{}'",
                        ns
                    )));
                }
            };

            let mut entry = CatalogDocument::from_value(&old)?;
            if entry.md.find_index(&spec.name).is_some() {
                return Err(CatalogError::AlreadyExists(format!(
                    "index '{}' already exists on '{}'",
                    spec.name, ns
                )));
            }

            let ident = self.state.next_ident("index");
            entry.idx_ident.insert(spec.name.clone(), ident.clone());
            entry.md.indexes.push(IndexMetaData {
                spec,
                ready: true,
                multikey: false,
                prefix: self.prefixes.next_prefix(),
            });

            documents.insert(ns.as_str().to_string(), entry.to_value()?);
            assigned = Some(ident);
            Ok(vec![(ns.as_str().to_string(), Some(old))])
        })?;

        assigned.ok_or_else(|| CatalogError::Internal("index ident was not assigned".into()))
    }

    fn get_metadata(&self, ns: &NamespaceString) -> CatalogResult<CollectionMetadata> {
        Ok(self.state.collection_document(ns)?.md)
    }

    fn get_collection_ident(&self, ns: &NamespaceString) -> CatalogResult<Ident> {
        Ok(self.state.collection_document(ns)?.ident)
    }

    fn get_index_ident(&self, ns: &NamespaceString, index_name: &str) -> CatalogResult<Ident> {
        self.state
            .collection_document(ns)?
            .idx_ident
            .remove(index_name)
            .ok_or_else(|| {
                CatalogError::NotFound(format!("index '{}' not found on '{}'", index_name, ns))
            })
    }

    fn all_namespaces(&self) -> Vec<NamespaceString> {
        let documents = self.state.documents.read();
        documents
            .iter()
            .filter(|(_, doc)| !is_feature_document(doc))
            .filter_map(|(key, _)| match NamespaceString::new(key.clone()) {
                Ok(ns) => Some(ns),
                Err(e) => {
                    warn!(key = %key, error = %e, "ignoring catalog entry with a malformed namespace");
                    None
                }
            })
            .collect()
    }

    fn feature_tracker(&self) -> &dyn FeatureTracker {
        &self.tracker
    }
}

/// Feature tracker stored as the sentinel document of a [`JsonCatalogStore`].
pub struct DocumentFeatureTracker {
    state: Arc<CatalogState>,
    writes: AtomicU64,
}

impl DocumentFeatureTracker {
    fn read(&self) -> CatalogResult<FeatureDocument> {
        match self.state.documents.read().get(FEATURE_DOCUMENT_KEY) {
            Some(doc) => Ok(serde_json::from_value(doc.clone())?),
            None => Ok(FeatureDocument::new()),
        }
    }

    fn mark<F>(&self, txn: &Transaction, set: F) -> CatalogResult<()>
    where
        F: FnOnce(&mut FeatureDocument),
    {
        write_documents(&self.state, txn, |documents| {
            let previous = documents.get(FEATURE_DOCUMENT_KEY).cloned();
            let mut features = match &previous {
                Some(doc) => serde_json::from_value(doc.clone())?,
                None => FeatureDocument::new(),
            };
            set(&mut features);
            documents.insert(FEATURE_DOCUMENT_KEY.to_string(), serde_json::to_value(&features)?);
            Ok(vec![(FEATURE_DOCUMENT_KEY.to_string(), previous)])
        })?;

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl FeatureTracker for DocumentFeatureTracker {
    fn is_non_repairable_feature_in_use(
        &self,
        feature: NonRepairableFeature,
    ) -> CatalogResult<bool> {
        Ok(self.read()?.non_repairable & feature.bit() != 0)
    }

    fn mark_non_repairable_feature_as_in_use(
        &self,
        txn: &Transaction,
        feature: NonRepairableFeature,
    ) -> CatalogResult<()> {
        debug!(?feature, "marking non-repairable feature as in use");
        self.mark(txn, |doc| doc.non_repairable |= feature.bit())
    }

    fn is_repairable_feature_in_use(&self, feature: RepairableFeature) -> CatalogResult<bool> {
        Ok(self.read()?.repairable & feature.bit() != 0)
    }

    fn mark_repairable_feature_as_in_use(
        &self,
        txn: &Transaction,
        feature: RepairableFeature,
    ) -> CatalogResult<()> {
        debug!(?feature, "marking repairable feature as in use");
        self.mark(txn, |doc| doc.repairable |= feature.bit())
    }

    fn is_compatible_with_current_code(&self) -> CatalogResult<()> {
        let features = self.read()?;
        check_feature_bits(features.non_repairable, features.repairable)
    }
}
