//! End-to-end tests for the collection registry over the JSON catalog store
//! and the in-memory engine.

use mono_catalog::storage::metadata::Collation;
use mono_catalog::storage::{FeatureTracker, NonRepairableFeature};
use mono_catalog::{
    CatalogError, CatalogStore, CollectionOptions, CollectionRegistry, IndexSpec,
    JsonCatalogStore, KvEngine, LockMode, MemoryKvEngine, NamespaceString, RecordStore,
    Transaction, TransactionManager,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

struct Fixture {
    engine: Arc<MemoryKvEngine>,
    catalog: Arc<JsonCatalogStore>,
    registry: CollectionRegistry,
    txns: TransactionManager,
}

impl Fixture {
    fn new() -> Self {
        let engine = Arc::new(MemoryKvEngine::new());
        let catalog = Arc::new(JsonCatalogStore::in_memory(true));
        let registry = CollectionRegistry::new("db", engine.clone(), catalog.clone());
        Self {
            engine,
            catalog,
            registry,
            txns: TransactionManager::new(),
        }
    }

    fn begin(&self) -> Transaction {
        let txn = self.txns.begin();
        txn.lock_database("db", LockMode::Exclusive).unwrap();
        txn
    }

    fn create(&self, name: &str, options: CollectionOptions) {
        let txn = self.begin();
        self.registry
            .create_collection(&txn, &ns(name), &options, Some(&IndexSpec::id_index()))
            .unwrap();
        txn.commit().unwrap();
    }

    /// A second registry over the same catalog and engine, as after a restart.
    fn reopen(self) -> Fixture {
        let Fixture {
            engine,
            catalog,
            registry,
            txns,
        } = self;
        drop(registry);
        let registry = CollectionRegistry::new("db", engine.clone(), catalog.clone());
        Fixture {
            engine,
            catalog,
            registry,
            txns,
        }
    }
}

fn ns(s: &str) -> NamespaceString {
    NamespaceString::new(s).unwrap()
}

fn collated() -> CollectionOptions {
    CollectionOptions::default().with_collation(Collation::new("fr_CA"))
}

// Lookup

#[test]
fn get_after_create_uses_catalog_ident() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());

    let handle = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    assert_eq!(handle.ident(), &f.catalog.get_collection_ident(&ns("db.foo")).unwrap());
    assert_eq!(handle.record_store().unwrap().ident(), handle.ident());
    assert!(handle.prefix().is_prefixed());
}

#[test]
fn get_inside_creating_transaction_matches_catalog_entry() {
    let f = Fixture::new();
    let txn = f.begin();
    f.registry
        .create_collection(&txn, &ns("db.foo"), &CollectionOptions::default(), None)
        .unwrap();

    let entry = f.catalog.find_entry(&ns("db.foo")).unwrap().unwrap();
    let handle = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    assert_eq!(entry["ident"].as_str(), Some(handle.ident().as_str()));
    txn.commit().unwrap();
}

#[test]
fn get_is_idempotent() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let f = f.reopen();

    let first = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    let second = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.engine.open_count(first.ident()), 1);
}

#[test]
fn get_missing_is_none() {
    let f = Fixture::new();
    assert!(f.registry.get(&ns("db.nothing")).unwrap().is_none());
    assert!(f.registry.get_record_store(&ns("db.nothing")).unwrap().is_none());
    assert!(f.registry.is_empty());
}

#[test]
fn feature_document_is_not_a_collection() {
    let f = Fixture::new();
    f.create("db.foo", collated());

    let sentinel = ns("_mdb_catalog.$features");
    assert!(f.catalog.find_entry(&sentinel).unwrap().is_some());

    let other = CollectionRegistry::new("_mdb_catalog", f.engine.clone(), f.catalog.clone());
    assert!(other.get(&sentinel).unwrap().is_none());
    assert!(other.is_empty());
}

#[test]
fn concurrent_loaders_converge_on_one_handle() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let f = f.reopen();

    let barrier = Barrier::new(8);
    let handles: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    f.registry.get(&ns("db.foo")).unwrap().unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
    // Losers released their record stores.
    assert_eq!(f.engine.open_count(handles[0].ident()), 1);
}

// Create

#[test]
fn create_rollback_leaves_nothing() {
    let f = Fixture::new();
    let txn = f.begin();
    f.registry
        .create_collection(&txn, &ns("db.foo"), &CollectionOptions::default(), None)
        .unwrap();
    let ident = f.registry.get(&ns("db.foo")).unwrap().unwrap().ident().clone();
    assert!(f.engine.has_ident(&ident));

    txn.abort().unwrap();

    assert!(f.registry.get(&ns("db.foo")).unwrap().is_none());
    assert!(f.catalog.find_entry(&ns("db.foo")).unwrap().is_none());
    assert!(!f.engine.has_ident(&ident));
    assert!(f.registry.list_namespaces().is_empty());
    assert!(f.registry.is_empty());
}

#[test]
fn create_duplicate_fails_without_touching_map() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let before = f.registry.get(&ns("db.foo")).unwrap().unwrap();

    let txn = f.begin();
    let err = f
        .registry
        .create_collection(&txn, &ns("db.foo"), &CollectionOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, CatalogError::AlreadyExists(_)));
    assert_eq!(txn.pending_changes(), 0);
    txn.abort().unwrap();

    let after = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(f.engine.has_ident(after.ident()));
}

#[test]
fn create_open_failure_undone_by_abort() {
    let f = Fixture::new();
    f.engine.set_fail_opens(true);

    let txn = f.begin();
    let err = f
        .registry
        .create_collection(&txn, &ns("db.foo"), &CollectionOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, CatalogError::Storage(_)));
    // The document is written and its undo is queued.
    assert!(f.catalog.find_entry(&ns("db.foo")).unwrap().is_some());
    assert!(txn.pending_changes() > 0);
    txn.abort().unwrap();

    f.engine.set_fail_opens(false);
    assert!(f.catalog.find_entry(&ns("db.foo")).unwrap().is_none());
    assert!(f.registry.get(&ns("db.foo")).unwrap().is_none());
    assert!(f.registry.is_empty());
}

#[test]
fn create_empty_namespace_is_rejected() {
    let f = Fixture::new();
    let txn = f.begin();
    let err = f
        .registry
        .create_collection(&txn, &NamespaceString::empty(), &CollectionOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, CatalogError::InvalidArgument(_)));
    assert_eq!(txn.pending_changes(), 0);
}

#[test]
fn create_rejects_bad_options() {
    let f = Fixture::new();
    let txn = f.begin();
    let err = f
        .registry
        .create_collection(&txn, &ns("db.foo"), &CollectionOptions::default().capped(0), None)
        .unwrap_err();
    assert!(matches!(err, CatalogError::InvalidArgument(_)));
    assert!(f.registry.get(&ns("db.foo")).unwrap().is_none());
}

#[test]
fn collation_feature_marked_once() {
    let f = Fixture::new();
    let tracker = f.catalog.feature_tracker();
    assert!(!tracker
        .is_non_repairable_feature_in_use(NonRepairableFeature::Collation)
        .unwrap());

    f.create("db.a", collated());
    f.create("db.b", collated());
    f.create("db.c", CollectionOptions::default());

    assert!(tracker
        .is_non_repairable_feature_in_use(NonRepairableFeature::Collation)
        .unwrap());
    assert_eq!(f.catalog.feature_document_writes(), 1);
    assert!(f.registry.is_compatible_with_current_code().is_ok());
}

#[test]
fn collation_mark_undone_on_rollback() {
    let f = Fixture::new();
    let txn = f.begin();
    f.registry
        .create_collection(&txn, &ns("db.a"), &collated(), None)
        .unwrap();
    txn.abort().unwrap();

    assert!(!f
        .catalog
        .feature_tracker()
        .is_non_repairable_feature_in_use(NonRepairableFeature::Collation)
        .unwrap());
}

// Drop

#[test]
fn create_drop_recreate() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let first = f.registry.get(&ns("db.foo")).unwrap().unwrap().ident().clone();

    let txn = f.begin();
    f.registry.drop_collection(&txn, &ns("db.foo")).unwrap();
    txn.commit().unwrap();

    assert!(f.registry.get(&ns("db.foo")).unwrap().is_none());
    assert!(!f.engine.has_ident(&first));

    f.create("db.foo", CollectionOptions::default());
    let second = f.registry.get(&ns("db.foo")).unwrap().unwrap().ident().clone();
    assert_ne!(first, second);
}

#[test]
fn drop_commit_reclaims_index_idents() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let index_ident = f.catalog.get_index_ident(&ns("db.foo"), "_id_").unwrap();
    f.engine.set_ident_size(&index_ident, 16);

    let txn = f.begin();
    f.registry.drop_collection(&txn, &ns("db.foo")).unwrap();
    assert!(f.engine.has_ident(&index_ident));
    txn.commit().unwrap();

    assert!(!f.engine.has_ident(&index_ident));
}

#[test]
fn drop_rollback_keeps_storage() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let ident = f.registry.get(&ns("db.foo")).unwrap().unwrap().ident().clone();

    let txn = f.begin();
    f.registry.drop_collection(&txn, &ns("db.foo")).unwrap();
    assert!(f.registry.is_empty());
    txn.abort().unwrap();

    assert!(f.engine.has_ident(&ident));
    let reloaded = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    assert_eq!(reloaded.ident(), &ident);
}

#[test]
fn drop_failure_is_swallowed() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let ident = f.registry.get(&ns("db.foo")).unwrap().unwrap().ident().clone();
    f.engine.set_fail_drops(true);

    let txn = f.begin();
    f.registry.drop_collection(&txn, &ns("db.foo")).unwrap();
    txn.commit().unwrap();

    // Orphaned, but the catalog and map agree the collection is gone.
    assert!(f.engine.has_ident(&ident));
    assert!(f.catalog.find_entry(&ns("db.foo")).unwrap().is_none());
    assert!(f.registry.get(&ns("db.foo")).unwrap().is_none());
}

#[test]
fn failed_drop_puts_handle_back() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let cached = f.registry.get(&ns("db.foo")).unwrap().unwrap();

    // Remove the document without going through the registry.
    let behind = f.txns.begin();
    f.catalog.drop_collection(&behind, &ns("db.foo")).unwrap();
    behind.commit().unwrap();

    let txn = f.begin();
    let err = f.registry.drop_collection(&txn, &ns("db.foo")).unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)));
    assert_eq!(txn.pending_changes(), 0);
    txn.abort().unwrap();

    let after = f.registry.get(&ns("db.foo")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&cached, &after));
    assert!(after.is_live());
}

#[test]
fn drop_missing_collection() {
    let f = Fixture::new();
    let txn = f.begin();
    let err = f.registry.drop_collection(&txn, &ns("db.foo")).unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)));
}

// Rename

#[test]
fn rename_preserves_ident_and_moves_record_store() {
    let f = Fixture::new();
    f.create("db.a", CollectionOptions::default().temp());
    let before = f.registry.get(&ns("db.a")).unwrap().unwrap();

    let txn = f.begin();
    f.registry
        .rename_collection(&txn, &ns("db.a"), &ns("db.b"), false)
        .unwrap();
    txn.commit().unwrap();

    let after = f.registry.get(&ns("db.b")).unwrap().unwrap();
    assert_eq!(after.ident(), before.ident());
    assert_eq!(after.prefix(), before.prefix());
    // The store moved; the old handle no longer owns it.
    assert!(after.is_live());
    assert!(!before.is_live());
    assert!(before.record_store().is_none());
    assert_eq!(f.engine.open_count(after.ident()), 1);
    assert!(!after.options().temp);
    assert_eq!(f.registry.cached_namespaces(), vec![ns("db.b")]);
    assert!(f.registry.get(&ns("db.a")).unwrap().is_none());
    assert_eq!(f.registry.list_namespaces(), BTreeSet::from([ns("db.b")]));
}

#[test]
fn rename_rollback_restores_source() {
    let f = Fixture::new();
    f.create("db.a", CollectionOptions::default());
    let ident = f.registry.get(&ns("db.a")).unwrap().unwrap().ident().clone();

    let txn = f.begin();
    f.registry
        .rename_collection(&txn, &ns("db.a"), &ns("db.b"), false)
        .unwrap();
    txn.abort().unwrap();

    assert!(f.engine.has_ident(&ident));
    assert!(f.registry.get(&ns("db.b")).unwrap().is_none());
    let restored = f.registry.get(&ns("db.a")).unwrap().unwrap();
    assert_eq!(restored.ident(), &ident);
    assert_eq!(f.registry.list_namespaces(), BTreeSet::from([ns("db.a")]));
}

#[test]
fn rename_onto_existing_fails() {
    let f = Fixture::new();
    f.create("db.a", CollectionOptions::default());
    f.create("db.b", CollectionOptions::default());

    let txn = f.begin();
    let err = f
        .registry
        .rename_collection(&txn, &ns("db.a"), &ns("db.b"), false)
        .unwrap_err();
    assert!(matches!(err, CatalogError::AlreadyExists(_)));
    assert_eq!(txn.pending_changes(), 0);
}

// Sizes and bookkeeping

#[test]
fn size_on_disk_sums_collections_and_indexes() {
    let f = Fixture::new();
    f.create("db.a", CollectionOptions::default());
    f.create("db.b", CollectionOptions::default());

    let txn = f.begin();
    let extra = f
        .catalog
        .add_index(&txn, &ns("db.a"), IndexSpec::new("x_1", json!({"x": 1})))
        .unwrap();
    txn.commit().unwrap();

    let a = f.registry.get(&ns("db.a")).unwrap().unwrap();
    let b = f.registry.get(&ns("db.b")).unwrap().unwrap();
    f.engine.set_ident_size(a.ident(), 100);
    f.engine.set_ident_size(b.ident(), 50);
    f.engine.set_ident_size(&a.index_ident("_id_").unwrap(), 10);
    f.engine.set_ident_size(&extra, 20);
    f.engine.set_ident_size(&b.index_ident("_id_").unwrap(), 5);

    assert_eq!(a.all_indexes().unwrap().len(), 2);
    assert_eq!(f.registry.size_on_disk().unwrap(), 185);
}

#[test]
fn at_most_one_handle_per_ident() {
    let f = Fixture::new();
    for name in ["db.a", "db.b", "db.c"] {
        f.create(name, CollectionOptions::default());
    }
    let txn = f.begin();
    f.registry
        .rename_collection(&txn, &ns("db.c"), &ns("db.d"), false)
        .unwrap();
    txn.commit().unwrap();

    let idents: Vec<_> = f
        .registry
        .cached_namespaces()
        .iter()
        .map(|n| f.registry.get(n).unwrap().unwrap().ident().clone())
        .collect();
    let unique: BTreeSet<_> = idents.iter().map(|i| i.as_str().to_string()).collect();
    assert_eq!(idents.len(), 3);
    assert_eq!(unique.len(), 3);
    for ident in &idents {
        assert_eq!(f.engine.open_count(ident), 1);
    }
}

#[test]
fn init_collection_twice_fails() {
    let f = Fixture::new();
    f.create("db.foo", CollectionOptions::default());
    let f = f.reopen();

    f.registry.init_collection(&ns("db.foo")).unwrap();
    assert_eq!(f.registry.collection_count(), 1);
    let err = f.registry.init_collection(&ns("db.foo")).unwrap_err();
    assert!(matches!(err, CatalogError::AlreadyExists(_)));
}

#[test]
fn list_namespaces_comes_from_engine() {
    let f = Fixture::new();
    f.create("db.a", CollectionOptions::default());
    let other = CollectionRegistry::new("other", f.engine.clone(), f.catalog.clone());
    let txn = f.txns.begin();
    txn.lock_database("other", LockMode::Exclusive).unwrap();
    other
        .create_collection(&txn, &ns("other.x"), &CollectionOptions::default(), None)
        .unwrap();
    txn.commit().unwrap();

    assert_eq!(f.registry.list_namespaces(), BTreeSet::from([ns("db.a")]));
    assert_eq!(
        f.engine.list_collections("other"),
        BTreeSet::from([ns("other.x")])
    );
}
