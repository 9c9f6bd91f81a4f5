//! Namespaces, storage idents and key-space prefixes

use crate::error::{CatalogError, CatalogResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Fully-qualified collection name, `"<db>.<collection>"`.
///
/// The empty namespace is representable so callers can hand it to `create`
/// and get `InvalidArgument` back instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceString {
    ns: String,
    dot: usize,
}

impl NamespaceString {
    /// Parse a namespace
    pub fn new(ns: impl Into<String>) -> CatalogResult<Self> {
        let ns = ns.into();
        if ns.is_empty() {
            return Ok(Self { ns, dot: 0 });
        }

        let dot = ns.find('.').ok_or_else(|| {
            CatalogError::InvalidArgument(format!("namespace '{}' has no collection part", ns))
        })?;

        if dot == 0 {
            return Err(CatalogError::InvalidArgument(format!(
                "namespace '{}' has an empty database name",
                ns
            )));
        }
        if dot + 1 == ns.len() {
            return Err(CatalogError::InvalidArgument(format!(
                "namespace '{}' has an empty collection name",
                ns
            )));
        }

        Ok(Self { ns, dot })
    }

    /// Build a namespace from its database and collection parts.
    pub fn from_parts(db: &str, coll: &str) -> CatalogResult<Self> {
        Self::new(format!("{}.{}", db, coll))
    }

    pub fn empty() -> Self {
        Self {
            ns: String::new(),
            dot: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ns.is_empty()
    }

    pub fn db(&self) -> &str {
        &self.ns[..self.dot]
    }

    pub fn coll(&self) -> &str {
        if self.ns.is_empty() {
            ""
        } else {
            &self.ns[self.dot + 1..]
        }
    }

    pub fn as_str(&self) -> &str {
        &self.ns
    }
}

impl fmt::Display for NamespaceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ns)
    }
}

impl TryFrom<String> for NamespaceString {
    type Error = CatalogError;

    fn try_from(value: String) -> CatalogResult<Self> {
        Self::new(value)
    }
}

impl From<NamespaceString> for String {
    fn from(ns: NamespaceString) -> Self {
        ns.ns
    }
}

/// Engine-assigned handle to a physical storage object. Unrelated to the
/// namespace text and stable across renames.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ident(pub String);

impl Ident {
    pub fn new(ident: impl Into<String>) -> Self {
        Self(ident.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition tag for a collection's keys inside a shared physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KvPrefix(pub i64);

impl KvPrefix {
    /// Prefix used when collections are not grouped into shared tables.
    pub const NOT_PREFIXED: KvPrefix = KvPrefix(-1);

    pub fn is_prefixed(self) -> bool {
        self != Self::NOT_PREFIXED
    }
}

impl fmt::Display for KvPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing prefixes. A prefix is never handed out twice,
/// even after the collection that held it is dropped.
#[derive(Debug)]
pub struct PrefixAllocator {
    grouped: bool,
    next: AtomicI64,
}

impl PrefixAllocator {
    pub fn new(grouped: bool) -> Self {
        Self {
            grouped,
            next: AtomicI64::new(0),
        }
    }

    /// Make sure every future prefix is above `seen`.
    pub fn observe(&self, seen: KvPrefix) {
        self.next.fetch_max(seen.0 + 1, Ordering::SeqCst);
    }

    pub fn next_prefix(&self) -> KvPrefix {
        if !self.grouped {
            return KvPrefix::NOT_PREFIXED;
        }
        KvPrefix(self.next.fetch_add(1, Ordering::SeqCst))
    }
}
