//! Collection metadata and the persisted catalog document schema
//!
//! Every collection is one document in the catalog store:
//!
//! ```text
//! { ns: <namespace>, ident: <string>, md: { ns, options, prefix, indexes }, idxIdent: { <index name>: <ident> } }
//! ```
//!
//! Engine-wide feature flags live in a separate sentinel document marked with
//! `isFeatureDoc: true`. It shares storage with the collection documents but is
//! never a collection.

use crate::error::{CatalogError, CatalogResult};
use crate::storage::{Ident, KvPrefix, NamespaceString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Name every `_id` index must carry.
pub const ID_INDEX_NAME: &str = "_id_";

/// Collation locale that means "plain binary comparison".
pub const SIMPLE_LOCALE: &str = "simple";

/// String comparison rules attached to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collation {
    pub locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<i32>,
    #[serde(default)]
    pub case_level: bool,
}

impl Collation {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            strength: None,
            case_level: false,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.locale == SIMPLE_LOCALE
    }
}

/// Storage options a collection is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collation: Option<Collation>,
    pub capped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
    pub temp: bool,
}

impl CollectionOptions {
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn capped(mut self, size: u64) -> Self {
        self.capped = true;
        self.size = Some(size);
        self
    }

    pub fn temp(mut self) -> Self {
        self.temp = true;
        self
    }

    /// Whether a collation other than the simple one is in effect.
    pub fn has_non_simple_collation(&self) -> bool {
        self.collation.as_ref().is_some_and(|c| !c.is_simple())
    }

    pub fn validate(&self) -> CatalogResult<()> {
        if let Some(collation) = &self.collation
            && collation.locale.is_empty()
        {
            return Err(CatalogError::InvalidArgument(
                "collation locale cannot be empty".into(),
            ));
        }

        if self.capped {
            match self.size {
                Some(size) if size > 0 => {}
                _ => {
                    return Err(CatalogError::InvalidArgument(
                        "capped collection requires a positive size".into(),
                    ));
                }
            }
        } else if self.max.is_some() {
            return Err(CatalogError::InvalidArgument(
                "'max' is only allowed on capped collections".into(),
            ));
        }

        Ok(())
    }
}

/// Index descriptor as declared by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: Value,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key: Value) -> Self {
        Self {
            name: name.into(),
            key,
            unique: false,
        }
    }

    /// The default `{_id: 1}` index.
    pub fn id_index() -> Self {
        Self::new(ID_INDEX_NAME, json!({ "_id": 1 }))
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn validate(&self) -> CatalogResult<()> {
        if self.name.is_empty() {
            return Err(CatalogError::InvalidArgument("index name cannot be empty".into()));
        }
        match self.key.as_object() {
            Some(fields) if !fields.is_empty() => Ok(()),
            _ => Err(CatalogError::InvalidArgument(format!(
                "index '{}' must have a non-empty key pattern object",
                self.name
            ))),
        }
    }

    /// Check a spec passed as the `_id` index of a new collection.
    pub fn validate_id_index(&self) -> CatalogResult<()> {
        self.validate()?;
        if self.name != ID_INDEX_NAME {
            return Err(CatalogError::InvalidArgument(format!(
                "_id index must be named '{}', got '{}'",
                ID_INDEX_NAME, self.name
            )));
        }
        if self.key != json!({ "_id": 1 }) {
            return Err(CatalogError::InvalidArgument(format!(
                "_id index key pattern must be {{_id: 1}}, got {}",
                self.key
            )));
        }
        Ok(())
    }
}

/// Per-index metadata persisted with the collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub spec: IndexSpec,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub multikey: bool,
    pub prefix: KvPrefix,
}

/// Metadata cached in a collection handle and embedded as `md` in its
/// catalog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub ns: NamespaceString,
    #[serde(default)]
    pub options: CollectionOptions,
    pub prefix: KvPrefix,
    #[serde(default)]
    pub indexes: Vec<IndexMetaData>,
}

impl CollectionMetadata {
    pub fn new(ns: NamespaceString, options: CollectionOptions, prefix: KvPrefix) -> Self {
        Self {
            ns,
            options,
            prefix,
            indexes: Vec::new(),
        }
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.iter().map(|i| i.spec.name.clone()).collect()
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexMetaData> {
        self.indexes.iter().find(|i| i.spec.name == name)
    }
}

/// One collection's catalog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub ns: NamespaceString,
    pub ident: Ident,
    pub md: CollectionMetadata,
    #[serde(rename = "idxIdent", default)]
    pub idx_ident: BTreeMap<String, Ident>,
}

impl CatalogDocument {
    pub fn to_value(&self) -> CatalogResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> CatalogResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// The sentinel document carrying engine-wide feature bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDocument {
    #[serde(rename = "isFeatureDoc")]
    pub is_feature_doc: bool,
    pub ns: Option<String>,
    #[serde(rename = "nonRepairable", default)]
    pub non_repairable: u64,
    #[serde(default)]
    pub repairable: u64,
}

impl FeatureDocument {
    pub fn new() -> Self {
        Self {
            is_feature_doc: true,
            ..Self::default()
        }
    }
}

/// Whether a catalog document is the feature sentinel rather than a collection.
pub fn is_feature_document(doc: &Value) -> bool {
    doc.get("isFeatureDoc").and_then(Value::as_bool) == Some(true)
}

/// Pull the parts the registry needs out of a collection document. A missing
/// or non-object `md` field yields default metadata, as older documents lack it.
pub fn parse_collection_entry(
    ns: &NamespaceString,
    doc: &Value,
) -> CatalogResult<(Ident, CollectionMetadata)> {
    let ident = doc
        .get("ident")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CatalogError::Storage(format!("catalog entry for '{}' has no string ident", ns))
        })?;

    let md = match doc.get("md") {
        Some(md) if md.is_object() => serde_json::from_value(md.clone())?,
        _ => CollectionMetadata::new(
            ns.clone(),
            CollectionOptions::default(),
            KvPrefix::NOT_PREFIXED,
        ),
    };

    Ok((Ident::new(ident), md))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ns(s: &str) -> NamespaceString {
        NamespaceString::new(s).unwrap()
    }

    #[test]
    fn test_options_validation() {
        assert!(CollectionOptions::default().validate().is_ok());
        assert!(CollectionOptions::default().capped(4096).validate().is_ok());

        let mut bad = CollectionOptions::default();
        bad.capped = true;
        assert!(bad.validate().is_err());

        let mut max_only = CollectionOptions::default();
        max_only.max = Some(10);
        assert!(max_only.validate().is_err());

        let empty_locale = CollectionOptions::default().with_collation(Collation::new(""));
        assert!(empty_locale.validate().is_err());
    }

    #[test]
    fn test_non_simple_collation() {
        assert!(!CollectionOptions::default().has_non_simple_collation());
        let simple = CollectionOptions::default().with_collation(Collation::new(SIMPLE_LOCALE));
        assert!(!simple.has_non_simple_collation());
        let french = CollectionOptions::default().with_collation(Collation::new("fr"));
        assert!(french.has_non_simple_collation());
    }

    #[test]
    fn test_id_index_validation() {
        assert!(IndexSpec::id_index().validate_id_index().is_ok());
        assert!(
            IndexSpec::new("_id_", json!({ "_id": -1 }))
                .validate_id_index()
                .is_err()
        );
        assert!(
            IndexSpec::new("by_id", json!({ "_id": 1 }))
                .validate_id_index()
                .is_err()
        );
        assert!(IndexSpec::new("a_1", json!({})).validate().is_err());
    }

    #[test]
    fn test_document_shape() {
        let mut md = CollectionMetadata::new(ns("db.foo"), CollectionOptions::default(), KvPrefix(7));
        md.indexes.push(IndexMetaData {
            spec: IndexSpec::id_index(),
            ready: true,
            multikey: false,
            prefix: KvPrefix(8),
        });
        let doc = CatalogDocument {
            ns: ns("db.foo"),
            ident: Ident::new("collection-1-abc"),
            md,
            idx_ident: BTreeMap::from([("_id_".to_string(), Ident::new("index-2-abc"))]),
        };

        let value = doc.to_value().unwrap();
        assert_eq!(value["ns"], json!("db.foo"));
        assert_eq!(value["ident"], json!("collection-1-abc"));
        assert_eq!(value["md"]["prefix"], json!(7));
        assert_eq!(value["idxIdent"]["_id_"], json!("index-2-abc"));
        assert!(!is_feature_document(&value));

        let (ident, parsed) = parse_collection_entry(&ns("db.foo"), &value).unwrap();
        assert_eq!(ident, Ident::new("collection-1-abc"));
        assert_eq!(parsed.index_names(), vec!["_id_".to_string()]);
        assert_eq!(parsed.prefix, KvPrefix(7));
    }

    #[test]
    fn test_parse_without_md_uses_defaults() {
        let value = json!({ "ns": "db.old", "ident": "collection-9" });
        let (ident, md) = parse_collection_entry(&ns("db.old"), &value).unwrap();
        assert_eq!(ident.as_str(), "collection-9");
        assert_eq!(md.prefix, KvPrefix::NOT_PREFIXED);
        assert!(md.indexes.is_empty());
    }

    #[test]
    fn test_parse_without_ident_fails() {
        let value = json!({ "ns": "db.broken", "md": {} });
        assert!(parse_collection_entry(&ns("db.broken"), &value).is_err());
    }

    #[test]
    fn test_feature_document_detection() {
        let value = serde_json::to_value(FeatureDocument::new()).unwrap();
        assert!(is_feature_document(&value));
        assert_eq!(value["ns"], Value::Null);
    }
}
