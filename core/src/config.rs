use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult};

/// Catalog and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory holding the catalog file
    pub data_dir: PathBuf,
    /// Catalog file name inside `data_dir`
    pub catalog_file: String,
    /// Give each new collection and index its own key prefix
    pub group_collections: bool,
    /// fsync the catalog file after every write
    pub sync_on_write: bool,
    /// Materialize every persisted collection when a database is opened
    pub load_on_startup: bool,
    /// Default `tracing` filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            catalog_file: "_mdb_catalog.json".to_string(),
            group_collections: true,
            sync_on_write: true,
            load_on_startup: false,
            log_level: "info".to_string(),
        }
    }
}

impl CatalogConfig {
    /// Config rooted at `data_dir` with everything else defaulted.
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(&self.catalog_file)
    }

    /// Load config from a TOML file, then apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> CatalogResult<Self> {
        let path = path.as_ref();
        let mut cfg = match fs::read_to_string(path) {
            Ok(s) => toml::from_str(&s).map_err(|e| {
                CatalogError::Config(format!("invalid config '{}': {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Apply MONODB_*/MDB_* environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MONODB_DATA_DIR").or_else(|_| env::var("MDB_DATA_DIR")) {
            self.data_dir = PathBuf::from(v);
        }

        if let Ok(v) = env::var("MONODB_SYNC_ON_WRITE").or_else(|_| env::var("MDB_SYNC_ON_WRITE"))
            && let Ok(b) = v.parse::<bool>()
        {
            self.sync_on_write = b;
        }

        if let Ok(v) = env::var("MONODB_LOG").or_else(|_| env::var("MDB_LOG")) {
            self.log_level = v;
        }
    }
}
