use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors surfaced by the collection catalog and its collaborators.
///
/// Engine and catalog-store failures that the registry does not interpret are
/// carried as [`CatalogError::Storage`] and returned to the caller unchanged.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Incompatible data files: {0}")]
    IncompatibleDataFiles(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    /// Get the inner message without the type prefix.
    pub fn message(&self) -> String {
        match self {
            CatalogError::Io(err) => err.to_string(),
            CatalogError::InvalidArgument(msg)
            | CatalogError::NotFound(msg)
            | CatalogError::AlreadyExists(msg)
            | CatalogError::Storage(msg)
            | CatalogError::Serialization(msg)
            | CatalogError::Transaction(msg)
            | CatalogError::IncompatibleDataFiles(msg)
            | CatalogError::Config(msg)
            | CatalogError::Internal(msg) => msg.clone(),
        }
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogError::InvalidArgument(_) => "invalid_argument",
            CatalogError::NotFound(_) => "not_found",
            CatalogError::AlreadyExists(_) => "already_exists",
            CatalogError::Storage(_) => "storage_error",
            CatalogError::Io(_) => "io_error",
            CatalogError::Serialization(_) => "serialization_error",
            CatalogError::Transaction(_) => "transaction_error",
            CatalogError::IncompatibleDataFiles(_) => "incompatible_data_files",
            CatalogError::Config(_) => "config_error",
            CatalogError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Serialization(err.to_string())
    }
}
