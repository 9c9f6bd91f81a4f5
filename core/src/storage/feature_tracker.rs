//! Persisted on-disk format features
//!
//! Features are bits in the catalog's sentinel feature document. A
//! non-repairable feature, once in use, cannot be undone by a repair; a binary
//! that does not recognise a set bit must refuse to open the data files.

use crate::error::{CatalogError, CatalogResult};
use crate::storage::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonRepairableFeature {
    /// Some collection or index uses a non-simple collation.
    Collation,
}

impl NonRepairableFeature {
    pub const ALL: [NonRepairableFeature; 1] = [NonRepairableFeature::Collation];

    pub fn bit(self) -> u64 {
        match self {
            NonRepairableFeature::Collation => 1 << 0,
        }
    }

    pub fn known_mask() -> u64 {
        Self::ALL.iter().fold(0, |mask, f| mask | f.bit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairableFeature {
    IndexKeyStringWithLongTypeBits,
}

impl RepairableFeature {
    pub const ALL: [RepairableFeature; 1] = [RepairableFeature::IndexKeyStringWithLongTypeBits];

    pub fn bit(self) -> u64 {
        match self {
            RepairableFeature::IndexKeyStringWithLongTypeBits => 1 << 0,
        }
    }

    pub fn known_mask() -> u64 {
        Self::ALL.iter().fold(0, |mask, f| mask | f.bit())
    }
}

/// Reads and marks feature bits in the catalog.
pub trait FeatureTracker: Send + Sync {
    fn is_non_repairable_feature_in_use(&self, feature: NonRepairableFeature)
    -> CatalogResult<bool>;

    /// Set a bit. Undone if `txn` rolls back.
    fn mark_non_repairable_feature_as_in_use(
        &self,
        txn: &Transaction,
        feature: NonRepairableFeature,
    ) -> CatalogResult<()>;

    fn is_repairable_feature_in_use(&self, feature: RepairableFeature) -> CatalogResult<bool>;

    fn mark_repairable_feature_as_in_use(
        &self,
        txn: &Transaction,
        feature: RepairableFeature,
    ) -> CatalogResult<()>;

    /// Fails when the data files use a feature this build does not know.
    fn is_compatible_with_current_code(&self) -> CatalogResult<()>;
}

/// Check raw feature bits against the features this build understands.
pub fn check_feature_bits(non_repairable: u64, repairable: u64) -> CatalogResult<()> {
    let unknown = non_repairable & !NonRepairableFeature::known_mask();
    if unknown != 0 {
        return Err(CatalogError::IncompatibleDataFiles(format!(
            "the data files use non-repairable features not recognized by this version \
             (bits {:#x}); a newer version is required to open them",
            unknown
        )));
    }

    let unknown = repairable & !RepairableFeature::known_mask();
    if unknown != 0 {
        return Err(CatalogError::IncompatibleDataFiles(format!(
            "the data files use repairable features not recognized by this version \
             (bits {:#x}); repair the data files or use a newer version",
            unknown
        )));
    }

    Ok(())
}
