//! Usage statistics over the metadata index.

use crate::engine::Engine;
use stowage_core::{CompoundKind, Result};

/// Aggregate counts and byte sums. "Unique" figures deduplicate live
/// compounds by content hash; "multiple used" figures count the excess
/// duplicates; "saved bytes" quantify what deduplication avoided storing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    pub total_compound_count: u64,
    pub total_compound_size: u64,
    pub unique_compound_count: u64,
    pub unique_compound_size: u64,
    pub snapshot_count: u64,
    pub total_fragment_count: u64,
    pub total_fragment_size: u64,
    pub total_resource_count: u64,
    pub total_resource_size: u64,
    pub multiple_used_fragment_count: u64,
    pub saved_bytes_by_duplicate_fragments: u64,
    pub multiple_used_compound_count: u64,
    pub saved_bytes_by_multiple_used_compounds: u64,
    pub unneeded_fragment_count: u64,
    pub unneeded_fragment_size: u64,
}

impl Engine {
    /// Collect the full statistics snapshot.
    pub fn statistics(&self) -> Result<Statistics> {
        let meta = &self.shared.meta;
        let scope = stowage_meta::scope(meta);
        let unneeded = meta.unreferenced_fragments()?;
        let stats = Statistics {
            total_compound_count: meta.total_compound_count(None)?,
            total_compound_size: meta.total_compound_size()?,
            unique_compound_count: meta.unique_compound_count()?,
            unique_compound_size: meta.unique_compound_size()?,
            snapshot_count: meta.snapshot_count()?,
            total_fragment_count: meta.total_fragment_count()?,
            total_fragment_size: meta.total_fragment_size()?,
            total_resource_count: meta.total_resource_count()?,
            total_resource_size: meta.total_resource_size()?,
            multiple_used_fragment_count: meta.duplicate_fragment_count()?,
            saved_bytes_by_duplicate_fragments: meta.saved_bytes_by_duplicate_fragments()?,
            multiple_used_compound_count: meta.multiple_used_compound_count(None)?,
            saved_bytes_by_multiple_used_compounds: meta
                .saved_bytes_by_multiple_used_compounds()?,
            unneeded_fragment_count: unneeded.len() as u64,
            unneeded_fragment_size: unneeded.iter().map(|f| f.size).sum(),
        };
        scope.commit()?;
        Ok(stats)
    }

    pub fn total_compound_count(&self, kind: Option<CompoundKind>) -> Result<u64> {
        self.shared.meta.total_compound_count(kind)
    }

    pub fn total_compound_size(&self) -> Result<u64> {
        self.shared.meta.total_compound_size()
    }

    pub fn unique_compound_count(&self) -> Result<u64> {
        self.shared.meta.unique_compound_count()
    }

    pub fn total_fragment_count(&self) -> Result<u64> {
        self.shared.meta.total_fragment_count()
    }

    pub fn total_resource_count(&self) -> Result<u64> {
        self.shared.meta.total_resource_count()
    }

    pub fn total_resource_size(&self) -> Result<u64> {
        self.shared.meta.total_resource_size()
    }
}
