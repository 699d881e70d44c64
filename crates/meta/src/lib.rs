//! Metadata store contract.
//!
//! The engine depends on a set of queries over compounds, fragments,
//! resources and the two mapping tables, not on a schema. [`Meta`] is that
//! behavioral contract; [`MemoryMeta`] is the in-process reference
//! implementation the test suite runs against. SQL-backed drivers live
//! outside the core and implement the same trait.
//!
//! # Transaction scopes
//!
//! Scopes are re-entrant: `begin` may nest, mutations inside a scope are
//! visible to subsequent reads in the same scope, the outermost normal exit
//! commits and a failure rolls the whole scope back. [`MetaScope`] is the
//! RAII helper the engine uses; dropping it without [`MetaScope::commit`]
//! rolls back.

#![warn(clippy::all)]

mod memory;

pub use memory::MemoryMeta;

use std::collections::HashSet;
use std::sync::Arc;
use stowage_core::{
    Compound, CompoundHash, CompoundId, CompoundKind, CompoundName, Fragment, FragmentHash,
    FragmentId, FragmentOffset, Resource, ResourceHash, ResourceId, ResourceName, Result,
    SequenceIndex,
};

/// Filters for compound listings.
#[derive(Debug, Clone, Default)]
pub struct CompoundFilter {
    /// Only compounds of this kind.
    pub kind: Option<CompoundKind>,
    /// Sort the result by name (then version).
    pub alphabetical: bool,
    /// Only names starting with this prefix.
    pub prefix: Option<String>,
    /// Only names ending with this suffix.
    pub suffix: Option<String>,
    /// Only names containing exactly this many `/` separators.
    pub slash_count: Option<usize>,
    /// Only compounds of at least this plaintext size.
    pub min_size: Option<u64>,
    /// Include snapshot versions; the default lists live rows only.
    pub include_snapshots: bool,
}

impl CompoundFilter {
    pub fn kind(mut self, kind: CompoundKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn alphabetical(mut self) -> Self {
        self.alphabetical = true;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn slash_count(mut self, count: usize) -> Self {
        self.slash_count = Some(count);
        self
    }

    pub fn min_size(mut self, size: u64) -> Self {
        self.min_size = Some(size);
        self
    }

    pub fn include_snapshots(mut self) -> Self {
        self.include_snapshots = true;
        self
    }
}

/// Durable index over compounds, fragments, resources and their mappings.
///
/// All methods take `&self`; implementations serialize internally. Mutations
/// performed inside a scope must be visible to later reads in the same scope.
pub trait Meta: Send + Sync {
    // ------------------------------------------------------------------
    // Transaction scope
    // ------------------------------------------------------------------

    /// Enter a (re-entrant) scope.
    fn begin(&self);

    /// Leave a scope; the outermost commit makes its mutations durable.
    fn commit(&self) -> Result<()>;

    /// Leave a scope discarding every mutation since the outermost `begin`.
    fn rollback(&self);

    // ------------------------------------------------------------------
    // Compounds
    // ------------------------------------------------------------------

    /// Whether a compound row `(name, version)` exists. `None` = live row.
    fn has_compound(&self, name: &CompoundName, version: Option<u32>) -> Result<bool>;

    /// Fetch the compound row `(name, version)`.
    ///
    /// # Errors
    ///
    /// `CompoundNotExisting` when no such row exists.
    fn get_compound(&self, name: &CompoundName, version: Option<u32>) -> Result<Compound>;

    /// First compound row with `hash` at `version`.
    fn get_compound_by_hash(&self, hash: &CompoundHash, version: Option<u32>) -> Result<Compound>;

    /// A compound row with `hash` that still has sequence-mapping rows.
    /// Used by repair to find a donor mapping.
    fn get_compound_by_hash_with_fragment_links(&self, hash: &CompoundHash) -> Result<Compound>;

    /// Insert a new compound row.
    ///
    /// # Errors
    ///
    /// `CompoundAlreadyExists` when `(name, version)` is already taken.
    fn make_compound(&self, compound: &Compound) -> Result<Compound>;

    /// Snapshot the live row of `name`: insert a copy carrying the next
    /// unused positive version and duplicate its sequence mapping.
    fn make_snapshot(&self, name: &CompoundName) -> Result<Compound>;

    /// Rename every version of `old` to `new`.
    ///
    /// # Errors
    ///
    /// `CompoundAlreadyExists` when any row already carries `new`;
    /// `CompoundNotExisting` when `old` has no rows.
    fn rename_compound(&self, old: &CompoundName, new: &CompoundName) -> Result<()>;

    /// Remove one compound row and its sequence-mapping rows.
    fn remove_compound(&self, id: CompoundId) -> Result<()>;

    /// Remove the live row of `name` and, unless `keep_snapshots`, all its
    /// snapshot rows. Cascades sequence-mapping rows.
    fn remove_compound_by_name(&self, name: &CompoundName, keep_snapshots: bool) -> Result<()>;

    /// Remove every compound row (and all sequence-mapping rows).
    fn truncate_compounds(&self) -> Result<()>;

    /// List compounds matching `filter`.
    fn list_compounds(&self, filter: &CompoundFilter) -> Result<Vec<Compound>>;

    /// All `(name, version)` pairs; live rows only unless `include_snapshots`.
    fn list_compound_names(
        &self,
        include_snapshots: bool,
    ) -> Result<Vec<(CompoundName, Option<u32>)>>;

    /// Snapshot rows of `name` within the version bounds, optionally with the
    /// live row included.
    fn list_snapshots(
        &self,
        name: &CompoundName,
        min_version: Option<u32>,
        max_version: Option<u32>,
        include_live: bool,
    ) -> Result<Vec<Compound>>;

    /// Atomic upsert of `compound` (replacing the live row of its name when
    /// one exists) plus replacement of its sequence mapping. Fragments are
    /// resolved by hash and must already have rows.
    fn add_overwrite_compound_and_map_fragments(
        &self,
        compound: &Compound,
        sequence: &[(Fragment, SequenceIndex)],
    ) -> Result<Compound>;

    /// Replace the sequence-mapping rows of one compound.
    fn set_fragment_mappings_for_compound(
        &self,
        id: CompoundId,
        rows: &[(FragmentId, SequenceIndex)],
    ) -> Result<()>;

    /// Fragments of a compound in ascending sequence order.
    fn sequence_fragments_for_compound(
        &self,
        id: CompoundId,
    ) -> Result<Vec<(SequenceIndex, Fragment)>>;

    /// Fragment hashes a compound references (deduplicated).
    fn fragment_hashes_for_compound(&self, id: CompoundId) -> Result<Vec<FragmentHash>>;

    /// Non-empty compounds with no sequence-mapping rows (consistency check).
    fn compounds_without_fragment_links(&self) -> Result<Vec<Compound>>;

    // ------------------------------------------------------------------
    // Fragments
    // ------------------------------------------------------------------

    fn has_fragment(&self, hash: &FragmentHash) -> Result<bool>;

    fn get_fragment(&self, hash: &FragmentHash) -> Result<Fragment>;

    fn get_fragment_by_id(&self, id: FragmentId) -> Result<Fragment>;

    /// Get-or-create a fragment row by hash.
    fn make_fragment(&self, hash: &FragmentHash, size: u64, payload_size: u64) -> Result<Fragment>;

    /// Delete fragment rows (cascades their mapping rows).
    fn delete_fragments(&self, fragments: &[Fragment]) -> Result<()>;

    /// Fragments referenced by no compound.
    fn unreferenced_fragments(&self) -> Result<Vec<Fragment>>;

    /// Fragments with no fragment-resource mapping (consistency check).
    fn fragments_without_resource_links(&self) -> Result<Vec<Fragment>>;

    /// All fragments ordered by the id of the first compound using them, then
    /// by that compound's sequence index. Fragments referenced by no compound
    /// are omitted.
    fn all_fragments_sorted_by_compound_usage(&self) -> Result<Vec<Fragment>>;

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Insert a resource row.
    fn make_resource(
        &self,
        name: &ResourceName,
        size: u64,
        payload_size: u64,
        hash: &ResourceHash,
        wrap_tag: &stowage_core::WrapTag,
        compress_tag: &stowage_core::CompressTag,
    ) -> Result<Resource>;

    fn get_resource_by_hash(&self, hash: &ResourceHash) -> Result<Resource>;

    fn get_resource_by_name(&self, name: &ResourceName) -> Result<Resource>;

    /// Delete a resource row (cascades mapping rows pointing at it).
    fn delete_resource(&self, id: ResourceId) -> Result<()>;

    fn all_resources(&self) -> Result<Vec<Resource>>;

    /// All resources sorted by descending payload size.
    fn all_resources_size_sorted(&self) -> Result<Vec<Resource>>;

    fn all_resource_names(&self) -> Result<Vec<ResourceName>>;

    /// Smallest resource (by payload size) that still holds at least one
    /// mapped fragment, skipping resources whose hash is in `ignore`.
    fn smallest_resource(&self, ignore: &HashSet<ResourceHash>) -> Result<Option<Resource>>;

    /// Resources referenced by no fragment mapping.
    fn unreferenced_resources(&self) -> Result<Vec<Resource>>;

    /// Every resource with the byte sum of the fragments currently mapped to
    /// it. `payload_size` minus that sum is the resource's hole size.
    fn resources_with_referenced_fragment_size(&self) -> Result<Vec<(Resource, u64)>>;

    // ------------------------------------------------------------------
    // Fragment-resource mapping
    // ------------------------------------------------------------------

    /// The resource holding `fragment` and its offset within the payload.
    ///
    /// # Errors
    ///
    /// `NotFound` when the fragment has no mapping.
    fn resource_and_offset_for_fragment(
        &self,
        id: FragmentId,
    ) -> Result<(Resource, FragmentOffset)>;

    /// Fragments stored on one resource with their offsets, ascending.
    fn fragments_with_offset_on_resource(
        &self,
        id: ResourceId,
    ) -> Result<Vec<(Fragment, FragmentOffset)>>;

    fn has_resource_mapping(&self, id: FragmentId) -> Result<bool>;

    /// Atomically get-or-create fragment rows and point their mapping at
    /// `resource` with the given offsets (replacing prior mappings).
    fn make_and_map_fragments_to_resource(
        &self,
        resource: ResourceId,
        rows: &[(Fragment, FragmentOffset)],
    ) -> Result<Vec<Fragment>>;

    /// Point existing fragments' mappings at `resource` with new offsets.
    fn map_fragments_to_resource(
        &self,
        resource: ResourceId,
        rows: &[(FragmentId, FragmentOffset)],
    ) -> Result<()>;

    /// Re-point every mapping on `old` to `new`, keeping offsets.
    fn move_fragment_mappings(&self, old: ResourceId, new: ResourceId) -> Result<()>;

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    fn total_compound_count(&self, kind: Option<CompoundKind>) -> Result<u64>;
    fn total_compound_size(&self) -> Result<u64>;
    fn snapshot_count(&self) -> Result<u64>;
    /// Live compounds deduplicated by compound hash.
    fn unique_compound_count(&self) -> Result<u64>;
    /// Total size of live compounds counting each distinct hash once.
    fn unique_compound_size(&self) -> Result<u64>;
    fn total_fragment_count(&self) -> Result<u64>;
    fn total_fragment_size(&self) -> Result<u64>;
    fn total_resource_count(&self) -> Result<u64>;
    fn total_resource_size(&self) -> Result<u64>;
    /// Excess sequence references beyond the first per fragment.
    fn duplicate_fragment_count(&self) -> Result<u64>;
    /// `Σ fragment.size × (refcount − 1)` over all fragments.
    fn saved_bytes_by_duplicate_fragments(&self) -> Result<u64>;
    /// Excess live compounds beyond the first per compound hash.
    fn multiple_used_compound_count(&self, kind: Option<CompoundKind>) -> Result<u64>;
    /// `Σ compound.size × (dup_count − 1)` per shared compound hash.
    fn saved_bytes_by_multiple_used_compounds(&self) -> Result<u64>;
}

/// RAII transaction scope over a [`Meta`].
///
/// Created by [`scope`]; committing consumes the guard, dropping it without a
/// commit rolls the scope back.
pub struct MetaScope {
    meta: Arc<dyn Meta>,
    finished: bool,
}

impl MetaScope {
    /// Commit this scope level.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.meta.commit()
    }
}

impl Drop for MetaScope {
    fn drop(&mut self) {
        if !self.finished {
            self.meta.rollback();
        }
    }
}

/// Enter a transaction scope on `meta`.
pub fn scope(meta: &Arc<dyn Meta>) -> MetaScope {
    meta.begin();
    MetaScope {
        meta: Arc::clone(meta),
        finished: false,
    }
}
