//! Engine facade: the public operations over one metadata store and one
//! storage backend.
//!
//! The facade owns the lock tables for the three namespaces (compound names,
//! fragment hashes, resource names), the transform registries, the pending
//! controller and the fragment cache, and orchestrates them for
//! save/load/copy/rename/delete/snapshot, listings, statistics, garbage
//! collection, the space/usage/defragment optimizations and the consistency
//! checks (those live in `maintenance.rs`).
//!
//! Write paths that fail purge the pending controller's compounds and
//! fragments from the metadata store before the error propagates, so a
//! half-written compound never survives as dangling rows.

use crate::cache::{CacheConfig, FragmentCache};
use crate::config::{EngineConfig, SaveOptions, DEFAULT_FRAGMENT_SIZE};
use crate::pending::PendingObjectsController;
use crate::reader::{CompoundReadAdapter, CompoundReader};
use crate::writer::{self, WritableCompound};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek};
use std::sync::Arc;
use stowage_concurrency::{AccessGuard, AccessManager, MassReserver};
use stowage_core::{
    Compound, CompoundHash, CompoundName, CompressTag, Error, Fragment, FragmentHash, ResourceName,
    Result, WrapTag,
};
use stowage_encap::{CompressorRegistry, WrapperRegistry};
use stowage_meta::{CompoundFilter, Meta};
use stowage_storage::Storage;

/// Everything the writer/reader objects and maintenance operations share.
pub(crate) struct Shared {
    pub meta: Arc<dyn Meta>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<FragmentCache>,
    pub pending: Arc<PendingObjectsController>,
    pub wrappers: Arc<WrapperRegistry>,
    pub compressors: Arc<CompressorRegistry>,
    pub compound_locks: Arc<AccessManager<CompoundName>>,
    pub fragment_locks: Arc<AccessManager<FragmentHash>>,
    pub resource_locks: Arc<AccessManager<ResourceName>>,
}

/// Content-addressed deduplicating backup engine.
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
    pub(crate) config: EngineConfig,
    pub(crate) fragment_size: u64,
}

impl Engine {
    /// Build an engine with the default transform registries (all key-less
    /// wrappers and all compressors).
    pub fn new(
        meta: Arc<dyn Meta>,
        storage: Arc<dyn Storage>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_registries(
            meta,
            storage,
            Arc::new(WrapperRegistry::with_defaults()),
            Arc::new(CompressorRegistry::with_defaults()),
            config,
        )
    }

    /// Build an engine with caller-provided registries (needed for keyed
    /// wrappers such as `aes256`).
    pub fn with_registries(
        meta: Arc<dyn Meta>,
        storage: Arc<dyn Storage>,
        wrappers: Arc<WrapperRegistry>,
        compressors: Arc<CompressorRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        let backend_max = storage.max_resource_size();
        let resource_size = match config.resource_size {
            Some(size) if size > backend_max => {
                return Err(Error::unsupported(format!(
                    "configured resource size {size} exceeds the backend maximum {backend_max}"
                )));
            }
            Some(size) => size,
            None => backend_max,
        };
        let fragment_size = match config.fragment_size {
            Some(size) => size,
            None => DEFAULT_FRAGMENT_SIZE.min(resource_size),
        };
        let resource_wrap_tag = config
            .resource_wrap_tag
            .clone()
            .unwrap_or_else(|| storage.required_wrap_tag());
        if !storage.supports_wrap_tag(&resource_wrap_tag) {
            return Err(Error::unsupported(format!(
                "resource wrap tag '{resource_wrap_tag}' does not end with the backend's required tag '{}'",
                storage.required_wrap_tag()
            )));
        }
        if !wrappers.supports(&resource_wrap_tag) {
            return Err(Error::unsupported_tag(resource_wrap_tag.as_str()));
        }
        if !compressors.supports(&config.resource_compress_tag) {
            return Err(Error::unsupported_tag(config.resource_compress_tag.as_str()));
        }

        let pending = Arc::new(PendingObjectsController::new());
        let cache = Arc::new(FragmentCache::new(
            Arc::clone(&meta),
            Arc::clone(&storage),
            Arc::clone(&pending),
            Arc::clone(&wrappers),
            Arc::clone(&compressors),
            CacheConfig {
                expected_fragment_size: fragment_size,
                resource_size,
                resource_wrap_tag,
                resource_compress_tag: config.resource_compress_tag.clone(),
                min_fill: config.min_fill,
                auto_delete_resource: config.auto_delete_resource,
                cache_last_downloaded_resource: config.cache_last_downloaded_resource,
                upload_on_error: config.upload_on_error,
                strategy: config.strategy,
                initial_policy: config.policy,
            },
        )?);

        Ok(Self {
            shared: Arc::new(Shared {
                meta,
                storage,
                cache,
                pending,
                wrappers,
                compressors,
                compound_locks: Arc::new(AccessManager::new()),
                fragment_locks: Arc::new(AccessManager::new()),
                resource_locks: Arc::new(AccessManager::new()),
            }),
            config,
            fragment_size,
        })
    }

    /// Effective fragment payload size.
    pub fn fragment_size(&self) -> u64 {
        self.fragment_size
    }

    /// The fragment cache, for policy inspection in maintenance flows.
    pub fn cache(&self) -> &FragmentCache {
        &self.shared.cache
    }

    /// Open a write session. While at least one session is open the fragment
    /// cache defers uploads of under-filled resources; closing the outermost
    /// session performs a total flush.
    pub fn session(&self) -> EngineSession<'_> {
        self.shared.cache.enter_scope();
        EngineSession {
            engine: self,
            closed: false,
        }
    }

    /// Force-flush the fragment cache and commit ready pending compounds.
    pub fn flush(&self) -> Result<()> {
        let result = self.shared.cache.flush(true);
        if result.is_err() {
            self.cleanup_pending();
        }
        result
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Open a stream writer for `name`.
    pub fn open_writable(
        &self,
        name: impl Into<CompoundName>,
        options: &SaveOptions,
    ) -> Result<WritableCompound> {
        writer::open(
            Arc::clone(&self.shared),
            name.into(),
            options.kind,
            self.wrap_tag_for(options),
            self.compress_tag_for(options),
            options.fragment_size.unwrap_or(self.fragment_size),
            options.overwrite,
            options.append,
            self.config.blocking,
            self.config.lock_timeout,
        )
    }

    /// Save one byte buffer as a compound.
    pub fn save_bytes(
        &self,
        name: impl Into<CompoundName>,
        data: &[u8],
        options: &SaveOptions,
    ) -> Result<Compound> {
        let name = name.into();
        let result = (|| {
            let mut writable = self.open_writable(name.clone(), options)?;
            writable.write(data)?;
            writable.close()
        })();
        if result.is_err() {
            self.cleanup_pending();
        }
        result
    }

    /// Save a byte stream as a compound, draining it in chunks.
    pub fn save_stream(
        &self,
        stream: &mut dyn Read,
        name: impl Into<CompoundName>,
        options: &SaveOptions,
    ) -> Result<Compound> {
        let name = name.into();
        let chunk_size = options
            .read_chunk_size
            .or(options.fragment_size.map(|s| s as usize))
            .unwrap_or(self.fragment_size as usize)
            .max(1);
        let result = (|| {
            let mut writable = self.open_writable(name.clone(), options)?;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = stream.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writable.write(&buf[..n])?;
            }
            writable.close()
        })();
        if result.is_err() {
            self.cleanup_pending();
        }
        result
    }

    /// Save a seekable stream, honoring `pre_calc_stream_hash`: when the
    /// target exists with identical content the write is skipped with
    /// `CompoundAlreadyExists` (callers treat that as a successful no-op) and
    /// the stream is rewound either way.
    pub fn save_seekable_stream<S: Read + Seek>(
        &self,
        stream: &mut S,
        name: impl Into<CompoundName>,
        options: &SaveOptions,
    ) -> Result<Compound> {
        let name = name.into();
        if options.overwrite && options.pre_calc_stream_hash {
            if let Some(existing) = self.get_compound(&name)? {
                let chunk_size = options
                    .read_chunk_size
                    .unwrap_or(self.fragment_size as usize)
                    .max(1);
                let stream_hash = hash_stream(stream, chunk_size)?;
                stream.rewind()?;
                if stream_hash == existing.hash {
                    return Err(Error::compound_already_exists(&name));
                }
            }
        }
        self.save_stream(stream, name, options)
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Open a lazy reader over the live version of `name`.
    pub fn load(&self, name: impl Into<CompoundName>) -> Result<CompoundReader> {
        self.load_version(name, None)
    }

    /// Open a lazy reader over one version of `name` (`None` = live).
    /// Pending compounds are preferred for the live version, so a reader
    /// inside a write session sees the session's own writes.
    pub fn load_version(
        &self,
        name: impl Into<CompoundName>,
        version: Option<u32>,
    ) -> Result<CompoundReader> {
        let name = name.into();
        let blocking = self.config.blocking;
        let timeout = self.config.lock_timeout;
        let name_guard = AccessGuard::parallel(
            Arc::clone(&self.shared.compound_locks),
            name.clone(),
            blocking,
            timeout,
        )?;

        let scope = stowage_meta::scope(&self.shared.meta);
        let (compound, fragments) = match version {
            None => match self.shared.pending.compound_by_name(&name) {
                Some(pending) => {
                    let mut sequence =
                        self.shared.pending.sequence_for_name(&name).unwrap_or_default();
                    sequence.sort_by_key(|(_, index)| *index);
                    (pending, sequence.into_iter().map(|(f, _)| f).collect())
                }
                None => self.compound_with_fragments(&name, None)?,
            },
            Some(_) => self.compound_with_fragments(&name, version)?,
        };
        let hashes: Vec<FragmentHash> = {
            let mut seen = std::collections::HashSet::new();
            fragments
                .iter()
                .map(|f| f.hash)
                .filter(|h| seen.insert(*h))
                .collect()
        };
        let mut reserver =
            MassReserver::parallel(Arc::clone(&self.shared.fragment_locks), blocking, timeout);
        reserver.reserve_all(&hashes)?;
        scope.commit()?;

        Ok(CompoundReader::new(
            Arc::clone(&self.shared),
            compound,
            fragments,
            name_guard,
            reserver,
        ))
    }

    fn compound_with_fragments(
        &self,
        name: &CompoundName,
        version: Option<u32>,
    ) -> Result<(Compound, Vec<Fragment>)> {
        if !self.shared.meta.has_compound(name, version)? {
            return Err(Error::compound_not_existing(name));
        }
        let compound = self.shared.meta.get_compound(name, version)?;
        let id = compound
            .id
            .ok_or_else(|| Error::internal("metadata returned a compound without id"))?;
        let sequence = self.shared.meta.sequence_fragments_for_compound(id)?;
        Ok((compound, sequence.into_iter().map(|(_, f)| f).collect()))
    }

    /// Load a whole compound into memory.
    pub fn load_bytes(&self, name: impl Into<CompoundName>) -> Result<Vec<u8>> {
        self.load(name)?.read_to_vec()
    }

    /// Load one snapshot version into memory.
    pub fn load_version_bytes(
        &self,
        name: impl Into<CompoundName>,
        version: Option<u32>,
    ) -> Result<Vec<u8>> {
        self.load_version(name, version)?.read_to_vec()
    }

    /// A [`Read`] over the live version of `name`.
    pub fn open_readable(&self, name: impl Into<CompoundName>) -> Result<CompoundReadAdapter> {
        Ok(CompoundReadAdapter::new(self.load(name)?))
    }

    // ------------------------------------------------------------------
    // Namespace operations
    // ------------------------------------------------------------------

    /// Whether `name` exists, preferring a pending compound.
    pub fn has_compound(&self, name: &CompoundName) -> Result<bool> {
        if self.shared.pending.compound_by_name(name).is_some() {
            return Ok(true);
        }
        self.shared.meta.has_compound(name, None)
    }

    /// Fetch the live compound of `name`, preferring a pending compound.
    pub fn get_compound(&self, name: &CompoundName) -> Result<Option<Compound>> {
        if let Some(pending) = self.shared.pending.compound_by_name(name) {
            return Ok(Some(pending));
        }
        match self.shared.meta.get_compound(name, None) {
            Ok(compound) => Ok(Some(compound)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List compounds matching `filter`.
    pub fn list_compounds(&self, filter: &CompoundFilter) -> Result<Vec<Compound>> {
        self.shared.meta.list_compounds(filter)
    }

    /// Snapshot rows of `name`, oldest first.
    pub fn list_snapshots(&self, name: &CompoundName) -> Result<Vec<Compound>> {
        self.shared.meta.list_snapshots(name, None, None, false)
    }

    /// Copy `src` to `dst`, sharing all fragments.
    pub fn copy_compound(
        &self,
        src: impl Into<CompoundName>,
        dst: impl Into<CompoundName>,
        overwrite: bool,
    ) -> Result<Compound> {
        let src = src.into();
        let dst = dst.into();
        let blocking = self.config.blocking;
        let timeout = self.config.lock_timeout;

        let mut name_reserver =
            MassReserver::exclusive(Arc::clone(&self.shared.compound_locks), blocking, timeout);
        name_reserver.reserve_all(&[src.clone(), dst.clone()])?;

        let scope = stowage_meta::scope(&self.shared.meta);
        if !overwrite && self.shared.meta.has_compound(&dst, None)? {
            return Err(Error::compound_already_exists(&dst));
        }
        let src_compound = self.shared.meta.get_compound(&src, None)?;
        let src_id = src_compound
            .id
            .ok_or_else(|| Error::internal("metadata returned a compound without id"))?;
        let sequence = self.shared.meta.sequence_fragments_for_compound(src_id)?;

        let hashes: Vec<FragmentHash> = sequence.iter().map(|(_, f)| f.hash).collect();
        let mut fragment_reserver =
            MassReserver::exclusive(Arc::clone(&self.shared.fragment_locks), blocking, timeout);
        fragment_reserver.reserve_all(&hashes)?;

        let dst_compound = Compound::new(
            dst,
            src_compound.kind,
            src_compound.hash,
            src_compound.size,
            src_compound.wrap_tag.clone(),
            src_compound.compress_tag.clone(),
        );
        let rows: Vec<(Fragment, u32)> = sequence.into_iter().map(|(i, f)| (f, i)).collect();
        let created = self
            .shared
            .meta
            .add_overwrite_compound_and_map_fragments(&dst_compound, &rows)?;
        scope.commit()?;
        Ok(created)
    }

    /// Snapshot the live version of `name` under the next free version.
    pub fn snapshot_compound(&self, name: impl Into<CompoundName>) -> Result<Compound> {
        let name = name.into();
        let _guard = AccessGuard::exclusive(
            Arc::clone(&self.shared.compound_locks),
            name.clone(),
            self.config.blocking,
            self.config.lock_timeout,
        )?;
        let scope = stowage_meta::scope(&self.shared.meta);
        if !self.shared.meta.has_compound(&name, None)? {
            return Err(Error::compound_not_existing(&name));
        }
        let snapshot = self.shared.meta.make_snapshot(&name)?;
        scope.commit()?;
        Ok(snapshot)
    }

    /// Rename `old` (live version plus snapshots) to `new`.
    pub fn rename_compound(
        &self,
        old: impl Into<CompoundName>,
        new: impl Into<CompoundName>,
    ) -> Result<()> {
        let old = old.into();
        let new = new.into();
        let mut reserver = MassReserver::exclusive(
            Arc::clone(&self.shared.compound_locks),
            self.config.blocking,
            self.config.lock_timeout,
        );
        reserver.reserve_all(&[old.clone(), new.clone()])?;

        let scope = stowage_meta::scope(&self.shared.meta);
        if self.shared.pending.compound_by_name(&new).is_some() {
            return Err(Error::compound_already_exists(&new));
        }
        self.shared.meta.rename_compound(&old, &new)?;
        scope.commit()
    }

    /// Delete the live version of `name`, and its snapshots too when
    /// `with_snapshots`. Fragments and resources are left for garbage
    /// collection.
    pub fn delete_compound(
        &self,
        name: impl Into<CompoundName>,
        with_snapshots: bool,
    ) -> Result<()> {
        let name = name.into();
        let _guard = AccessGuard::exclusive(
            Arc::clone(&self.shared.compound_locks),
            name.clone(),
            self.config.blocking,
            self.config.lock_timeout,
        )?;
        let scope = stowage_meta::scope(&self.shared.meta);
        let was_pending = self.shared.pending.remove_compound_by_name(&name).is_some();
        match self.shared.meta.remove_compound_by_name(&name, !with_snapshots) {
            Ok(()) => {}
            Err(e) if e.is_not_found() && was_pending => {}
            Err(e) => return Err(e),
        }
        scope.commit()
    }

    /// Delete every compound whose name starts with `prefix`.
    pub fn delete_compounds_with_prefix(
        &self,
        prefix: &str,
        kind: Option<stowage_core::CompoundKind>,
    ) -> Result<usize> {
        let scope = stowage_meta::scope(&self.shared.meta);
        let mut filter = CompoundFilter::default().prefix(prefix);
        filter.kind = kind;
        let compounds = self.shared.meta.list_compounds(&filter)?;
        let mut deleted = 0;
        for compound in compounds {
            let _guard = AccessGuard::exclusive(
                Arc::clone(&self.shared.compound_locks),
                compound.name.clone(),
                self.config.blocking,
                self.config.lock_timeout,
            )?;
            let id = compound
                .id
                .ok_or_else(|| Error::internal("metadata returned a compound without id"))?;
            self.shared.meta.remove_compound(id)?;
            deleted += 1;
        }
        scope.commit()?;
        Ok(deleted)
    }

    /// Drop every compound (all versions). With `collect_garbage` the now
    /// unreferenced fragments and resources are reclaimed as well.
    pub fn wipe(&self, collect_garbage: bool) -> Result<()> {
        {
            let scope = stowage_meta::scope(&self.shared.meta);
            let names: Vec<CompoundName> = self
                .shared
                .meta
                .list_compound_names(true)?
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            let mut reserver = MassReserver::exclusive(
                Arc::clone(&self.shared.compound_locks),
                self.config.blocking,
                self.config.lock_timeout,
            );
            reserver.reserve_all(&names)?;
            self.shared.meta.truncate_compounds()?;
            scope.commit()?;
        }
        if collect_garbage {
            self.collect_garbage(&crate::config::GcOptions::everything())?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn wrap_tag_for(&self, options: &SaveOptions) -> WrapTag {
        options
            .wrap_tag
            .clone()
            .unwrap_or_else(|| self.config.compound_wrap_tag.clone())
    }

    pub(crate) fn compress_tag_for(&self, options: &SaveOptions) -> CompressTag {
        options
            .compress_tag
            .clone()
            .unwrap_or_else(|| self.config.compound_compress_tag.clone())
    }

    /// Undo partial write state after a failure: pending compounds and
    /// fragments are removed from the metadata store, the pending controller
    /// and the cache buffer.
    pub(crate) fn cleanup_pending(&self) {
        let compounds = self.shared.pending.pending_compounds();
        let fragments = self.shared.pending.pending_fragments();
        if compounds.is_empty() && fragments.is_empty() {
            return;
        }
        tracing::warn!(
            compounds = compounds.len(),
            fragments = fragments.len(),
            "removing pending objects after a failed write"
        );
        for compound in compounds {
            if let Some(id) = compound.id {
                if let Err(e) = self.shared.meta.remove_compound(id) {
                    tracing::warn!(compound = %compound.name, error = %e, "pending compound cleanup failed");
                }
            }
            self.shared.pending.remove_compound_by_name(&compound.name);
        }
        if let Err(e) = self.shared.meta.delete_fragments(&fragments) {
            tracing::warn!(error = %e, "pending fragment cleanup failed");
        }
        for fragment in &fragments {
            self.shared.pending.remove_fragment(&fragment.hash);
            self.shared.cache.remove_fragment(&fragment.hash);
        }
    }
}

/// RAII write session over an engine.
///
/// Closing the outermost session total-flushes the fragment cache and
/// commits every ready pending compound; a failed close purges pending
/// state. Dropping without [`EngineSession::close`] attempts the same flush
/// best-effort.
pub struct EngineSession<'a> {
    engine: &'a Engine,
    closed: bool,
}

impl EngineSession<'_> {
    /// Close the session, flushing buffered fragments.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self
            .engine
            .shared
            .cache
            .exit_scope(true)
            .and_then(|_| self.engine.shared.cache.flush_meta());
        if result.is_err() {
            self.engine.cleanup_pending();
        }
        result
    }

    /// Abandon the session after a failure; pending write state is purged
    /// instead of flushed (unless the engine was configured to upload on
    /// error).
    pub fn fail(mut self) {
        self.closed = true;
        if let Err(e) = self.engine.shared.cache.exit_scope(false) {
            tracing::warn!(error = %e, "flush on failed session errored");
        }
        self.engine.cleanup_pending();
    }
}

impl Drop for EngineSession<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match self
            .engine
            .shared
            .cache
            .exit_scope(true)
            .and_then(|_| self.engine.shared.cache.flush_meta())
        {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(error = %e, "flush on session drop failed");
                self.engine.cleanup_pending();
            }
        }
    }
}

fn hash_stream<S: Read>(stream: &mut S, chunk_size: usize) -> Result<CompoundHash> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    Ok(CompoundHash(hash))
}
