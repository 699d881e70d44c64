//! Fragment cache: buffers fragments and packs them into uploaded resources.
//!
//! Fragments enter the buffer as writers produce them (or as maintenance
//! re-adds them); the cache decides when a resource is worth uploading based
//! on the active [`PackingPolicy`], encapsulates the packed payload with the
//! resource-side tags, hands the bytes to the storage backend and records the
//! resource plus fragment offsets in the metadata store. Reads come back
//! through the same object so buffered fragments are served before any
//! download happens.
//!
//! One mutex guards the buffer and policy state. It is held across uploads;
//! callers never hold it (all entry points lock internally).

use crate::packer::{PackingStrategy, ResourcePacker};
use crate::pending::PendingObjectsController;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stowage_core::{
    CompressTag, Error, Fragment, FragmentHash, Resource, ResourceHash, Result, WrapTag,
};
use stowage_encap::{decapsulate, encapsulate, CompressorRegistry, WrapperRegistry};
use stowage_meta::Meta;
use stowage_storage::Storage;

/// When the cache uploads resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingPolicy {
    /// Upload only packets that reach the minimum fill level; on total flush,
    /// upload whatever remains as one under-filled resource. Least traffic.
    Pass,
    /// Like [`PackingPolicy::Pass`], then additionally rewrite the smallest
    /// existing resource by downloading it and re-emitting it with buffered
    /// fragments appended.
    Fill,
    /// Always try to append buffered fragments to the smallest existing
    /// resource first; fall back to fill-level packing only when nothing is
    /// appendable. Most traffic, fewest resources.
    FillAlways,
}

/// Static cache configuration, fixed at engine construction.
pub(crate) struct CacheConfig {
    pub expected_fragment_size: u64,
    pub resource_size: u64,
    pub resource_wrap_tag: WrapTag,
    pub resource_compress_tag: CompressTag,
    pub min_fill: f64,
    pub auto_delete_resource: bool,
    pub cache_last_downloaded_resource: bool,
    pub upload_on_error: bool,
    pub strategy: PackingStrategy,
    pub initial_policy: PackingPolicy,
}

/// Insertion-ordered fragment buffer keyed by hash.
#[derive(Default)]
struct Buffer {
    order: Vec<FragmentHash>,
    entries: HashMap<FragmentHash, (Fragment, Vec<u8>)>,
    total_size: u64,
}

impl Buffer {
    fn contains(&self, hash: &FragmentHash) -> bool {
        self.entries.contains_key(hash)
    }

    fn insert(&mut self, fragment: Fragment, data: Vec<u8>) {
        debug_assert!(!self.contains(&fragment.hash));
        self.total_size += fragment.size;
        self.order.push(fragment.hash);
        self.entries.insert(fragment.hash, (fragment, data));
    }

    fn remove(&mut self, hash: &FragmentHash) -> Option<(Fragment, Vec<u8>)> {
        let entry = self.entries.remove(hash)?;
        self.order.retain(|h| h != hash);
        self.total_size -= entry.0.size;
        Some(entry)
    }

    fn get(&self, hash: &FragmentHash) -> Option<&(Fragment, Vec<u8>)> {
        self.entries.get(hash)
    }

    fn fragments_in_order(&self) -> Vec<Fragment> {
        self.order
            .iter()
            .filter_map(|h| self.entries.get(h).map(|(f, _)| f.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct CacheState {
    buffer: Buffer,
    scope_depth: usize,
    policy: PackingPolicy,
    reuse_blacklist: HashSet<ResourceHash>,
    /// Per-fragment slices of the most recently downloaded resource.
    last_resource_fragments: HashMap<FragmentHash, Vec<u8>>,
}

/// Fragment cache and resource packer (one per engine).
pub struct FragmentCache {
    meta: Arc<dyn Meta>,
    storage: Arc<dyn Storage>,
    pending: Arc<PendingObjectsController>,
    wrappers: Arc<WrapperRegistry>,
    compressors: Arc<CompressorRegistry>,
    packer: ResourcePacker,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl FragmentCache {
    pub(crate) fn new(
        meta: Arc<dyn Meta>,
        storage: Arc<dyn Storage>,
        pending: Arc<PendingObjectsController>,
        wrappers: Arc<WrapperRegistry>,
        compressors: Arc<CompressorRegistry>,
        config: CacheConfig,
    ) -> Result<Self> {
        if config.expected_fragment_size > config.resource_size {
            return Err(Error::unsupported(
                "fragment size must not exceed the resource size",
            ));
        }
        if !(config.min_fill > 0.0 && config.min_fill <= 1.0) {
            return Err(Error::unsupported(
                "minimum fill level must be within (0, 1]",
            ));
        }
        Ok(Self {
            meta,
            storage,
            pending,
            wrappers,
            compressors,
            packer: ResourcePacker::new(config.strategy),
            state: Mutex::new(CacheState {
                buffer: Buffer::default(),
                scope_depth: 0,
                policy: config.initial_policy,
                reuse_blacklist: HashSet::new(),
                last_resource_fragments: HashMap::new(),
            }),
            config,
        })
    }

    // ------------------------------------------------------------------
    // Scope counting
    // ------------------------------------------------------------------

    pub(crate) fn enter_scope(&self) {
        self.state.lock().scope_depth += 1;
    }

    /// Leave a scope. Leaving the outermost scope of a successful run
    /// performs a total flush; after a failed run the buffer is only flushed
    /// when `upload_on_error` was configured, otherwise the engine's cleanup
    /// discards the pending state.
    pub(crate) fn exit_scope(&self, success: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.scope_depth = state.scope_depth.saturating_sub(1);
        if state.scope_depth == 0 {
            if success {
                self.flush_inner(&mut state, true)?;
            } else if self.config.upload_on_error {
                if let Err(e) = self.flush_inner(&mut state, true) {
                    tracing::warn!(error = %e, "flush after failed scope also failed");
                }
            }
        }
        Ok(())
    }

    pub fn scope_depth(&self) -> usize {
        self.state.lock().scope_depth
    }

    /// Maximum resource payload size the cache packs towards.
    pub fn resource_size(&self) -> u64 {
        self.config.resource_size
    }

    // ------------------------------------------------------------------
    // Policy and blacklist
    // ------------------------------------------------------------------

    pub fn policy(&self) -> PackingPolicy {
        self.state.lock().policy
    }

    pub fn set_policy(&self, policy: PackingPolicy) {
        self.state.lock().policy = policy;
    }

    /// Replace the set of resources the appending policies must not reuse,
    /// returning the previous set.
    pub(crate) fn swap_reuse_blacklist(
        &self,
        blacklist: HashSet<ResourceHash>,
    ) -> HashSet<ResourceHash> {
        std::mem::replace(&mut self.state.lock().reuse_blacklist, blacklist)
    }

    // ------------------------------------------------------------------
    // Adding and removing fragments
    // ------------------------------------------------------------------

    /// Buffer encapsulated fragment bytes, deduplicating by hash. Returns the
    /// fragment record (the buffered one when the hash is already present).
    pub fn add_fragment_data(
        &self,
        data: Vec<u8>,
        hash: FragmentHash,
        payload_size: u64,
    ) -> Result<Fragment> {
        {
            let state = self.state.lock();
            if let Some((fragment, _)) = state.buffer.get(&hash) {
                return Ok(fragment.clone());
            }
        }
        let fragment = Fragment::new(hash, data.len() as u64, payload_size);
        self.add_fragment(data, fragment.clone(), false)?;
        Ok(fragment)
    }

    /// Buffer a fragment. With `readd` the fragment is buffered even when the
    /// metadata store already knows it, which is how maintenance moves
    /// fragments between resources.
    pub fn add_fragment(&self, data: Vec<u8>, fragment: Fragment, readd: bool) -> Result<()> {
        let mut state = self.state.lock();
        if fragment.size != data.len() as u64 {
            return Err(Error::internal(
                "fragment record size differs from its data length",
            ));
        }
        if fragment.size > self.config.resource_size {
            return Err(Error::unsupported(format!(
                "fragment of {} bytes cannot fit into a resource of at most {} bytes",
                fragment.size, self.config.resource_size
            )));
        }
        if state.buffer.contains(&fragment.hash) {
            return Ok(());
        }
        if !readd && self.meta.has_fragment(&fragment.hash)? {
            return Ok(());
        }
        if state.buffer.total_size >= self.config.resource_size {
            self.flush_inner(&mut state, false)?;
        }
        state.buffer.insert(fragment.clone(), data);
        self.pending.add_fragment(&fragment);
        Ok(())
    }

    /// Drop a buffered fragment without uploading it.
    pub fn remove_fragment(&self, hash: &FragmentHash) {
        let mut state = self.state.lock();
        state.buffer.remove(hash);
    }

    pub fn buffered_count(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.state.lock().buffer.total_size
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Encapsulated bytes of one fragment: served from the buffer when
    /// possible, otherwise sliced out of its (verified) resource.
    pub fn load_fragment(&self, fragment: &Fragment) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if let Some((_, data)) = state.buffer.get(&fragment.hash) {
            return Ok(data.clone());
        }
        if self.config.cache_last_downloaded_resource {
            if let Some(data) = state.last_resource_fragments.get(&fragment.hash) {
                return Ok(data.clone());
            }
            let (resource, _) = self.mapping_for(fragment)?;
            let payload = self.load_resource(&resource)?;
            state.last_resource_fragments.clear();
            for (f, offset) in self.meta.fragments_with_offset_on_resource(resource.id)? {
                let slice = slice_payload(&payload, offset, f.size)?;
                state.last_resource_fragments.insert(f.hash, slice.to_vec());
            }
            state
                .last_resource_fragments
                .get(&fragment.hash)
                .cloned()
                .ok_or_else(|| {
                    Error::fragment_missing(format!(
                        "fragment {} not present on its mapped resource {}",
                        fragment.hash, resource.name
                    ))
                })
        } else {
            let (resource, offset) = self.mapping_for(fragment)?;
            let payload = self.load_resource(&resource)?;
            Ok(slice_payload(&payload, offset, fragment.size)?.to_vec())
        }
    }

    fn mapping_for(&self, fragment: &Fragment) -> Result<(Resource, u64)> {
        let id = match fragment.id {
            Some(id) => id,
            None => {
                let row = self.meta.get_fragment(&fragment.hash).map_err(|e| {
                    if e.is_not_found() {
                        Error::fragment_missing(format!("no fragment row for {}", fragment.hash))
                    } else {
                        e
                    }
                })?;
                row.id
                    .ok_or_else(|| Error::internal("metadata returned a fragment without id"))?
            }
        };
        self.meta
            .resource_and_offset_for_fragment(id)
            .map_err(|e| {
                if e.is_not_found() {
                    Error::fragment_missing(format!(
                        "no resource offset found for fragment {}",
                        fragment.hash
                    ))
                } else {
                    e
                }
            })
    }

    /// Download a resource, verify stored length and hash, decapsulate with
    /// the resource's own tags and verify the payload length.
    pub fn load_resource(&self, resource: &Resource) -> Result<Vec<u8>> {
        tracing::debug!(resource = %resource.name, size = resource.size, "downloading resource");
        let data = self.storage.load(&resource.name)?;
        if data.len() as u64 != resource.size {
            return Err(Error::resource_manipulated(format!(
                "resource {} has size {}, expected {}",
                resource.name,
                data.len(),
                resource.size
            )));
        }
        if ResourceHash::of(&data) != resource.hash {
            return Err(Error::resource_manipulated(format!(
                "resource {} hash is not the expected one",
                resource.name
            )));
        }
        let payload = decapsulate(
            &self.compressors,
            &self.wrappers,
            &resource.compress_tag,
            &resource.wrap_tag,
            &data,
        )
        .map_err(|e| match e {
            fatal @ Error::UnsupportedTag { .. } => fatal,
            other => Error::resource_manipulated(format!(
                "resource {} failed to decapsulate: {other}",
                resource.name
            )),
        })?;
        if payload.len() as u64 != resource.payload_size {
            return Err(Error::resource_manipulated(format!(
                "decapsulated resource {} has {} bytes, expected {}",
                resource.name,
                payload.len(),
                resource.payload_size
            )));
        }
        Ok(payload)
    }

    /// All fragments of a resource with their encapsulated bytes.
    pub fn load_fragments_of_resource(
        &self,
        resource: &Resource,
    ) -> Result<Vec<(Fragment, Vec<u8>)>> {
        let payload = self.load_resource(resource)?;
        let mut out = Vec::new();
        for (fragment, offset) in self.meta.fragments_with_offset_on_resource(resource.id)? {
            let slice = slice_payload(&payload, offset, fragment.size)?;
            out.push((fragment, slice.to_vec()));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Flush the buffer according to policy. While writer scopes are open
    /// only a forced flush uploads; otherwise the buffer flushes once it
    /// holds at least one resource's worth of bytes. Ready pending compounds
    /// are committed to metadata in any case.
    pub fn flush(&self, force: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.scope_depth > 0 && !force {
                // writers still open; metadata flush below
            } else if force {
                self.flush_inner(&mut state, true)?;
            } else if state.buffer.total_size >= self.config.resource_size {
                self.flush_inner(&mut state, false)?;
            }
        }
        self.flush_meta()
    }

    /// Commit the sequence mappings of every pending compound whose
    /// fragments are all durable.
    pub fn flush_meta(&self) -> Result<()> {
        let ready = self.pending.pop_ready_sequences();
        if ready.is_empty() {
            return Ok(());
        }
        tracing::debug!(compounds = ready.len(), "persisting ready compounds");
        for (compound, sequence) in ready {
            self.meta
                .add_overwrite_compound_and_map_fragments(&compound, &sequence)?;
        }
        Ok(())
    }

    fn flush_inner(&self, state: &mut CacheState, totalflush: bool) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        match state.policy {
            PackingPolicy::Pass => self.flush_percentage_filled(state, false)?,
            PackingPolicy::Fill => {
                self.flush_percentage_filled(state, false)?;
                self.flush_resource_appending(state, false)?;
            }
            PackingPolicy::FillAlways => self.flush_resource_appending(state, false)?,
        }
        if totalflush {
            match state.policy {
                PackingPolicy::Pass => self.flush_percentage_filled(state, true)?,
                PackingPolicy::Fill => {
                    self.flush_percentage_filled(state, false)?;
                    self.flush_resource_appending(state, true)?;
                }
                PackingPolicy::FillAlways => self.flush_resource_appending(state, true)?,
            }
            debug_assert!(state.buffer.is_empty());
        }
        self.flush_meta()
    }

    /// Pack buffered fragments into fill-level resources. With `empty` the
    /// buffer is drained completely regardless of fill.
    fn flush_percentage_filled(&self, state: &mut CacheState, empty: bool) -> Result<()> {
        let fragments = state.buffer.fragments_in_order();
        if fragments.is_empty() {
            return Ok(());
        }
        let mut packets = self.packer.pack(self.config.resource_size, &fragments);
        if !empty {
            if !self.packer.any_packet_reaches_fill(
                &packets,
                self.config.resource_size,
                self.config.min_fill,
            ) {
                tracing::warn!(
                    buffered = fragments.len(),
                    "no fragment packet reaches the minimum resource fill level; keeping buffer"
                );
                return Ok(());
            }
            packets.truncate(1);
        }
        for packet in packets {
            let mut hashes: Vec<FragmentHash> =
                packet.fragments().iter().map(|f| f.hash).collect();
            hashes.sort();
            self.upload_and_map(state, &hashes, None)?;
        }
        Ok(())
    }

    /// Append buffered fragments to the smallest existing resources until
    /// nothing is appendable, then fall back to fill-level packing.
    fn flush_resource_appending(&self, state: &mut CacheState, empty: bool) -> Result<()> {
        loop {
            let smallest = self
                .meta
                .smallest_resource(&state.reuse_blacklist)?;
            let donor = match smallest {
                Some(resource) => {
                    let append_max = self
                        .config
                        .resource_size
                        .saturating_sub(resource.payload_size);
                    let appendable = append_max > 0
                        && state
                            .buffer
                            .fragments_in_order()
                            .iter()
                            .any(|f| f.size <= append_max);
                    if appendable {
                        Some((resource, append_max))
                    } else {
                        None
                    }
                }
                None => None,
            };
            let Some((donor, append_max)) = donor else {
                return self.flush_percentage_filled(state, empty);
            };

            let appendable: Vec<Fragment> = state
                .buffer
                .fragments_in_order()
                .into_iter()
                .filter(|f| f.size <= append_max)
                .collect();
            let bin_packer = ResourcePacker::new(PackingStrategy::BinPacking);
            let packets = bin_packer.pack(append_max, &appendable);
            let Some(packet) = packets.first().filter(|p| !p.is_empty()) else {
                return self.flush_percentage_filled(state, empty);
            };

            let mut upload_hashes: Vec<FragmentHash> =
                packet.fragments().iter().map(|f| f.hash).collect();
            // Pull the donor's fragments into the buffer so the rewritten
            // resource contains them too.
            for (fragment, data) in self.load_fragments_of_resource(&donor)? {
                if !state.buffer.contains(&fragment.hash) {
                    upload_hashes.push(fragment.hash);
                    state.buffer.insert(fragment, data);
                }
            }
            self.upload_and_map(state, &upload_hashes, Some(&donor))?;
        }
    }

    /// Upload one packet of buffered fragments as a resource and record the
    /// fragment offsets. On failure the metadata stays untouched and the
    /// packet remains in the buffer.
    fn upload_and_map(
        &self,
        state: &mut CacheState,
        hashes: &[FragmentHash],
        update: Option<&Resource>,
    ) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::new();
        let mut fragments = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let (fragment, data) = state.buffer.get(hash).ok_or_else(|| {
                Error::internal(format!("fragment {hash} vanished from the cache buffer"))
            })?;
            payload.extend_from_slice(data);
            fragments.push(fragment.clone());
        }

        let resource = self.upload_bytes(&payload, fragments.len(), update)?;

        let mut rows = Vec::with_capacity(fragments.len());
        let mut offset = 0u64;
        for fragment in &fragments {
            rows.push((fragment.clone(), offset));
            offset += fragment.size;
        }
        self.meta
            .make_and_map_fragments_to_resource(resource.id, &rows)?;

        for fragment in &fragments {
            self.pending.remove_fragment(&fragment.hash);
            state.buffer.remove(&fragment.hash);
        }
        tracing::debug!(
            resource = %resource.name,
            fragments = fragments.len(),
            remaining = state.buffer.len(),
            "uploaded resource"
        );
        self.flush_meta()
    }

    /// Encapsulate and upload one payload, reusing an existing resource row
    /// when the encapsulated bytes hash identically. When `update` names a
    /// rewritten resource its mappings are moved to the new resource first;
    /// the old blob is deleted only under `auto_delete_resource`.
    pub(crate) fn upload_bytes(
        &self,
        payload: &[u8],
        fragment_count: usize,
        update: Option<&Resource>,
    ) -> Result<Resource> {
        let payload_size = payload.len() as u64;
        let data = encapsulate(
            &self.compressors,
            &self.wrappers,
            &self.config.resource_compress_tag,
            &self.config.resource_wrap_tag,
            payload,
        )?;
        let hash = ResourceHash::of(&data);
        let size = data.len() as u64;

        let resource = match self.meta.get_resource_by_hash(&hash) {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                let name = self.storage.save(&data, &hash, size)?;
                tracing::debug!(resource = %name, size, fragment_count, "created resource");
                self.meta.make_resource(
                    &name,
                    size,
                    payload_size,
                    &hash,
                    &self.config.resource_wrap_tag,
                    &self.config.resource_compress_tag,
                )?
            }
            Err(e) => return Err(e),
        };
        if let Some(old) = update {
            if old.id != resource.id {
                self.meta.move_fragment_mappings(old.id, resource.id)?;
                if self.config.auto_delete_resource {
                    self.storage.delete(&old.name)?;
                }
            }
        }
        Ok(resource)
    }

    /// Upload an already-concatenated payload as a fresh resource (space
    /// optimization rebuilds payloads outside the buffer).
    pub(crate) fn upload_payload(
        &self,
        payload: &[u8],
        fragment_count: usize,
    ) -> Result<Resource> {
        let _state = self.state.lock();
        self.upload_bytes(payload, fragment_count, None)
    }
}

fn slice_payload(payload: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| {
            Error::resource_manipulated(format!(
                "fragment slice {offset}+{size} exceeds resource payload of {} bytes",
                payload.len()
            ))
        })?;
    Ok(&payload[start..end])
}
