//! Stream-oriented compound writer.
//!
//! Lifecycle: open → write* → close. Opening takes the exclusive name lock
//! and, when overwriting, parallel locks on every fragment hash the existing
//! compound references (so garbage collection cannot remove them while the
//! writer may still reuse them). Writing chunks the stream into
//! fragment-sized payloads, encapsulates each with the compound-side tags,
//! reserves its hash and feeds the fragment cache. Closing flushes the
//! residual tail, registers the compound with the pending controller and
//! leaves persistence to the cache. Dropping an unclosed writer releases all
//! reservations; the engine's cleanup discards whatever was buffered.

use crate::engine::Shared;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stowage_concurrency::{AccessGuard, MassReserver};
use stowage_core::{
    Compound, CompoundHash, CompoundKind, CompoundName, CompressTag, Error, Fragment, FragmentHash,
    Result, SequenceIndex, WrapTag,
};
use stowage_encap::encapsulate;

/// A compound being written. Created by the engine facade.
pub struct WritableCompound {
    shared: Arc<Shared>,
    name: CompoundName,
    kind: CompoundKind,
    wrap_tag: WrapTag,
    compress_tag: CompressTag,
    fragment_size: usize,
    _name_guard: AccessGuard<CompoundName>,
    fragment_reserver: MassReserver<FragmentHash>,
    hasher: Sha256,
    stream_size: u64,
    buffer: Vec<u8>,
    sequence: Vec<(Fragment, SequenceIndex)>,
    pending_fragments: Vec<Fragment>,
    next_index: SequenceIndex,
    closed: bool,
}

impl std::fmt::Debug for WritableCompound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableCompound")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("wrap_tag", &self.wrap_tag)
            .field("compress_tag", &self.compress_tag)
            .field("fragment_size", &self.fragment_size)
            .field("stream_size", &self.stream_size)
            .field("next_index", &self.next_index)
            .field("closed", &self.closed)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn open(
    shared: Arc<Shared>,
    name: CompoundName,
    kind: CompoundKind,
    wrap_tag: WrapTag,
    compress_tag: CompressTag,
    fragment_size: u64,
    overwrite: bool,
    append: bool,
    blocking: bool,
    timeout: Option<Duration>,
) -> Result<WritableCompound> {
    if append {
        // The stream hash cannot be resumed from encapsulated state.
        return Err(Error::unsupported(
            "appending to an existing compound is not possible",
        ));
    }
    if fragment_size == 0 {
        return Err(Error::unsupported("fragment size must be positive"));
    }
    if !shared.wrappers.supports(&wrap_tag) {
        return Err(Error::unsupported_tag(wrap_tag.as_str()));
    }
    if !shared.compressors.supports(&compress_tag) {
        return Err(Error::unsupported_tag(compress_tag.as_str()));
    }

    let name_guard = AccessGuard::exclusive(
        Arc::clone(&shared.compound_locks),
        name.clone(),
        blocking,
        timeout,
    )?;
    let mut fragment_reserver =
        MassReserver::parallel(Arc::clone(&shared.fragment_locks), blocking, timeout);

    let scope = stowage_meta::scope(&shared.meta);
    // Queries prefer the pending compound: a not-yet-durable overwrite of the
    // same name must be visible to this writer.
    let existing_hashes: Option<Vec<FragmentHash>> =
        if let Some(sequence) = shared.pending.sequence_for_name(&name) {
            Some(sequence.iter().map(|(f, _)| f.hash).collect())
        } else if shared.meta.has_compound(&name, None)? {
            let compound = shared.meta.get_compound(&name, None)?;
            let id = compound
                .id
                .ok_or_else(|| Error::internal("metadata returned a compound without id"))?;
            Some(shared.meta.fragment_hashes_for_compound(id)?)
        } else {
            None
        };
    if let Some(hashes) = existing_hashes {
        if !overwrite {
            return Err(Error::compound_already_exists(&name));
        }
        fragment_reserver.reserve_all(&hashes)?;
    }
    scope.commit()?;

    Ok(WritableCompound {
        shared,
        name,
        kind,
        wrap_tag,
        compress_tag,
        fragment_size: fragment_size as usize,
        _name_guard: name_guard,
        fragment_reserver,
        hasher: Sha256::new(),
        stream_size: 0,
        buffer: Vec::new(),
        sequence: Vec::new(),
        pending_fragments: Vec::new(),
        next_index: 0,
        closed: false,
    })
}

impl WritableCompound {
    pub fn name(&self) -> &CompoundName {
        &self.name
    }

    /// Plaintext bytes written so far.
    pub fn stream_size(&self) -> u64 {
        self.stream_size
    }

    /// Fragment hashes this writer has reserved so far (the skip-set: the
    /// overwritten compound's hashes plus everything already produced).
    pub fn reserved_hashes(&self) -> HashSet<FragmentHash> {
        self.fragment_reserver.reserved().iter().copied().collect()
    }

    /// Append stream bytes. Complete fragments are cut off and handed to the
    /// fragment cache as they fill up.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::unsupported("write on a closed compound"));
        }
        if !chunk.is_empty() {
            self.hasher.update(chunk);
            self.stream_size += chunk.len() as u64;
            self.buffer.extend_from_slice(chunk);
        }
        while self.buffer.len() >= self.fragment_size {
            self.cut_fragment(self.fragment_size)?;
        }
        Ok(())
    }

    fn cut_fragment(&mut self, cut_len: usize) -> Result<()> {
        let rest = self.buffer.split_off(cut_len);
        let payload = std::mem::replace(&mut self.buffer, rest);
        let payload_size = payload.len() as u64;

        let data = encapsulate(
            &self.shared.compressors,
            &self.shared.wrappers,
            &self.compress_tag,
            &self.wrap_tag,
            &payload,
        )?;
        let hash = FragmentHash::of(&data);
        self.fragment_reserver.reserve_one(hash)?;
        let fragment = self
            .shared
            .cache
            .add_fragment_data(data, hash, payload_size)?;
        self.pending_fragments.push(fragment.clone());
        self.sequence.push((fragment, self.next_index));
        self.next_index += 1;
        Ok(())
    }

    /// Finish the stream: flush the residual tail fragment (the only one that
    /// may be smaller than the fragment size), register the compound with the
    /// pending controller and let the fragment cache persist it once its
    /// fragments are durable. Returns the (not yet durable) compound record.
    pub fn close(mut self) -> Result<Compound> {
        while !self.buffer.is_empty() {
            let cut = self.buffer.len().min(self.fragment_size);
            self.cut_fragment(cut)?;
        }
        let digest = self.hasher.clone().finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);

        let compound = Compound::new(
            self.name.clone(),
            self.kind,
            CompoundHash(hash),
            self.stream_size,
            self.wrap_tag.clone(),
            self.compress_tag.clone(),
        );
        self.shared.pending.add_compound(
            compound.clone(),
            &self.pending_fragments,
            std::mem::take(&mut self.sequence),
        );
        self.closed = true;
        self.shared.cache.flush(false)?;
        Ok(compound)
        // reservations and the name lock release as `self` drops here
    }
}
