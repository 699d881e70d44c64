//! Lazy compound reader.
//!
//! A [`CompoundReader`] is a finite, non-restartable sequence of plaintext
//! chunks, one per fragment in ascending sequence order. Each fragment's
//! parallel lock is released as soon as its bytes are produced; dropping the
//! iterator mid-stream releases the rest. The encapsulated bytes of every
//! fragment are verified against the fragment record, and the running stream
//! hash is checked against the compound record after the last fragment.

use crate::engine::Shared;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use stowage_concurrency::{AccessGuard, MassReserver};
use stowage_core::{
    Compound, CompoundName, Error, Fragment, FragmentHash, Result,
};
use stowage_encap::decapsulate;

enum ReaderState {
    Streaming,
    Finished,
    Failed,
}

/// Iterator over the plaintext chunks of one compound.
pub struct CompoundReader {
    shared: Arc<Shared>,
    compound: Compound,
    fragments: std::vec::IntoIter<Fragment>,
    _name_guard: AccessGuard<CompoundName>,
    reserver: MassReserver<FragmentHash>,
    hasher: Sha256,
    state: ReaderState,
}

impl CompoundReader {
    pub(crate) fn new(
        shared: Arc<Shared>,
        compound: Compound,
        fragments: Vec<Fragment>,
        name_guard: AccessGuard<CompoundName>,
        reserver: MassReserver<FragmentHash>,
    ) -> Self {
        Self {
            shared,
            compound,
            fragments: fragments.into_iter(),
            _name_guard: name_guard,
            reserver,
            hasher: Sha256::new(),
            state: ReaderState::Streaming,
        }
    }

    /// The compound record this reader streams.
    pub fn compound(&self) -> &Compound {
        &self.compound
    }

    /// Drain the whole stream into one buffer.
    pub fn read_to_vec(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in self {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn load_one(&mut self, fragment: &Fragment) -> Result<Vec<u8>> {
        let data = self.shared.cache.load_fragment(fragment)?;
        self.reserver.release_one(&fragment.hash);
        if data.len() as u64 != fragment.size {
            return Err(Error::fragment_manipulated(format!(
                "fragment {} has {} bytes, expected {}",
                fragment.hash,
                data.len(),
                fragment.size
            )));
        }
        if FragmentHash::of(&data) != fragment.hash {
            return Err(Error::fragment_manipulated(format!(
                "fragment {} does not match its recorded hash",
                fragment.hash
            )));
        }
        let plain = decapsulate(
            &self.shared.compressors,
            &self.shared.wrappers,
            &self.compound.compress_tag,
            &self.compound.wrap_tag,
            &data,
        )?;
        self.hasher.update(&plain);
        Ok(plain)
    }
}

impl Iterator for CompoundReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !matches!(self.state, ReaderState::Streaming) {
            return None;
        }
        match self.fragments.next() {
            Some(fragment) => match self.load_one(&fragment) {
                Ok(chunk) => Some(Ok(chunk)),
                Err(e) => {
                    self.state = ReaderState::Failed;
                    self.reserver.release_all();
                    Some(Err(e))
                }
            },
            None => {
                self.state = ReaderState::Finished;
                let digest = self.hasher.clone().finalize();
                if digest.as_slice() != self.compound.hash.as_bytes() {
                    Some(Err(Error::compound_manipulated(&self.compound.name)))
                } else {
                    None
                }
            }
        }
    }
}

/// [`Read`] adapter over a [`CompoundReader`].
pub struct CompoundReadAdapter {
    reader: CompoundReader,
    pending: Vec<u8>,
    pos: usize,
}

impl CompoundReadAdapter {
    pub(crate) fn new(reader: CompoundReader) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            pos: 0,
        }
    }

    pub fn compound(&self) -> &Compound {
        self.reader.compound()
    }
}

impl Read for CompoundReadAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.reader.next() {
                None => return Ok(0),
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Some(Err(e)) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                }
            }
        }
    }
}
