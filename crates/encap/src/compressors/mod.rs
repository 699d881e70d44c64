//! Compressor transforms.
//!
//! Same shape as the wrapper family: registered by tag, stacked by `-`-joined
//! tags, inverted in reverse order.

mod bz2;
mod lzma;
mod pass;
mod zlib;

pub use bz2::Bz2Compressor;
pub use lzma::LzmaCompressor;
pub use pass::PassThroughCompressor;
pub use zlib::ZlibCompressor;

use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{CompressTag, Error, Result};

/// An invertible byte compressor.
pub trait Compressor: Send + Sync {
    /// Tag this compressor is registered under. Must not contain `-`.
    fn tag(&self) -> CompressTag;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// An ordered stack of compressors resolved from a `-`-joined tag.
pub struct StackedCompressor {
    compressors: Vec<Arc<dyn Compressor>>,
}

impl StackedCompressor {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for compressor in &self.compressors {
            out = compressor.compress(&out)?;
        }
        Ok(out)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for compressor in self.compressors.iter().rev() {
            out = compressor.decompress(&out)?;
        }
        Ok(out)
    }
}

/// Registry mapping compressor tags to implementations.
pub struct CompressorRegistry {
    by_tag: HashMap<String, Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    pub fn new() -> Self {
        Self {
            by_tag: HashMap::new(),
        }
    }

    /// A registry with `pass`, `zlib`, `bz2` and `lzma` registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(PassThroughCompressor))
            .expect("default compressor tag");
        registry
            .register(Arc::new(ZlibCompressor))
            .expect("default compressor tag");
        registry
            .register(Arc::new(Bz2Compressor))
            .expect("default compressor tag");
        registry
            .register(Arc::new(LzmaCompressor))
            .expect("default compressor tag");
        registry
    }

    /// Register a compressor under its own tag, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Fails when the tag contains `-`, which is reserved for stacking.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) -> Result<()> {
        let tag = compressor.tag();
        if tag.as_str().contains('-') {
            return Err(Error::unsupported_tag(format!(
                "compressor tag must not contain '-': {tag}"
            )));
        }
        self.by_tag.insert(tag.as_str().to_string(), compressor);
        Ok(())
    }

    /// Whether every segment of `tag` is registered.
    pub fn supports(&self, tag: &CompressTag) -> bool {
        tag.segments()
            .all(|seg| self.by_tag.contains_key(&seg.to_lowercase()))
    }

    /// Resolve a (possibly stacked) tag into an applicable transform.
    pub fn resolve(&self, tag: &CompressTag) -> Result<StackedCompressor> {
        let mut compressors = Vec::new();
        for seg in tag.segments() {
            let seg = seg.to_lowercase();
            let compressor = self
                .by_tag
                .get(&seg)
                .ok_or_else(|| Error::unsupported_tag(seg.clone()))?;
            compressors.push(Arc::clone(compressor));
        }
        if compressors.is_empty() {
            return Err(Error::unsupported_tag(tag.as_str()));
        }
        Ok(StackedCompressor { compressors })
    }

    pub fn compress(&self, data: &[u8], tag: &CompressTag) -> Result<Vec<u8>> {
        self.resolve(tag)?.compress(data)
    }

    pub fn decompress(&self, data: &[u8], tag: &CompressTag) -> Result<Vec<u8>> {
        self.resolve(tag)?.decompress(data)
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
