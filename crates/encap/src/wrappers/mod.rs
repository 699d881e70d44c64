//! Wrapper transforms: invertible byte-to-byte envelopes.
//!
//! A wrapper turns a payload into an envelope that a storage backend will
//! accept (or that adds integrity/privacy), and inverts it exactly on unwrap.
//! Wrappers are registered by tag in a [`WrapperRegistry`]; `-`-joined tags
//! resolve to ordered stacks.

mod aes;
mod min_size;
mod pass;
mod png;
mod size_checksum;
mod svg;

pub use aes::{Aes256CtrWrapper, NonceMode};
pub use min_size::MinimumSizeWrapper;
pub use pass::PassThroughWrapper;
pub use png::{Png3dWrapper, PngWrapper};
pub use size_checksum::SizeChecksumWrapper;
pub use svg::SvgWrapper;

use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{Error, Result, WrapTag};

/// An invertible byte envelope.
///
/// Implementations must be `Send + Sync`; one instance serves concurrent
/// wrap/unwrap calls from multiple threads.
pub trait Wrapper: Send + Sync {
    /// Tag this wrapper is registered under. Must not contain `-`.
    fn tag(&self) -> WrapTag;

    /// Produce the envelope for `data`.
    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Invert [`Wrapper::wrap`]. Fails with [`Error::UnwrapFailed`] when the
    /// envelope is malformed, truncated, or fails verification.
    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// An ordered stack of wrappers resolved from a `-`-joined tag.
///
/// `wrap` applies the stack left to right, `unwrap` in reverse order.
pub struct StackedWrapper {
    wrappers: Vec<Arc<dyn Wrapper>>,
}

impl std::fmt::Debug for StackedWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackedWrapper")
            .field("len", &self.wrappers.len())
            .finish()
    }
}

impl StackedWrapper {
    pub fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for wrapper in &self.wrappers {
            out = wrapper.wrap(&out)?;
        }
        Ok(out)
    }

    pub fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for wrapper in self.wrappers.iter().rev() {
            out = wrapper.unwrap(&out)?;
        }
        Ok(out)
    }
}

/// Registry mapping wrapper tags to implementations.
///
/// The default set covers every wrapper that needs no configuration: `pass`,
/// `sc`, `svg`, `png`, `png3d` and the pre-sized `ms<N>` paddings the engine
/// hands out (0, 512, 1000, 10000, 100000, 1000000, 10000000). Keyed wrappers
/// such as [`Aes256CtrWrapper`] are registered explicitly by the caller that
/// owns the key.
pub struct WrapperRegistry {
    by_tag: HashMap<String, Arc<dyn Wrapper>>,
}

impl WrapperRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            by_tag: HashMap::new(),
        }
    }

    /// A registry with all key-less wrappers registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(PassThroughWrapper))
            .expect("default wrapper tag");
        registry
            .register(Arc::new(SizeChecksumWrapper))
            .expect("default wrapper tag");
        registry
            .register(Arc::new(SvgWrapper))
            .expect("default wrapper tag");
        registry
            .register(Arc::new(PngWrapper))
            .expect("default wrapper tag");
        registry
            .register(Arc::new(Png3dWrapper))
            .expect("default wrapper tag");
        for min_size in [0u64, 512, 1000, 10_000, 100_000, 1_000_000, 10_000_000] {
            registry
                .register(Arc::new(MinimumSizeWrapper::new(min_size)))
                .expect("default wrapper tag");
        }
        registry
    }

    /// Register a wrapper under its own tag, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Fails when the tag contains `-`, which is reserved for stacking.
    pub fn register(&mut self, wrapper: Arc<dyn Wrapper>) -> Result<()> {
        let tag = wrapper.tag();
        if tag.as_str().contains('-') {
            return Err(Error::unsupported_tag(format!(
                "wrapper tag must not contain '-': {tag}"
            )));
        }
        self.by_tag.insert(tag.as_str().to_string(), wrapper);
        Ok(())
    }

    /// Whether every segment of `tag` is registered.
    pub fn supports(&self, tag: &WrapTag) -> bool {
        tag.segments()
            .all(|seg| self.by_tag.contains_key(&seg.to_lowercase()))
    }

    /// Resolve a (possibly stacked) tag into an applicable transform.
    pub fn resolve(&self, tag: &WrapTag) -> Result<StackedWrapper> {
        let mut wrappers = Vec::new();
        for seg in tag.segments() {
            let seg = seg.to_lowercase();
            let wrapper = self
                .by_tag
                .get(&seg)
                .ok_or_else(|| Error::unsupported_tag(seg.clone()))?;
            wrappers.push(Arc::clone(wrapper));
        }
        if wrappers.is_empty() {
            return Err(Error::unsupported_tag(tag.as_str()));
        }
        Ok(StackedWrapper { wrappers })
    }

    pub fn wrap(&self, data: &[u8], tag: &WrapTag) -> Result<Vec<u8>> {
        self.resolve(tag)?.wrap(data)
    }

    pub fn unwrap(&self, data: &[u8], tag: &WrapTag) -> Result<Vec<u8>> {
        self.resolve(tag)?.unwrap(data)
    }
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
