//! Invertible byte-transform stacks for fragment and resource payloads.
//!
//! Two parallel transform families exist: *wrappers* (envelopes: identity,
//! size-checksum, padding, encryption, image containers) and *compressors*
//! (identity, zlib, bz2, lzma). Both are named by tags; a `-`-joined tag such
//! as `sc-png` names an ordered stack that is applied left to right on the
//! forward direction and inverted in reverse order.
//!
//! Encapsulation is the composition `wrap(compress(bytes))`; it is applied
//! once on the compound side (per fragment) and once on the resource side
//! (per packed resource payload).
//!
//! Unknown tags are a fatal configuration error ([`Error::UnsupportedTag`]).

#![warn(clippy::all)]

pub mod compressors;
pub mod wrappers;

pub use compressors::{Compressor, CompressorRegistry};
pub use wrappers::{Aes256CtrWrapper, NonceMode, Wrapper, WrapperRegistry};

use stowage_core::{CompressTag, Result, WrapTag};

/// Compress `data` with `compress_tag`, then wrap the result with `wrap_tag`.
pub fn encapsulate(
    compressors: &CompressorRegistry,
    wrappers: &WrapperRegistry,
    compress_tag: &CompressTag,
    wrap_tag: &WrapTag,
    data: &[u8],
) -> Result<Vec<u8>> {
    let compressed = compressors.compress(data, compress_tag)?;
    wrappers.wrap(&compressed, wrap_tag)
}

/// Invert [`encapsulate`]: unwrap with `wrap_tag`, then decompress with
/// `compress_tag`.
pub fn decapsulate(
    compressors: &CompressorRegistry,
    wrappers: &WrapperRegistry,
    compress_tag: &CompressTag,
    wrap_tag: &WrapTag,
    data: &[u8],
) -> Result<Vec<u8>> {
    let unwrapped = wrappers.unwrap(data, wrap_tag)?;
    compressors.decompress(&unwrapped, compress_tag)
}
