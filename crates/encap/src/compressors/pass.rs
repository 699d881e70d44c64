//! Identity compressor.

use super::Compressor;
use stowage_core::{CompressTag, Result};

/// Passes bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCompressor;

impl Compressor for PassThroughCompressor {
    fn tag(&self) -> CompressTag {
        CompressTag::new("pass")
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
