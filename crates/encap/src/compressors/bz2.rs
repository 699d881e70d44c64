//! bzip2 compressor.

use super::Compressor;
use bzip2::write::{BzDecoder, BzEncoder};
use bzip2::Compression;
use std::io::Write;
use stowage_core::{CompressTag, Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct Bz2Compressor;

impl Compressor for Bz2Compressor {
    fn tag(&self) -> CompressTag {
        CompressTag::new("bz2")
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::compression(format!("bz2 compress: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = BzDecoder::new(Vec::new());
        decoder
            .write_all(data)
            .and_then(|_| decoder.finish())
            .map_err(|e| Error::compression(format!("bz2 decompress: {e}")))
    }
}
