//! LZMA (xz) compressor.

use super::Compressor;
use std::io::Write;
use stowage_core::{CompressTag, Error, Result};
use xz2::write::{XzDecoder, XzEncoder};

#[derive(Debug, Clone, Copy, Default)]
pub struct LzmaCompressor;

impl Compressor for LzmaCompressor {
    fn tag(&self) -> CompressTag {
        CompressTag::new("lzma")
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = XzEncoder::new(Vec::new(), 6);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::compression(format!("lzma compress: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = XzDecoder::new(Vec::new());
        decoder
            .write_all(data)
            .and_then(|_| decoder.finish())
            .map_err(|e| Error::compression(format!("lzma decompress: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let c = LzmaCompressor;
        let data = vec![3u8; 8192];
        let compressed = c.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(c.decompress(&compressed).unwrap(), data);
    }
}
