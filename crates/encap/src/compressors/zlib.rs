//! zlib (DEFLATE) compressor.

use super::Compressor;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Write;
use stowage_core::{CompressTag, Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn tag(&self) -> CompressTag {
        CompressTag::new("zlib")
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::compression(format!("zlib compress: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder
            .write_all(data)
            .and_then(|_| decoder.finish())
            .map_err(|e| Error::compression(format!("zlib decompress: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_shrinks_repetitive_data() {
        let c = ZlibCompressor;
        let data = vec![7u8; 10_000];
        let compressed = c.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(c.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_garbage_rejected() {
        let c = ZlibCompressor;
        assert!(c.decompress(b"not a zlib stream").is_err());
    }
}
