//! Length-and-checksum envelope.

use super::Wrapper;
use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};
use stowage_core::{Error, Result, WrapTag};

const LEN_PREFIX: usize = 4;
const HASH_SUFFIX: usize = 32;

/// Prefixes a 4-byte big-endian payload length and appends the payload's
/// SHA-256. Unwrap verifies both.
///
/// This is the recommended innermost wrap when the backend may corrupt or
/// truncate uploads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeChecksumWrapper;

impl Wrapper for SizeChecksumWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new("sc")
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(LEN_PREFIX + data.len() + HASH_SUFFIX);
        let mut len = [0u8; LEN_PREFIX];
        BigEndian::write_u32(&mut len, data.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(data);
        out.extend_from_slice(&Sha256::digest(data));
        Ok(out)
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < LEN_PREFIX + HASH_SUFFIX {
            return Err(Error::unwrap_failed("chunk is too small"));
        }
        let stated_len = BigEndian::read_u32(&data[..LEN_PREFIX]) as usize;
        let payload = &data[LEN_PREFIX..data.len() - HASH_SUFFIX];
        let checksum = &data[data.len() - HASH_SUFFIX..];
        if payload.len() != stated_len {
            return Err(Error::unwrap_failed(
                "chunk data is unequal to expected length",
            ));
        }
        if checksum != Sha256::digest(payload).as_slice() {
            return Err(Error::unwrap_failed("chunk data is unequal to expected hash"));
        }
        Ok(payload.to_vec())
    }
}
