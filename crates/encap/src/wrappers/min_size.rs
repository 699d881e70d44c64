//! Minimum-size padding envelope.

use super::Wrapper;
use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use stowage_core::{Error, Result, WrapTag};

const LEN_PREFIX: usize = 4;

/// Pads the payload with random bytes so the envelope is at least
/// `minimum_size` bytes: 4-byte big-endian length prefix, payload, random
/// fill. With `minimum_size < 4` the wrapper degenerates to identity.
///
/// Registered as `ms<N>`, e.g. `ms512`.
#[derive(Debug, Clone, Copy)]
pub struct MinimumSizeWrapper {
    minimum_size: u64,
}

impl MinimumSizeWrapper {
    pub fn new(minimum_size: u64) -> Self {
        Self { minimum_size }
    }
}

impl Wrapper for MinimumSizeWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new(format!("ms{}", self.minimum_size))
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        if (self.minimum_size as usize) < LEN_PREFIX {
            return Ok(data.to_vec());
        }
        let fill = (self.minimum_size as usize)
            .saturating_sub(data.len())
            .saturating_sub(LEN_PREFIX);
        let mut out = Vec::with_capacity(LEN_PREFIX + data.len() + fill);
        let mut len = [0u8; LEN_PREFIX];
        BigEndian::write_u32(&mut len, data.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(data);
        let mut padding = vec![0u8; fill];
        rand::thread_rng().fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
        Ok(out)
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        if (self.minimum_size as usize) < LEN_PREFIX {
            return Ok(data.to_vec());
        }
        if (data.len() as u64) < self.minimum_size {
            return Err(Error::unwrap_failed("chunk is too small"));
        }
        let stated_len = BigEndian::read_u32(&data[..LEN_PREFIX]) as usize;
        if data.len() - LEN_PREFIX < stated_len {
            return Err(Error::unwrap_failed(
                "chunk data is smaller than expected length",
            ));
        }
        Ok(data[LEN_PREFIX..LEN_PREFIX + stated_len].to_vec())
    }
}
