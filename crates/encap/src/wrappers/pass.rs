//! Identity wrapper.

use super::Wrapper;
use stowage_core::{Result, WrapTag};

/// Passes bytes through unchanged. Default wrap for backends that accept
/// arbitrary blobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughWrapper;

impl Wrapper for PassThroughWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new("pass")
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
