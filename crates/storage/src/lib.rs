//! Opaque blob store contract consumed by the resource packer.
//!
//! A storage backend keeps named resource blobs and knows two things about
//! itself: the largest blob it accepts and the wrap tag every uploaded
//! resource must end with (a photo host needs `png`, a plain filesystem is
//! happy with `pass`). Concrete cloud/SMB/photo backends live outside the
//! core; [`MemoryStorage`] is the in-process backend the test suite uses.

#![warn(clippy::all)]

mod memory;

pub use memory::MemoryStorage;

use stowage_core::{ResourceHash, ResourceName, Result, WrapTag};

/// Default upper bound per uploaded resource: 10 MB.
pub const DEFAULT_MAX_RESOURCE_SIZE: u64 = 10_000_000;

/// An opaque blob store over named resources.
///
/// Implementations must be `Send + Sync`; calls may come from any engine
/// thread. `delete` is idempotent.
pub trait Storage: Send + Sync {
    /// Stable identifier for this configured backend instance.
    fn identifier(&self) -> String;

    /// Hard upper bound on the byte size of one uploaded resource.
    fn max_resource_size(&self) -> u64;

    /// Wrap tag every resource upload must end with.
    fn required_wrap_tag(&self) -> WrapTag;

    /// Whether `tag` satisfies [`Storage::required_wrap_tag`].
    fn supports_wrap_tag(&self, tag: &WrapTag) -> bool {
        tag.ends_with(&self.required_wrap_tag())
    }

    /// Download a resource blob.
    ///
    /// # Errors
    ///
    /// `StorageNotFound` for unknown names, `Storage` for transport failures.
    fn load(&self, name: &ResourceName) -> Result<Vec<u8>>;

    /// Upload a blob and return the backend-assigned resource name.
    ///
    /// `hash` and `size` describe `data` and let backends that name blobs
    /// content-addressed (or verify uploads) avoid re-reading it.
    fn save(&self, data: &[u8], hash: &ResourceHash, size: u64) -> Result<ResourceName>;

    /// Delete a resource blob. Unknown names are not an error.
    fn delete(&self, name: &ResourceName) -> Result<()>;

    /// List every resource name the backend holds.
    fn list(&self) -> Result<Vec<ResourceName>>;

    /// Delete every resource blob.
    fn wipe(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _accepts_dyn_storage(_storage: &dyn Storage) {}

    #[test]
    fn test_supports_wrap_tag_default_impl() {
        let storage = MemoryStorage::new().with_required_wrap_tag(WrapTag::new("png"));
        assert!(storage.supports_wrap_tag(&WrapTag::new("sc-png")));
        assert!(storage.supports_wrap_tag(&WrapTag::new("png")));
        assert!(!storage.supports_wrap_tag(&WrapTag::new("png-sc")));
    }
}
