//! In-memory storage backend.

use crate::{Storage, DEFAULT_MAX_RESOURCE_SIZE};
use dashmap::DashMap;
use stowage_core::{Error, ResourceHash, ResourceName, Result, StorageOp, WrapTag};

/// Blob store backed by a concurrent map. Resources are named by the hex of
/// their content hash, so re-uploading identical bytes is naturally
/// idempotent.
pub struct MemoryStorage {
    blobs: DashMap<ResourceName, Vec<u8>>,
    max_resource_size: u64,
    required_wrap_tag: WrapTag,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            max_resource_size: DEFAULT_MAX_RESOURCE_SIZE,
            required_wrap_tag: WrapTag::new("pass"),
        }
    }

    /// Override the per-resource size bound.
    pub fn with_max_resource_size(mut self, max: u64) -> Self {
        self.max_resource_size = max;
        self
    }

    /// Override the wrap tag resource uploads must end with.
    pub fn with_required_wrap_tag(mut self, tag: WrapTag) -> Self {
        self.required_wrap_tag = tag;
        self
    }

    /// Number of blobs currently stored.
    pub fn resource_count(&self) -> usize {
        self.blobs.len()
    }

    /// Flip one byte of a stored blob. Test hook for corruption scenarios.
    pub fn corrupt(&self, name: &ResourceName, offset: usize) -> Result<()> {
        let mut blob = self
            .blobs
            .get_mut(name)
            .ok_or_else(|| Error::storage_not_found(name))?;
        let len = blob.len();
        if len == 0 {
            return Err(Error::storage(
                StorageOp::Download,
                name,
                "cannot corrupt an empty blob",
            ));
        }
        blob[offset % len] ^= 0x01;
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn identifier(&self) -> String {
        "memory".to_string()
    }

    fn max_resource_size(&self) -> u64 {
        self.max_resource_size
    }

    fn required_wrap_tag(&self) -> WrapTag {
        self.required_wrap_tag.clone()
    }

    fn load(&self, name: &ResourceName) -> Result<Vec<u8>> {
        self.blobs
            .get(name)
            .map(|blob| blob.clone())
            .ok_or_else(|| Error::storage_not_found(name))
    }

    fn save(&self, data: &[u8], hash: &ResourceHash, size: u64) -> Result<ResourceName> {
        if data.len() as u64 != size {
            return Err(Error::storage(
                StorageOp::Upload,
                hash,
                format!("stated size {size} does not match {} data bytes", data.len()),
            ));
        }
        if size > self.max_resource_size {
            return Err(Error::storage(
                StorageOp::Upload,
                hash,
                format!(
                    "resource of {size} bytes exceeds backend maximum {}",
                    self.max_resource_size
                ),
            ));
        }
        let name = ResourceName::new(hash.to_hex());
        tracing::debug!(resource = %name, size, "storing resource blob");
        self.blobs.insert(name.clone(), data.to_vec());
        Ok(name)
    }

    fn delete(&self, name: &ResourceName) -> Result<()> {
        self.blobs.remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ResourceName>> {
        Ok(self.blobs.iter().map(|entry| entry.key().clone()).collect())
    }

    fn wipe(&self) -> Result<()> {
        self.blobs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> ResourceHash {
        ResourceHash::of(data)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let storage = MemoryStorage::new();
        let data = b"resource payload";
        let name = storage
            .save(data, &hash_of(data), data.len() as u64)
            .unwrap();
        assert_eq!(storage.load(&name).unwrap(), data);
        assert_eq!(storage.list().unwrap(), vec![name]);
    }

    #[test]
    fn test_load_unknown_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.load(&ResourceName::from("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let storage = MemoryStorage::new();
        let data = b"x";
        let name = storage.save(data, &hash_of(data), 1).unwrap();
        storage.delete(&name).unwrap();
        storage.delete(&name).unwrap();
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn test_size_limit_enforced() {
        let storage = MemoryStorage::new().with_max_resource_size(4);
        let data = b"too large";
        let err = storage
            .save(data, &hash_of(data), data.len() as u64)
            .unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let storage = MemoryStorage::new();
        let err = storage.save(b"abc", &hash_of(b"abc"), 99).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn test_wipe_clears_everything() {
        let storage = MemoryStorage::new();
        for data in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            storage.save(data, &hash_of(data), data.len() as u64).unwrap();
        }
        assert_eq!(storage.resource_count(), 3);
        storage.wipe().unwrap();
        assert_eq!(storage.resource_count(), 0);
    }

    #[test]
    fn test_corrupt_flips_a_byte() {
        let storage = MemoryStorage::new();
        let data = b"pristine";
        let name = storage
            .save(data, &hash_of(data), data.len() as u64)
            .unwrap();
        storage.corrupt(&name, 3).unwrap();
        assert_ne!(storage.load(&name).unwrap(), data);
    }
}
