//! Engine configuration and per-operation options.

use crate::cache::PackingPolicy;
use crate::packer::PackingStrategy;
use std::time::Duration;
use stowage_core::{CompoundKind, CompressTag, WrapTag};

/// Default fragment payload size: 1 MB.
pub const DEFAULT_FRAGMENT_SIZE: u64 = 1_000_000;

/// Default minimum resource fill level.
pub const DEFAULT_MIN_FILL: f64 = 0.9;

/// Default fragment batch size for garbage collection locking.
pub const DEFAULT_GC_CHUNK_SIZE: usize = 500;

/// Engine-wide configuration, fixed at construction.
///
/// Unset values resolve against the storage backend: the resource size
/// defaults to the backend's maximum, the resource wrap tag to the backend's
/// required tag, and the fragment size to 1 MB (or the resource size when
/// that is smaller).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Plaintext bytes per fragment before compound-side encapsulation.
    pub fragment_size: Option<u64>,
    /// Maximum resource payload size; must not exceed the backend maximum.
    pub resource_size: Option<u64>,
    /// Default compound-side wrap stack for writers.
    pub compound_wrap_tag: WrapTag,
    /// Default compound-side compress stack for writers.
    pub compound_compress_tag: CompressTag,
    /// Resource-side wrap stack; must end with the backend's required tag.
    pub resource_wrap_tag: Option<WrapTag>,
    /// Resource-side compress stack.
    pub resource_compress_tag: CompressTag,
    /// Packing policy the fragment cache starts with.
    pub policy: PackingPolicy,
    /// Packet-building strategy.
    pub strategy: PackingStrategy,
    /// Fraction of the resource size a packet must reach to upload outside a
    /// total flush.
    pub min_fill: f64,
    /// Delete the old backend blob after a resource rewrite moved its
    /// mappings.
    pub auto_delete_resource: bool,
    /// Keep per-fragment slices of the last downloaded resource for reads.
    pub cache_last_downloaded_resource: bool,
    /// Attempt a best-effort total flush when a session fails.
    pub upload_on_error: bool,
    /// Default blocking behavior for lock acquisition.
    pub blocking: bool,
    /// Default lock acquisition timeout.
    pub lock_timeout: Option<Duration>,
    /// Unreferenced fragments are locked and deleted in batches of this size.
    pub gc_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fragment_size: None,
            resource_size: None,
            compound_wrap_tag: WrapTag::new("pass"),
            compound_compress_tag: CompressTag::new("zlib"),
            resource_wrap_tag: None,
            resource_compress_tag: CompressTag::new("pass"),
            policy: PackingPolicy::Pass,
            strategy: PackingStrategy::Filling,
            min_fill: DEFAULT_MIN_FILL,
            auto_delete_resource: false,
            cache_last_downloaded_resource: true,
            upload_on_error: false,
            blocking: true,
            lock_timeout: None,
            gc_chunk_size: DEFAULT_GC_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn fragment_size(mut self, size: u64) -> Self {
        self.fragment_size = Some(size);
        self
    }

    pub fn resource_size(mut self, size: u64) -> Self {
        self.resource_size = Some(size);
        self
    }

    pub fn compound_wrap_tag(mut self, tag: WrapTag) -> Self {
        self.compound_wrap_tag = tag;
        self
    }

    pub fn compound_compress_tag(mut self, tag: CompressTag) -> Self {
        self.compound_compress_tag = tag;
        self
    }

    pub fn resource_wrap_tag(mut self, tag: WrapTag) -> Self {
        self.resource_wrap_tag = Some(tag);
        self
    }

    pub fn resource_compress_tag(mut self, tag: CompressTag) -> Self {
        self.resource_compress_tag = tag;
        self
    }

    pub fn policy(mut self, policy: PackingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn strategy(mut self, strategy: PackingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn min_fill(mut self, min_fill: f64) -> Self {
        self.min_fill = min_fill;
        self
    }

    pub fn auto_delete_resource(mut self, enabled: bool) -> Self {
        self.auto_delete_resource = enabled;
        self
    }

    pub fn cache_last_downloaded_resource(mut self, enabled: bool) -> Self {
        self.cache_last_downloaded_resource = enabled;
        self
    }

    pub fn upload_on_error(mut self, enabled: bool) -> Self {
        self.upload_on_error = enabled;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn gc_chunk_size(mut self, size: usize) -> Self {
        self.gc_chunk_size = size;
        self
    }
}

/// Per-save options. Unset tags and sizes fall back to the engine defaults.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub kind: CompoundKind,
    pub wrap_tag: Option<WrapTag>,
    pub compress_tag: Option<CompressTag>,
    pub fragment_size: Option<u64>,
    pub overwrite: bool,
    /// Append to an existing compound instead of overwriting. Not supported:
    /// the stream hash cannot be resumed from encapsulated state, so opening
    /// with `append` always fails.
    pub append: bool,
    /// Pre-hash a seekable input and skip the write when the live compound
    /// already stores the same content. The stream is rewound afterwards.
    pub pre_calc_stream_hash: bool,
    /// Chunk size for draining input streams; defaults to the fragment size.
    pub read_chunk_size: Option<usize>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            kind: CompoundKind::File,
            wrap_tag: None,
            compress_tag: None,
            fragment_size: None,
            overwrite: false,
            append: false,
            pre_calc_stream_hash: false,
            read_chunk_size: None,
        }
    }
}

impl SaveOptions {
    pub fn kind(mut self, kind: CompoundKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn wrap_tag(mut self, tag: WrapTag) -> Self {
        self.wrap_tag = Some(tag);
        self
    }

    pub fn compress_tag(mut self, tag: CompressTag) -> Self {
        self.compress_tag = Some(tag);
        self
    }

    pub fn fragment_size(mut self, size: u64) -> Self {
        self.fragment_size = Some(size);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn pre_calc_stream_hash(mut self, enabled: bool) -> Self {
        self.pre_calc_stream_hash = enabled;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = Some(size);
        self
    }
}

/// What garbage collection keeps. The defaults match routine collection:
/// fragments stay (a writer may reuse them), metadata-known resources without
/// fragments are removed, unknown backend blobs stay.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Keep fragments that no compound references.
    pub keep_fragments: bool,
    /// Keep resources that no fragment references.
    pub keep_resources: bool,
    /// Keep backend blobs that metadata does not know at all.
    pub keep_unreferenced_resources: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            keep_fragments: true,
            keep_resources: false,
            keep_unreferenced_resources: true,
        }
    }
}

impl GcOptions {
    /// Reclaim everything reclaimable.
    pub fn everything() -> Self {
        Self {
            keep_fragments: false,
            keep_resources: false,
            keep_unreferenced_resources: false,
        }
    }

    pub fn keep_fragments(mut self, keep: bool) -> Self {
        self.keep_fragments = keep;
        self
    }

    pub fn keep_resources(mut self, keep: bool) -> Self {
        self.keep_resources = keep;
        self
    }

    pub fn keep_unreferenced_resources(mut self, keep: bool) -> Self {
        self.keep_unreferenced_resources = keep;
        self
    }
}
