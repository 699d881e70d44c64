//! # Stowage
//!
//! A content-addressed deduplicating backup engine for quirky object stores.
//!
//! Byte streams ("compounds") are chunked into fixed-size fragments,
//! deduplicated by content hash, packed into opaque container blobs
//! ("resources") and uploaded through a pluggable [`Storage`] backend:
//! a filesystem, a cloud drive, or a photo host that only accepts images
//! (that is what the PNG/SVG wrappers are for). An external metadata index
//! ([`Meta`]) lets the original streams be reconstructed, listed, snapshotted,
//! copied, garbage-collected and integrity-checked.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use stowage::{Engine, EngineConfig, MemoryMeta, MemoryStorage, Meta, SaveOptions, Storage};
//!
//! fn main() -> stowage::Result<()> {
//!     let meta: Arc<dyn Meta> = Arc::new(MemoryMeta::new());
//!     let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//!     let engine = Engine::new(meta, storage, EngineConfig::default())?;
//!
//!     let session = engine.session();
//!     engine.save_bytes("docs/readme", b"hello world", &SaveOptions::default())?;
//!     session.close()?;
//!
//!     assert_eq!(engine.load_bytes("docs/readme")?, b"hello world");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `stowage-core` | Record types, ids, hashes, the unified error type |
//! | `stowage-encap` | Wrap/compress transform stacks and their registries |
//! | `stowage-concurrency` | Per-value reader/writer locks with mass acquisition |
//! | `stowage-meta` | Metadata contract plus the in-memory implementation |
//! | `stowage-storage` | Blob store contract plus the in-memory backend |
//! | `stowage-engine` | Fragment cache, packer, writer/reader, maintenance, facade |

pub use stowage_core::{
    Compound, CompoundHash, CompoundId, CompoundKind, CompoundName, CompressTag, Error, Fragment,
    FragmentHash, FragmentId, Resource, ResourceHash, ResourceId, ResourceName, Result, WrapTag,
};

pub use stowage_concurrency::{AccessGuard, AccessManager, AccessMode, MassReserver};
pub use stowage_encap::{
    decapsulate, encapsulate, Aes256CtrWrapper, Compressor, CompressorRegistry, NonceMode,
    Wrapper, WrapperRegistry,
};
pub use stowage_engine::{
    CompoundReadAdapter, CompoundReader, Engine, EngineConfig, EngineSession, FragmentCache,
    GcOptions, PackingPolicy, PackingStrategy, RepairReport, SaveOptions, Statistics,
    WritableCompound,
};
pub use stowage_meta::{CompoundFilter, MemoryMeta, Meta};
pub use stowage_storage::{MemoryStorage, Storage};
