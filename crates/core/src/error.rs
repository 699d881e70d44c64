//! Unified error type for all engine operations.
//!
//! Exception-driven control flow in the original design is replaced by
//! explicit result types. The variants mirror the error kinds the engine
//! surfaces:
//!
//! - **Existence**: `CompoundAlreadyExists`, `CompoundNotExisting`, `NotFound`
//! - **Integrity**: `ResourceManipulated`, `FragmentManipulated`,
//!   `CompoundManipulated` (corruption detected during a read)
//! - **Consistency**: `FragmentMissing`, `ResourceMissing`
//! - **Locking**: `NonBlocking`, `Timeout` (non-fatal; the caller's
//!   transaction aborts cleanly)
//! - **Configuration**: `UnsupportedTag`, `Unsupported`
//! - **Pipeline**: `UnwrapFailed`, `Compression`
//! - **Backends**: `Storage`, `Meta`

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage backend operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Download,
    Upload,
    Delete,
    List,
    Wipe,
}

impl std::fmt::Display for StorageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageOp::Download => "download",
            StorageOp::Upload => "upload",
            StorageOp::Delete => "delete",
            StorageOp::List => "list",
            StorageOp::Wipe => "wipe",
        };
        f.write_str(s)
    }
}

/// Error type for the engine and its components.
#[derive(Debug, Error)]
pub enum Error {
    /// A writer was opened without `overwrite` on an existing name, or a
    /// pre-calculated stream hash matched the existing compound.
    #[error("compound already exists: {name}")]
    CompoundAlreadyExists { name: String },

    /// Load/delete/rename of an unknown compound name.
    #[error("compound does not exist: {name}")]
    CompoundNotExisting { name: String },

    /// Resource length or hash mismatch on load, or a decapsulated payload
    /// length mismatch. Fatal for that read.
    #[error("resource manipulated: {reason}")]
    ResourceManipulated { reason: String },

    /// Fragment length or hash mismatch on load. Fatal for the enclosing
    /// compound load.
    #[error("fragment manipulated: {reason}")]
    FragmentManipulated { reason: String },

    /// Running stream hash did not match the recorded compound hash after a
    /// full load.
    #[error("compound manipulated: {name}")]
    CompoundManipulated { name: String },

    /// A referenced fragment has no fragment-resource mapping.
    #[error("fragment missing: {reason}")]
    FragmentMissing { reason: String },

    /// A referenced resource is absent from the storage backend.
    #[error("resource missing: {reason}")]
    ResourceMissing { reason: String },

    /// Nonblocking lock acquisition failed.
    #[error("lock not available without blocking")]
    NonBlocking,

    /// Lock acquisition timed out.
    #[error("lock acquisition timed out")]
    Timeout,

    /// Unknown wrap or compress tag. Fatal configuration error.
    #[error("unsupported transform tag: {tag}")]
    UnsupportedTag { tag: String },

    /// Operation not supported (e.g. appending to an existing compound).
    #[error("unsupported operation: {reason}")]
    Unsupported { reason: String },

    /// A wrapper failed to invert its transform (bad envelope, checksum
    /// mismatch, truncated data).
    #[error("unwrap failed: {reason}")]
    UnwrapFailed { reason: String },

    /// A compressor failed to compress or decompress.
    #[error("compression error: {reason}")]
    Compression { reason: String },

    /// Storage backend call failed.
    #[error("storage {op} failed for {name}: {reason}")]
    Storage {
        op: StorageOp,
        name: String,
        reason: String,
    },

    /// Resource name unknown to the storage backend.
    #[error("resource not found in storage: {name}")]
    StorageNotFound { name: String },

    /// Metadata record lookup failed (fragment/resource rows).
    #[error("record not found: {what}")]
    NotFound { what: String },

    /// Metadata store failure.
    #[error("metadata error: {reason}")]
    Meta { reason: String },

    /// I/O failure while consuming or producing a caller stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the engine.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn compound_already_exists(name: impl std::fmt::Display) -> Self {
        Error::CompoundAlreadyExists {
            name: name.to_string(),
        }
    }

    pub fn compound_not_existing(name: impl std::fmt::Display) -> Self {
        Error::CompoundNotExisting {
            name: name.to_string(),
        }
    }

    pub fn resource_manipulated(reason: impl Into<String>) -> Self {
        Error::ResourceManipulated {
            reason: reason.into(),
        }
    }

    pub fn fragment_manipulated(reason: impl Into<String>) -> Self {
        Error::FragmentManipulated {
            reason: reason.into(),
        }
    }

    pub fn compound_manipulated(name: impl std::fmt::Display) -> Self {
        Error::CompoundManipulated {
            name: name.to_string(),
        }
    }

    pub fn fragment_missing(reason: impl Into<String>) -> Self {
        Error::FragmentMissing {
            reason: reason.into(),
        }
    }

    pub fn resource_missing(reason: impl Into<String>) -> Self {
        Error::ResourceMissing {
            reason: reason.into(),
        }
    }

    pub fn unsupported_tag(tag: impl Into<String>) -> Self {
        Error::UnsupportedTag { tag: tag.into() }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Error::Unsupported {
            reason: reason.into(),
        }
    }

    pub fn unwrap_failed(reason: impl Into<String>) -> Self {
        Error::UnwrapFailed {
            reason: reason.into(),
        }
    }

    pub fn compression(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    pub fn storage(op: StorageOp, name: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Storage {
            op,
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn storage_not_found(name: impl std::fmt::Display) -> Self {
        Error::StorageNotFound {
            name: name.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub fn meta(reason: impl Into<String>) -> Self {
        Error::Meta {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// True for "does not exist" errors (compound, record, storage blob).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::CompoundNotExisting { .. }
                | Error::NotFound { .. }
                | Error::StorageNotFound { .. }
        )
    }

    /// True when a verification step detected manipulated or corrupt data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::ResourceManipulated { .. }
                | Error::FragmentManipulated { .. }
                | Error::CompoundManipulated { .. }
        )
    }

    /// True for non-fatal lock acquisition failures. The caller's transaction
    /// aborts cleanly and may be retried.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Error::NonBlocking | Error::Timeout)
    }
}
