//! Record types shared across the engine.
//!
//! The metadata index is built from three record kinds and two mapping rows:
//! - [`Compound`]: a named stored stream (file or directory marker)
//! - [`Fragment`]: a content-addressed chunk of compound payload
//! - [`Resource`]: an uploaded backend blob holding packed fragments
//! - compound→fragment rows carry a dense sequence index
//! - fragment→resource rows carry a byte offset into the resource payload
//!
//! Records are plain data; integer ids are assigned by the metadata store and
//! passed at API boundaries instead of owning references.

use sha2::{Digest, Sha256};
use std::fmt;

/// Number of bytes in a content hash (SHA-256).
pub const HASH_LEN: usize = 32;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw integer value.
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Metadata row id of a compound.
    CompoundId
);
id_newtype!(
    /// Metadata row id of a fragment.
    FragmentId
);
id_newtype!(
    /// Metadata row id of a resource.
    ResourceId
);

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; HASH_LEN]);

        impl $name {
            /// SHA-256 of `data`.
            pub fn of(data: &[u8]) -> Self {
                let digest = Sha256::digest(data);
                let mut out = [0u8; HASH_LEN];
                out.copy_from_slice(&digest);
                Self(out)
            }

            /// Raw digest bytes.
            pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
                &self.0
            }

            /// Lowercase hex rendering of the digest.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl From<[u8; HASH_LEN]> for $name {
            fn from(bytes: [u8; HASH_LEN]) -> Self {
                Self(bytes)
            }
        }
    };
}

hash_newtype!(
    /// SHA-256 over the plaintext stream of a compound.
    CompoundHash
);
hash_newtype!(
    /// SHA-256 over the encapsulated bytes of a fragment. Primary dedup key.
    FragmentHash
);
hash_newtype!(
    /// SHA-256 over the encapsulated bytes of a resource as stored at the backend.
    ResourceHash
);

/// Name of a compound. `(name, version)` is unique; the live version is `None`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompoundName(pub String);

impl CompoundName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompoundName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CompoundName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CompoundName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend-assigned name of a resource blob.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName(pub String);

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a compound represents in the saved namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompoundKind {
    /// A stored byte stream.
    File,
    /// A directory marker (zero or more payload bytes describing the entry).
    Dir,
}

impl fmt::Display for CompoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompoundKind::File => f.write_str("file"),
            CompoundKind::Dir => f.write_str("dir"),
        }
    }
}

/// A `-`-joined stack of wrapper tags, applied left to right on wrap.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WrapTag(pub String);

impl WrapTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Individual wrapper tags in application order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('-')
    }

    /// Whether this stack ends with `required` (segment-wise).
    ///
    /// A storage backend demands that every resource leaving the packer is
    /// wrapped so that its wrap stack ends with the backend's required tag;
    /// extra wraps may precede it.
    pub fn ends_with(&self, required: &WrapTag) -> bool {
        let mine: Vec<&str> = self.segments().collect();
        let req: Vec<&str> = required.segments().collect();
        if req.len() > mine.len() {
            return false;
        }
        mine[mine.len() - req.len()..] == req[..]
    }
}

impl fmt::Display for WrapTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WrapTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A `-`-joined stack of compressor tags, applied left to right on compress.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompressTag(pub String);

impl CompressTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Individual compressor tags in application order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('-')
    }
}

impl fmt::Display for CompressTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CompressTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Position of a fragment within its compound's reconstruction order.
/// Dense from 0 per compound.
pub type SequenceIndex = u32;

/// Byte offset of a fragment within its resource's decapsulated payload.
pub type FragmentOffset = u64;

/// A named stored stream. Immutable per version; the live version has
/// `version == None`, snapshots carry dense positive versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compound {
    /// Row id; `None` until the metadata store persists the record.
    pub id: Option<CompoundId>,
    pub name: CompoundName,
    pub kind: CompoundKind,
    /// SHA-256 of the plaintext stream.
    pub hash: CompoundHash,
    /// Plaintext byte count.
    pub size: u64,
    /// Compound-side wrap stack applied to each fragment payload.
    pub wrap_tag: WrapTag,
    /// Compound-side compress stack applied to each fragment payload.
    pub compress_tag: CompressTag,
    /// `None` = live; `Some(v >= 1)` = snapshot.
    pub version: Option<u32>,
}

impl Compound {
    /// A new live (unversioned, unpersisted) compound record.
    pub fn new(
        name: CompoundName,
        kind: CompoundKind,
        hash: CompoundHash,
        size: u64,
        wrap_tag: WrapTag,
        compress_tag: CompressTag,
    ) -> Self {
        Self {
            id: None,
            name,
            kind,
            hash,
            size,
            wrap_tag,
            compress_tag,
            version: None,
        }
    }

    /// Whether this row is a snapshot rather than the live version.
    pub fn is_snapshot(&self) -> bool {
        self.version.is_some()
    }
}

/// A content-addressed chunk of compound payload, after compound-side
/// encapsulation. Shared between all compounds that produced the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Row id; `None` until the metadata store persists the record.
    pub id: Option<FragmentId>,
    pub hash: FragmentHash,
    /// Encapsulated byte count (as packed into a resource).
    pub size: u64,
    /// Plaintext byte count before compound-side encapsulation.
    pub payload_size: u64,
}

impl Fragment {
    pub fn new(hash: FragmentHash, size: u64, payload_size: u64) -> Self {
        Self {
            id: None,
            hash,
            size,
            payload_size,
        }
    }
}

/// An uploaded backend blob holding one or more concatenated fragments,
/// resource-side encapsulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub name: ResourceName,
    /// Byte count as stored at the backend (after resource-side encapsulation).
    pub size: u64,
    /// Byte count of the concatenated fragments before encapsulation.
    pub payload_size: u64,
    pub hash: ResourceHash,
    pub wrap_tag: WrapTag,
    pub compress_tag: CompressTag,
}
