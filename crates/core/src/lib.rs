//! Core types and errors for the stowage engine.
//!
//! This crate defines the record types the metadata index is built from
//! (compounds, fragments, resources and their mapping rows), the id and hash
//! newtypes passed across API boundaries, and the unified [`Error`] type.

#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result, StorageOp};
pub use types::{
    Compound, CompoundHash, CompoundId, CompoundKind, CompoundName, CompressTag, Fragment,
    FragmentHash, FragmentId, FragmentOffset, Resource, ResourceHash, ResourceId, ResourceName,
    SequenceIndex, WrapTag, HASH_LEN,
};
