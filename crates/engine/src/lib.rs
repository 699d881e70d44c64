//! Engine crate: fragment cache, resource packer, compound writer/reader,
//! pending-objects controller, maintenance algorithms and the engine facade.
//!
//! See [`Engine`] for the public operations.

#![warn(clippy::all)]

mod cache;
mod config;
mod engine;
mod maintenance;
mod packer;
mod pending;
mod reader;
mod stats;
mod writer;

pub use cache::{FragmentCache, PackingPolicy};
pub use config::{
    EngineConfig, GcOptions, SaveOptions, DEFAULT_FRAGMENT_SIZE, DEFAULT_GC_CHUNK_SIZE,
    DEFAULT_MIN_FILL,
};
pub use engine::{Engine, EngineSession};
pub use maintenance::RepairReport;
pub use packer::{Packet, PackingStrategy, ResourcePacker};
pub use pending::PendingObjectsController;
pub use reader::{CompoundReadAdapter, CompoundReader};
pub use stats::Statistics;
pub use writer::WritableCompound;
