//! Shared test setup: an engine over in-memory metadata and storage with
//! size-predictable transforms (`pass`/`pass` on both sides).

#![allow(dead_code)]

use std::sync::Arc;
use stowage::{
    CompressTag, Engine, EngineConfig, MemoryMeta, MemoryStorage, Meta, SaveOptions, Storage,
};

pub struct TestBed {
    pub engine: Engine,
    pub meta: Arc<MemoryMeta>,
    pub storage: Arc<MemoryStorage>,
}

pub fn engine_with(config: EngineConfig, storage: MemoryStorage) -> TestBed {
    let meta = Arc::new(MemoryMeta::new());
    let storage = Arc::new(storage);
    let dyn_meta: Arc<dyn Meta> = Arc::clone(&meta) as Arc<dyn Meta>;
    let dyn_storage: Arc<dyn Storage> = Arc::clone(&storage) as Arc<dyn Storage>;
    let engine = Engine::new(dyn_meta, dyn_storage, config).expect("engine construction");
    TestBed {
        engine,
        meta,
        storage,
    }
}

/// Engine with the given fragment size and identity transforms, so fragment
/// and resource sizes equal the plaintext sizes.
pub fn plain_bed(fragment_size: u64) -> TestBed {
    engine_with(plain_config(fragment_size), MemoryStorage::new())
}

pub fn plain_config(fragment_size: u64) -> EngineConfig {
    EngineConfig::default()
        .fragment_size(fragment_size)
        .compound_compress_tag(CompressTag::new("pass"))
}

pub fn opts() -> SaveOptions {
    SaveOptions::default()
}

/// Deterministic bytes where every `chunk`-sized fragment is distinct (for
/// chunk sizes up to 256 fragments per seed).
pub fn patterned(len: usize, chunk: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / chunk) as u8).wrapping_mul(31) ^ (i as u8).wrapping_add(seed))
        .collect()
}
