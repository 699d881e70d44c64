//! Packing-policy behavior of the fragment cache, observed through the
//! engine facade and the in-memory backends.

use std::sync::Arc;
use stowage_core::CompressTag;
use stowage_engine::{Engine, EngineConfig, GcOptions, PackingPolicy, SaveOptions};
use stowage_meta::{MemoryMeta, Meta};
use stowage_storage::{MemoryStorage, Storage};

struct Bed {
    engine: Engine,
    meta: Arc<MemoryMeta>,
    storage: Arc<MemoryStorage>,
}

fn bed(config: EngineConfig, max_resource_size: u64) -> Bed {
    let meta = Arc::new(MemoryMeta::new());
    let storage = Arc::new(MemoryStorage::new().with_max_resource_size(max_resource_size));
    let engine = Engine::new(
        Arc::clone(&meta) as Arc<dyn Meta>,
        Arc::clone(&storage) as Arc<dyn Storage>,
        config.compound_compress_tag(CompressTag::new("pass")),
    )
    .unwrap();
    Bed {
        engine,
        meta,
        storage,
    }
}

fn distinct(len: usize, chunk: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / chunk) as u8).wrapping_mul(37) ^ (i as u8).wrapping_add(seed))
        .collect()
}

#[test]
fn fill_policy_appends_to_smallest_resource() {
    let b = bed(
        EngineConfig::default()
            .fragment_size(50)
            .policy(PackingPolicy::Fill)
            .auto_delete_resource(true),
        1000,
    );

    b.engine
        .save_bytes("first", &distinct(100, 50, 1), &SaveOptions::default())
        .unwrap();
    b.engine.flush().unwrap();
    assert_eq!(b.storage.resource_count(), 1);

    // The second flush rewrites the 100-byte resource with the new fragments
    // appended; auto-delete removes the superseded blob.
    b.engine
        .save_bytes("second", &distinct(100, 50, 2), &SaveOptions::default())
        .unwrap();
    b.engine.flush().unwrap();
    assert_eq!(b.storage.resource_count(), 1);

    let combined = b
        .meta
        .resources_with_referenced_fragment_size()
        .unwrap()
        .into_iter()
        .find(|(_, referenced)| *referenced == 200)
        .expect("combined resource holding all four fragments");
    assert_eq!(combined.0.payload_size, 200);

    assert_eq!(
        b.engine.load_bytes("first").unwrap(),
        distinct(100, 50, 1)
    );
    assert_eq!(
        b.engine.load_bytes("second").unwrap(),
        distinct(100, 50, 2)
    );

    // The superseded resource row has no mappings left; collection drops it.
    b.engine
        .collect_garbage(&GcOptions::default().keep_resources(false))
        .unwrap();
    assert_eq!(b.meta.total_resource_count().unwrap(), 1);
}

#[test]
fn fill_always_policy_prefers_appending() {
    let b = bed(
        EngineConfig::default()
            .fragment_size(50)
            .policy(PackingPolicy::FillAlways),
        1000,
    );

    for (name, seed) in [("a", 1u8), ("b", 2), ("c", 3)] {
        b.engine
            .save_bytes(name, &distinct(100, 50, seed), &SaveOptions::default())
            .unwrap();
        b.engine.flush().unwrap();
    }

    // All fragments were appended into one growing resource; superseded
    // resource rows keep no mappings.
    let with_mappings: Vec<_> = b
        .meta
        .resources_with_referenced_fragment_size()
        .unwrap()
        .into_iter()
        .filter(|(_, referenced)| *referenced > 0)
        .collect();
    assert_eq!(with_mappings.len(), 1);
    assert_eq!(with_mappings[0].1, 300);

    for (name, seed) in [("a", 1u8), ("b", 2), ("c", 3)] {
        assert_eq!(b.engine.load_bytes(name).unwrap(), distinct(100, 50, seed));
    }
}

#[test]
fn pass_policy_withholds_underfilled_buffers() {
    let b = bed(
        EngineConfig::default()
            .fragment_size(100)
            .policy(PackingPolicy::Pass),
        1000,
    );
    // 300 of 1000 bytes buffered: below the fill level, so a plain (non
    // total) flush keeps everything buffered.
    b.engine
        .save_bytes("low", &distinct(300, 100, 9), &SaveOptions::default())
        .unwrap();
    assert_eq!(b.storage.resource_count(), 0);
    assert_eq!(b.engine.cache().buffered_count(), 3);

    b.engine.flush().unwrap();
    assert_eq!(b.storage.resource_count(), 1);
    assert_eq!(b.engine.cache().buffered_count(), 0);
}

#[test]
fn oversized_fragment_is_rejected() {
    let b = bed(EngineConfig::default().fragment_size(64), 128);
    // The sc wrap adds 36 bytes; a 128-byte payload encapsulates to 164
    // bytes, which cannot fit any resource of this backend.
    let err = b
        .engine
        .save_bytes(
            "big",
            &[0u8; 200],
            &SaveOptions::default()
                .fragment_size(128)
                .wrap_tag(stowage_core::WrapTag::new("sc")),
        )
        .unwrap_err();
    assert!(matches!(err, stowage_core::Error::Unsupported { .. }));
}

#[test]
fn unknown_wrap_tag_fails_before_writing() {
    let b = bed(EngineConfig::default(), 1000);
    let err = b
        .engine
        .save_bytes(
            "x",
            b"data",
            &SaveOptions::default().wrap_tag(stowage_core::WrapTag::new("bogus")),
        )
        .unwrap_err();
    assert!(matches!(err, stowage_core::Error::UnsupportedTag { .. }));
}
