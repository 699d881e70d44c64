//! Property-based invariants over the full write/read pipeline.

mod common;

use common::{engine_with, opts, plain_bed, plain_config};
use proptest::prelude::*;
use stowage::{CompoundHash, CompressTag, MemoryStorage, Meta, WrapTag};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Round-trip: whatever bytes go in come back bit-identical, and the
    /// recorded compound hash is the plaintext hash.
    #[test]
    fn prop_roundtrip(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        fragment_size in 1u64..=64,
        wrap_idx in 0usize..3,
        compress_idx in 0usize..2,
    ) {
        let wrap = ["pass", "sc", "ms512"][wrap_idx];
        let compress = ["pass", "zlib"][compress_idx];
        let bed = engine_with(
            plain_config(fragment_size)
                .compound_wrap_tag(WrapTag::new(wrap))
                .compound_compress_tag(CompressTag::new(compress)),
            MemoryStorage::new(),
        );
        bed.engine.save_bytes("prop", &data, &opts()).unwrap();
        bed.engine.flush().unwrap();

        prop_assert_eq!(bed.engine.load_bytes("prop").unwrap(), data.clone());
        let compound = bed.engine.get_compound(&"prop".into()).unwrap().unwrap();
        prop_assert_eq!(compound.hash, CompoundHash::of(&data));
        prop_assert_eq!(compound.size, data.len() as u64);
    }

    /// Deduplication: a second write of the same bytes under another name
    /// creates no new fragments and shares the compound hash.
    #[test]
    fn prop_second_write_deduplicates(
        data in proptest::collection::vec(any::<u8>(), 1..2048),
        fragment_size in 1u64..=64,
    ) {
        let bed = plain_bed(fragment_size);
        bed.engine.save_bytes("first", &data, &opts()).unwrap();
        bed.engine.flush().unwrap();
        let fragments_after_first = bed.meta.total_fragment_count().unwrap();

        bed.engine.save_bytes("second", &data, &opts()).unwrap();
        bed.engine.flush().unwrap();

        prop_assert_eq!(bed.meta.total_fragment_count().unwrap(), fragments_after_first);
        let first = bed.engine.get_compound(&"first".into()).unwrap().unwrap();
        let second = bed.engine.get_compound(&"second".into()).unwrap().unwrap();
        prop_assert_eq!(first.hash, second.hash);
        prop_assert_eq!(bed.engine.load_bytes("second").unwrap(), data);
    }

    /// Offset invariant: after flushing, slicing any resource payload at a
    /// fragment's offset yields exactly that fragment's encapsulated bytes,
    /// and the fragment sizes tile the payload completely.
    #[test]
    fn prop_fragment_offsets_tile_resources(
        data in proptest::collection::vec(any::<u8>(), 1..4096),
        fragment_size in 1u64..=48,
    ) {
        let bed = plain_bed(fragment_size);
        bed.engine.save_bytes("tiled", &data, &opts()).unwrap();
        bed.engine.flush().unwrap();

        for resource in bed.meta.all_resources().unwrap() {
            let mut covered = 0u64;
            for (fragment, bytes) in bed
                .engine
                .cache()
                .load_fragments_of_resource(&resource)
                .unwrap()
            {
                prop_assert_eq!(bytes.len() as u64, fragment.size);
                prop_assert_eq!(stowage::FragmentHash::of(&bytes), fragment.hash);
                covered += fragment.size;
            }
            prop_assert_eq!(covered, resource.payload_size);
        }
    }
}

/// Snapshot density: k snapshots of one name are exactly versions 1..=k with
/// the live row unversioned.
#[test]
fn snapshot_versions_are_dense() {
    let bed = plain_bed(8);
    bed.engine.save_bytes("n", b"v0", &opts()).unwrap();
    bed.engine.flush().unwrap();

    for expected in 1..=4u32 {
        let snapshot = bed.engine.snapshot_compound("n").unwrap();
        assert_eq!(snapshot.version, Some(expected));
    }
    let versions: Vec<Option<u32>> = bed
        .engine
        .list_snapshots(&"n".into())
        .unwrap()
        .into_iter()
        .map(|c| c.version)
        .collect();
    assert_eq!(
        versions,
        vec![Some(1), Some(2), Some(3), Some(4)]
    );
    let live = bed.engine.get_compound(&"n".into()).unwrap().unwrap();
    assert_eq!(live.version, None);
}

/// An empty stream is a valid compound.
#[test]
fn empty_compound_roundtrip() {
    let bed = plain_bed(8);
    bed.engine.save_bytes("empty", b"", &opts()).unwrap();
    bed.engine.flush().unwrap();
    assert_eq!(bed.engine.load_bytes("empty").unwrap(), b"");
    let compound = bed.engine.get_compound(&"empty".into()).unwrap().unwrap();
    assert_eq!(compound.size, 0);
}

/// Reads inside a write session see the session's own pending writes.
#[test]
fn pending_compound_is_readable_before_flush() {
    let bed = plain_bed(4);
    let session = bed.engine.session();
    bed.engine
        .save_bytes("fresh", b"not yet durable", &opts())
        .unwrap();
    // Nothing uploaded or committed yet, but the pending compound serves reads.
    assert_eq!(bed.meta.total_compound_count(None).unwrap(), 0);
    assert_eq!(
        bed.engine.load_bytes("fresh").unwrap(),
        b"not yet durable"
    );
    session.close().unwrap();
    assert_eq!(bed.meta.total_compound_count(None).unwrap(), 1);
    assert_eq!(
        bed.engine.load_bytes("fresh").unwrap(),
        b"not yet durable"
    );
}
