//! Namespace operations, garbage collection, the optimizers, consistency
//! checks and repair, exercised over the in-memory backend.

mod common;

use common::{engine_with, opts, patterned, plain_bed, plain_config};
use std::io::{Cursor, Seek};
use stowage::{
    CompoundFilter, CompoundKind, Error, GcOptions, MemoryStorage, Meta, Storage,
};

#[test]
fn copy_shares_fragments() {
    let bed = plain_bed(4);
    let data = patterned(64, 4, 1);
    bed.engine.save_bytes("src", &data, &opts()).unwrap();
    bed.engine.flush().unwrap();
    let fragments_before = bed.meta.total_fragment_count().unwrap();

    let copied = bed.engine.copy_compound("src", "dst", false).unwrap();
    assert_eq!(bed.meta.total_fragment_count().unwrap(), fragments_before);
    assert_eq!(bed.engine.load_bytes("dst").unwrap(), data);

    let src = bed.engine.get_compound(&"src".into()).unwrap().unwrap();
    assert_eq!(copied.hash, src.hash);
    assert_eq!(copied.size, src.size);

    let err = bed.engine.copy_compound("src", "dst", false).unwrap_err();
    assert!(matches!(err, Error::CompoundAlreadyExists { .. }));
}

#[test]
fn rename_refuses_existing_target_and_moves_snapshots() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("old", b"content", &opts()).unwrap();
    bed.engine.save_bytes("taken", b"other", &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.snapshot_compound("old").unwrap();

    let err = bed.engine.rename_compound("old", "taken").unwrap_err();
    assert!(matches!(err, Error::CompoundAlreadyExists { .. }));

    bed.engine.rename_compound("old", "new").unwrap();
    assert_eq!(bed.engine.load_bytes("new").unwrap(), b"content");
    assert_eq!(
        bed.engine.load_version_bytes("new", Some(1)).unwrap(),
        b"content"
    );
    assert!(!bed.engine.has_compound(&"old".into()).unwrap());
}

#[test]
fn delete_with_and_without_snapshots() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("d", b"one", &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.snapshot_compound("d").unwrap();

    // Deleting only the live row leaves the snapshot loadable.
    bed.engine.delete_compound("d", false).unwrap();
    assert!(!bed.meta.has_compound(&"d".into(), None).unwrap());
    assert_eq!(bed.engine.load_version_bytes("d", Some(1)).unwrap(), b"one");

    bed.engine.save_bytes("d", b"two", &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.delete_compound("d", true).unwrap();
    assert!(!bed.meta.has_compound(&"d".into(), Some(1)).unwrap());

    let err = bed.engine.delete_compound("d", false).unwrap_err();
    assert!(matches!(err, Error::CompoundNotExisting { .. }));
}

#[test]
fn delete_by_prefix_and_listing_filters() {
    let bed = plain_bed(4);
    for name in ["logs/a", "logs/b", "data/a"] {
        bed.engine.save_bytes(name, name.as_bytes(), &opts()).unwrap();
    }
    bed.engine.flush().unwrap();

    let listed = bed
        .engine
        .list_compounds(&CompoundFilter::default().prefix("logs/").alphabetical())
        .unwrap();
    let names: Vec<&str> = listed.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["logs/a", "logs/b"]);

    let deleted = bed
        .engine
        .delete_compounds_with_prefix("logs/", Some(CompoundKind::File))
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(bed.meta.total_compound_count(None).unwrap(), 1);
}

#[test]
fn wipe_with_gc_reclaims_everything() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("a", &patterned(64, 4, 1), &opts()).unwrap();
    bed.engine.save_bytes("b", &patterned(32, 4, 2), &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.snapshot_compound("a").unwrap();

    bed.engine.wipe(true).unwrap();
    assert_eq!(bed.meta.total_compound_count(None).unwrap(), 0);
    assert_eq!(bed.meta.snapshot_count().unwrap(), 0);
    assert_eq!(bed.meta.total_fragment_count().unwrap(), 0);
    assert_eq!(bed.meta.total_resource_count().unwrap(), 0);
    assert_eq!(bed.storage.resource_count(), 0);
}

#[test]
fn gc_never_touches_referenced_state() {
    let bed = plain_bed(4);
    let data = patterned(128, 4, 9);
    bed.engine.save_bytes("keep", &data, &opts()).unwrap();
    bed.engine.flush().unwrap();

    bed.engine
        .collect_garbage(&GcOptions::everything())
        .unwrap();
    assert_eq!(bed.engine.load_bytes("keep").unwrap(), data);
    bed.engine.check_storage_consistency().unwrap();
    bed.engine.check_meta_resourceless_fragments().unwrap();
    bed.engine.check_meta_fragmentless_compounds().unwrap();
    bed.engine.check_storage_content().unwrap();
    bed.engine.check_all_compounds().unwrap();
}

#[test]
fn gc_sweeps_unknown_backend_blobs() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("a", b"payload!", &opts()).unwrap();
    bed.engine.flush().unwrap();

    // A blob metadata knows nothing about.
    let stray = b"left behind by something else";
    bed.storage
        .save(stray, &stowage::ResourceHash::of(stray), stray.len() as u64)
        .unwrap();
    assert_eq!(bed.storage.resource_count(), 2);

    // Default GC keeps unknown blobs.
    bed.engine.collect_garbage(&GcOptions::default()).unwrap();
    assert_eq!(bed.storage.resource_count(), 2);

    bed.engine
        .collect_garbage(&GcOptions::default().keep_unreferenced_resources(false))
        .unwrap();
    assert_eq!(bed.storage.resource_count(), 1);
    assert_eq!(bed.engine.load_bytes("a").unwrap(), b"payload!");
}

#[test]
fn space_optimization_compacts_holes() {
    let bed = plain_bed(2);
    // Two compounds flushed together share one resource.
    let session = bed.engine.session();
    bed.engine.save_bytes("a", b"aabbccddee", &opts()).unwrap();
    bed.engine.save_bytes("b", b"qqrrsstt", &opts()).unwrap();
    session.close().unwrap();
    assert_eq!(bed.meta.total_resource_count().unwrap(), 1);

    // Dropping "b" and collecting its fragments leaves a hole.
    bed.engine.delete_compound("b", false).unwrap();
    bed.engine
        .collect_garbage(&GcOptions::default().keep_fragments(false).keep_resources(true))
        .unwrap();
    let (resource, referenced) = bed
        .meta
        .resources_with_referenced_fragment_size()
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(resource.payload_size, 18);
    assert_eq!(referenced, 10);

    bed.engine.optimize_resource_space(0.1).unwrap();
    // "a" now lives on a compact resource; the holey one is unreferenced.
    bed.engine
        .collect_garbage(&GcOptions::default().keep_fragments(true))
        .unwrap();
    let resources = bed.meta.all_resources().unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].payload_size, 10);
    assert_eq!(bed.engine.load_bytes("a").unwrap(), b"aabbccddee");
}

#[test]
fn usage_optimization_combines_small_resources() {
    let bed = engine_with(
        plain_config(100),
        MemoryStorage::new().with_max_resource_size(1000),
    );
    for (name, seed) in [("c1", 1), ("c2", 2), ("c3", 3)] {
        bed.engine
            .save_bytes(name, &patterned(200, 100, seed), &opts())
            .unwrap();
        bed.engine.flush().unwrap();
    }
    assert_eq!(bed.meta.total_resource_count().unwrap(), 3);

    bed.engine.optimize_resource_usage(0.9).unwrap();
    bed.engine
        .collect_garbage(&GcOptions::default().keep_resources(false))
        .unwrap();

    assert_eq!(bed.meta.total_resource_count().unwrap(), 1);
    for (name, seed) in [("c1", 1), ("c2", 2), ("c3", 3)] {
        assert_eq!(bed.engine.load_bytes(name).unwrap(), patterned(200, 100, seed));
    }
}

#[test]
fn defragmentation_packs_fragments_in_read_order() {
    let bed = plain_bed(4);
    let data_a = patterned(40, 4, 1);
    let data_b = patterned(40, 4, 2);
    bed.engine.save_bytes("a", &data_a, &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.save_bytes("b", &data_b, &opts()).unwrap();
    bed.engine.flush().unwrap();
    assert_eq!(bed.meta.total_resource_count().unwrap(), 2);

    bed.engine.defragment_resources().unwrap();
    bed.engine
        .collect_garbage(&GcOptions::default().keep_resources(false))
        .unwrap();

    // Both compounds' fragments landed on a single resource.
    let resources = bed.meta.all_resources().unwrap();
    assert_eq!(resources.len(), 1);
    let rows = bed
        .meta
        .fragments_with_offset_on_resource(resources[0].id)
        .unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[0].1, 0);

    assert_eq!(bed.engine.load_bytes("a").unwrap(), data_a);
    assert_eq!(bed.engine.load_bytes("b").unwrap(), data_b);
}

#[test]
fn repair_restores_mapping_from_same_hash_donor() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("donor", b"shared content", &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.copy_compound("donor", "broken", false).unwrap();

    // Sever the copy's sequence mapping.
    let broken = bed.engine.get_compound(&"broken".into()).unwrap().unwrap();
    bed.meta
        .set_fragment_mappings_for_compound(broken.id.unwrap(), &[])
        .unwrap();
    assert!(bed.engine.check_meta_fragmentless_compounds().is_err());

    let report = bed.engine.repair_fragmentless_compounds().unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.unrepairable, 0);
    bed.engine.check_meta_fragmentless_compounds().unwrap();
    assert_eq!(bed.engine.load_bytes("broken").unwrap(), b"shared content");
}

#[test]
fn storage_consistency_flags_missing_blobs() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("x", b"some bytes", &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.check_storage_consistency().unwrap();

    let name = bed.storage.list().unwrap().pop().unwrap();
    bed.storage.delete(&name).unwrap();
    let err = bed.engine.check_storage_consistency().unwrap_err();
    assert!(matches!(err, Error::ResourceMissing { .. }));
}

#[test]
fn storage_content_check_spots_corruption() {
    let bed = plain_bed(4);
    bed.engine.save_bytes("x", b"some bytes", &opts()).unwrap();
    bed.engine.flush().unwrap();
    bed.engine.check_storage_content().unwrap();

    let name = bed.storage.list().unwrap().pop().unwrap();
    bed.storage.corrupt(&name, 0).unwrap();
    let err = bed.engine.check_storage_content().unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn statistics_reflect_deduplication() {
    let bed = plain_bed(4);
    let data = patterned(40, 4, 5);
    bed.engine.save_bytes("one", &data, &opts()).unwrap();
    bed.engine.save_bytes("two", &data, &opts()).unwrap();
    bed.engine.flush().unwrap();

    let stats = bed.engine.statistics().unwrap();
    assert_eq!(stats.total_compound_count, 2);
    assert_eq!(stats.unique_compound_count, 1);
    assert_eq!(stats.multiple_used_compound_count, 1);
    assert_eq!(stats.saved_bytes_by_multiple_used_compounds, 40);
    assert_eq!(stats.total_fragment_count, 10);
    assert_eq!(stats.multiple_used_fragment_count, 10);
    assert_eq!(stats.saved_bytes_by_duplicate_fragments, 40);
    assert_eq!(stats.unneeded_fragment_count, 0);

    // Snapshots clone the live mapping but count as version bookkeeping, not
    // as fragment duplication.
    bed.engine.snapshot_compound("one").unwrap();
    let stats = bed.engine.statistics().unwrap();
    assert_eq!(stats.snapshot_count, 1);
    assert_eq!(stats.multiple_used_fragment_count, 10);
    assert_eq!(stats.saved_bytes_by_duplicate_fragments, 40);
}

#[test]
fn pre_hash_short_circuits_identical_overwrite() {
    let bed = plain_bed(8);
    let data = b"identical payload".to_vec();
    bed.engine.save_bytes("pre", &data, &opts()).unwrap();
    bed.engine.flush().unwrap();

    let mut stream = Cursor::new(data.clone());
    let err = bed
        .engine
        .save_seekable_stream(
            &mut stream,
            "pre",
            &opts().overwrite(true).pre_calc_stream_hash(true),
        )
        .unwrap_err();
    assert!(matches!(err, Error::CompoundAlreadyExists { .. }));
    // The caller's stream was rewound for reuse.
    assert_eq!(stream.stream_position().unwrap(), 0);

    // Different content passes the pre-hash and overwrites.
    let mut stream = Cursor::new(b"changed payload".to_vec());
    bed.engine
        .save_seekable_stream(
            &mut stream,
            "pre",
            &opts().overwrite(true).pre_calc_stream_hash(true),
        )
        .unwrap();
    bed.engine.flush().unwrap();
    assert_eq!(bed.engine.load_bytes("pre").unwrap(), b"changed payload");
}

#[test]
fn append_mode_is_unsupported() {
    let bed = plain_bed(8);
    bed.engine.save_bytes("a", b"base", &opts()).unwrap();
    bed.engine.flush().unwrap();
    let err = bed
        .engine
        .open_writable("a", &opts().overwrite(true).append(true))
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported { .. }));
}

#[test]
fn overwrite_refused_without_flag() {
    let bed = plain_bed(8);
    bed.engine.save_bytes("a", b"base", &opts()).unwrap();
    bed.engine.flush().unwrap();
    let err = bed.engine.save_bytes("a", b"other", &opts()).unwrap_err();
    assert!(matches!(err, Error::CompoundAlreadyExists { .. }));
    // The failed write left no pending state behind.
    assert_eq!(bed.engine.load_bytes("a").unwrap(), b"base");
}
