//! The engine under concurrent use: parallel writers on distinct names,
//! parallel readers on a shared name, and writer/reader exclusion.

mod common;

use common::{engine_with, opts, patterned, plain_config};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stowage::{MemoryMeta, MemoryStorage, Meta, SaveOptions, Storage};

fn shared_engine(blocking: bool) -> Arc<stowage::Engine> {
    let mut config = plain_config(16).blocking(blocking);
    if !blocking {
        config = config.policy(stowage::PackingPolicy::Pass);
    }
    let bed = engine_with(config, MemoryStorage::new());
    Arc::new(bed.engine)
}

#[test]
fn parallel_writers_on_distinct_names() {
    let engine = shared_engine(true);
    let mut handles = Vec::new();
    for i in 0..8u8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let name = format!("thread/{i}");
            let data = patterned(500, 16, i);
            engine.save_bytes(name.as_str(), &data, &opts()).unwrap();
            (name, data)
        }));
    }
    let written: Vec<(String, Vec<u8>)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    engine.flush().unwrap();
    for (name, data) in written {
        assert_eq!(engine.load_bytes(name.as_str()).unwrap(), data);
    }
}

#[test]
fn parallel_readers_share_one_compound() {
    let engine = shared_engine(true);
    let data = patterned(1000, 16, 42);
    engine.save_bytes("shared", &data, &opts()).unwrap();
    engine.flush().unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = Arc::clone(&engine);
        let expected = data.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..10 {
                assert_eq!(engine.load_bytes("shared").unwrap(), expected);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn open_writer_blocks_nonblocking_reader() {
    let engine = shared_engine(false);
    engine.save_bytes("contested", b"0123456789abcdef", &opts()).unwrap();
    engine.flush().unwrap();

    let writable = engine
        .open_writable("contested", &SaveOptions::default().overwrite(true))
        .unwrap();

    let engine2 = Arc::clone(&engine);
    let err = thread::spawn(move || engine2.load("contested").map(|_| ()))
        .join()
        .unwrap()
        .unwrap_err();
    assert!(err.is_lock_failure());

    let mut writable = writable;
    writable.write(b"fresh data").unwrap();
    writable.close().unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.load_bytes("contested").unwrap(), b"fresh data");
}

#[test]
fn concurrent_writers_same_name_serialize() {
    let engine = shared_engine(true);
    let mut handles = Vec::new();
    for i in 0..4u8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let data = vec![i; 64];
            engine
                .save_bytes("same", &data, &opts().overwrite(true))
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    engine.flush().unwrap();

    // One of the four writes won; the result is a consistent 64-byte run.
    let result = engine.load_bytes("same").unwrap();
    assert_eq!(result.len(), 64);
    assert!(result.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn dedup_race_between_writers_of_identical_data() {
    let engine = shared_engine(true);
    let data = patterned(512, 16, 7);
    let mut handles = Vec::new();
    for i in 0..4u8 {
        let engine = Arc::clone(&engine);
        let data = data.clone();
        handles.push(thread::spawn(move || {
            engine
                .save_bytes(format!("copy/{i}").as_str(), &data, &opts())
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    engine.flush().unwrap();

    for i in 0..4u8 {
        assert_eq!(
            engine.load_bytes(format!("copy/{i}").as_str()).unwrap(),
            data
        );
    }
}

#[test]
fn reader_drop_releases_locks_for_writer() {
    let engine = shared_engine(true);
    engine.save_bytes("doc", &patterned(64, 16, 1), &opts()).unwrap();
    engine.flush().unwrap();

    let mut reader = engine.load("doc").unwrap();
    let _first = reader.next().unwrap().unwrap();
    // Cancel mid-stream; remaining parallel locks must release on drop.
    drop(reader);

    let engine2 = Arc::clone(&engine);
    let writer = thread::spawn(move || {
        engine2
            .save_bytes("doc", b"rewritten", &opts().overwrite(true))
            .unwrap();
    });
    // The writer must not hang on leaked fragment locks.
    thread::sleep(Duration::from_millis(10));
    writer.join().unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.load_bytes("doc").unwrap(), b"rewritten");
}

/// Two write sessions from different threads interleave safely; the shared
/// engine keeps one consistent metadata view.
#[test]
fn interleaved_sessions() {
    let meta = Arc::new(MemoryMeta::new());
    let storage = Arc::new(MemoryStorage::new());
    let engine = Arc::new(
        stowage::Engine::new(
            Arc::clone(&meta) as Arc<dyn Meta>,
            Arc::clone(&storage) as Arc<dyn Storage>,
            plain_config(32),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let session = engine.session();
            for j in 0..4u8 {
                let name = format!("s{i}/{j}");
                engine
                    .save_bytes(name.as_str(), &patterned(100, 32, i * 16 + j), &opts())
                    .unwrap();
            }
            session.close().unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    engine.flush().unwrap();

    assert_eq!(meta.total_compound_count(None).unwrap(), 16);
    for i in 0..4u8 {
        for j in 0..4u8 {
            assert_eq!(
                engine
                    .load_bytes(format!("s{i}/{j}").as_str())
                    .unwrap(),
                patterned(100, 32, i * 16 + j)
            );
        }
    }
}
