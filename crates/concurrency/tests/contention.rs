//! Cross-thread behavior of the access manager under contention.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stowage_concurrency::{AccessManager, AccessMode, MassReserver};

/// Two threads mass-acquiring overlapping sets in opposite orders must both
/// finish. Sorting inside mass acquisition is what prevents the classic
/// a-then-b vs b-then-a deadlock.
#[test]
fn mass_exclusive_overlapping_sets_do_not_deadlock() {
    let manager = Arc::new(AccessManager::<String>::new());
    let rounds = 200;

    let mut handles = Vec::new();
    for order in [["a", "b"], ["b", "a"]] {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            let values: Vec<String> = order.iter().map(|s| s.to_string()).collect();
            for _ in 0..rounds {
                manager
                    .mass_access(&values, AccessMode::Exclusive, true, None)
                    .unwrap();
                manager.mass_leave(&values, AccessMode::Exclusive);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(manager.managed_values().is_empty());
}

#[test]
fn parallel_readers_coexist_while_writer_waits() {
    let manager = Arc::new(AccessManager::<u32>::new());
    manager.access(&1, AccessMode::Parallel, true, None).unwrap();
    manager.access(&1, AccessMode::Parallel, true, None).unwrap();

    let writer = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            manager.access(&1, AccessMode::Exclusive, true, None).unwrap();
            manager.leave(&1, AccessMode::Exclusive);
        })
    };
    thread::sleep(Duration::from_millis(20));
    manager.leave(&1, AccessMode::Parallel);
    thread::sleep(Duration::from_millis(10));
    manager.leave(&1, AccessMode::Parallel);
    writer.join().unwrap();
    assert!(!manager.manages_value(&1));
}

#[test]
fn many_threads_hammer_disjoint_and_shared_values() {
    let manager = Arc::new(AccessManager::<u32>::new());
    let mut handles = Vec::new();
    for i in 0..8u32 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            for round in 0..100u32 {
                // Every thread touches a private value and the shared value 0.
                let values = vec![0, i + 1, (round % 4) + 100];
                manager
                    .mass_access(&values, AccessMode::Exclusive, true, None)
                    .unwrap();
                manager.mass_leave(&values, AccessMode::Exclusive);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(manager.managed_values().is_empty());
}

#[test]
fn reserver_drop_unblocks_waiting_writer() {
    let manager = Arc::new(AccessManager::<String>::new());
    let value = "compound".to_string();

    let mut reserver = MassReserver::parallel(Arc::clone(&manager), true, None);
    reserver.reserve_one(value.clone()).unwrap();

    let writer = {
        let manager = Arc::clone(&manager);
        let value = value.clone();
        thread::spawn(move || {
            manager.access(&value, AccessMode::Exclusive, true, None).unwrap();
            manager.leave(&value, AccessMode::Exclusive);
        })
    };
    thread::sleep(Duration::from_millis(20));
    drop(reserver);
    writer.join().unwrap();
}
