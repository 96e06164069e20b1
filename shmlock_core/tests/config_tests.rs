#![cfg(target_os = "linux")]

mod common;

use common::{unique_name, Cleanup};
use shared_memory::ShmemConf;
use shmlock_core::{open_manager, Error, LockConfig, LockType};
use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
};

fn shm_config(path: &str, num_locks: u32) -> LockConfig {
    LockConfig {
        lock_type: LockType::Shm,
        num_locks,
        shm_path: path.to_string(),
        ..LockConfig::default()
    }
}

#[test]
fn shm_segment_is_created_on_first_use() {
    let name = unique_name("cfg_create");
    let _cleanup = Cleanup(name.clone());
    let first = open_manager(&shm_config(&name, 32)).unwrap();
    for _ in 0..3 {
        first.allocate_lock().unwrap();
    }
    let second = open_manager(&shm_config(&name, 32)).unwrap();
    assert_eq!(second.available_locks().unwrap(), Some(29));
}

#[test]
fn shape_mismatch_needs_renumber() {
    let name = unique_name("cfg_renumber");
    let _cleanup = Cleanup(name.clone());
    let old = open_manager(&shm_config(&name, 32)).unwrap();
    old.allocate_lock().unwrap();

    let err = open_manager(&shm_config(&name, 64)).map(|_| ()).unwrap_err();
    assert!(matches!(err, Error::SegmentShapeMismatch { expected: 64, actual: 32 }));

    let cfg = LockConfig { renumber: true, ..shm_config(&name, 64) };
    let renumbered = open_manager(&cfg).unwrap();
    assert_eq!(renumbered.available_locks().unwrap(), Some(64));
    // The old mapping is detached from the name but still usable.
    assert_eq!(old.available_locks().unwrap(), Some(31));
}

#[test]
fn concurrent_first_use_agrees_on_one_segment() {
    let threads = num_cpus::get().clamp(2, 8);
    for round in 0..20 {
        let name = unique_name(&format!("cfg_race{round}"));
        let _cleanup = Cleanup(name.clone());
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cfg = shm_config(&name, 4096);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let m = open_manager(&cfg).unwrap();
                    m.allocate_lock().unwrap().id()
                })
            })
            .collect();
        let ids: HashSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), threads, "round {round}");

        let m = open_manager(&shm_config(&name, 4096)).unwrap();
        assert_eq!(m.available_locks().unwrap(), Some(4096 - threads as u32));
    }
}

#[test]
fn foreign_segment_still_fails_after_waiting() {
    let name = unique_name("cfg_foreign");
    // Owned by this mapping, so it is unlinked when dropped.
    let _foreign = ShmemConf::new().os_id(&name).size(4096).create().unwrap();
    let err = open_manager(&shm_config(&name, 32)).map(|_| ()).unwrap_err();
    assert!(matches!(err, Error::ForeignSegment(_)));
}
