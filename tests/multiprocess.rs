//! Real multi-process concurrency scenarios, run with `fork()` rather than
//! re-exec'ing the test binary: the region's backing fd is created with
//! `MFD_CLOEXEC` on the memfd path, so it wouldn't survive an `exec`, but a
//! forked child inherits the parent's whole fd table for free — which is
//! exactly how a master process is meant to hand the region to its
//! workers in the first place.
//!
//! Every test here maps the region at the same fixed virtual address, so
//! they must not run concurrently with each other within this process;
//! `lock_for_test` below serializes them the same way the in-crate unit
//! tests do.
use std::sync::Mutex;

use shm_store::{Config, EntryKind, Store};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn test_config() -> Config {
    Config {
        global_size_b: 4096,
        heap_size: 1 << 20,
        dep_table_pow: 8,
        hash_table_pow: 8,
        ..Config::default()
    }
}

/// Fork `n` workers, each running `work(i)`, and wait for all of them to
/// exit cleanly. Must only be called from a single-threaded process —
/// forking a multi-threaded process is unsound in general, and Rust's test
/// harness runs each `#[test]` on its own thread, so every caller here
/// takes `TEST_LOCK` first to keep this the only thread alive across fork.
fn fork_workers<F: Fn(usize)>(n: usize, work: F) {
    let mut children = Vec::with_capacity(n);
    for i in 0..n {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            work(i);
            unsafe { libc::_exit(0) };
        }
        children.push(pid);
    }
    for pid in children {
        let mut status = 0i32;
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(waited, pid);
        assert_eq!(status, 0, "worker pid {pid} exited with non-zero status");
    }
}

#[test]
fn eight_workers_race_add_dep_on_one_key() {
    let _g = TEST_LOCK.lock().unwrap();
    let (master, connector) = Store::init(&test_config()).unwrap();
    let n = 8usize;

    fork_workers(n, |i| {
        let worker = Store::connect(&connector, true).unwrap();
        worker.add_dep(77, (i + 1) as u32).unwrap();
    });

    master.set_allow_dep_reads(true).unwrap();
    let mut values = master.get_dep(77).unwrap();
    values.sort_unstable();
    assert_eq!(values, (1..=n as u32).collect::<Vec<_>>());
    assert_eq!(master.dep_entry_count(), n as u64);
}

#[test]
fn two_workers_race_add_on_same_key_exactly_one_wins() {
    let _g = TEST_LOCK.lock().unwrap();
    let (master, connector) = Store::init(&test_config()).unwrap();
    let mut hash = [0u8; 16];
    hash[..8].copy_from_slice(&99u64.to_le_bytes());

    fork_workers(2, |_| {
        let worker = Store::connect(&connector, true).unwrap();
        worker.add(&hash, b"same-value", EntryKind::RawString).unwrap();
    });

    assert_eq!(master.get(&hash).unwrap(), b"same-value");
    assert_eq!(master.mem(&hash).unwrap(), shm_store::MemResult::Present);
}

#[test]
fn master_removes_after_workers_finish_then_collects() {
    let _g = TEST_LOCK.lock().unwrap();
    let (master, connector) = Store::init(&test_config()).unwrap();

    let mut hashes = Vec::new();
    for i in 1..=4u64 {
        let mut hash = [0u8; 16];
        hash[..8].copy_from_slice(&i.to_le_bytes());
        hashes.push(hash);
    }
    let hashes_for_workers = hashes.clone();

    fork_workers(4, move |i| {
        let worker = Store::connect(&connector, true).unwrap();
        worker
            .add(&hashes_for_workers[i], format!("value-{i}").as_bytes(), EntryKind::RawString)
            .unwrap();
    });

    master.set_allow_removes(true).unwrap();
    master.remove(&hashes[0]).unwrap();
    master.remove(&hashes[1]).unwrap();

    assert!(master.should_collect(true));
    master.collect().unwrap();

    assert_eq!(master.mem(&hashes[0]).unwrap(), shm_store::MemResult::Removed);
    assert_eq!(master.mem(&hashes[1]).unwrap(), shm_store::MemResult::Removed);
    assert_eq!(master.get(&hashes[2]).unwrap(), b"value-2");
    assert_eq!(master.get(&hashes[3]).unwrap(), b"value-3");
}

#[test]
fn worker_add_dep_honors_stop_flag_across_processes() {
    let _g = TEST_LOCK.lock().unwrap();
    let (master, connector) = Store::init(&test_config()).unwrap();
    master.set_workers_should_exit(true).unwrap();

    fork_workers(1, |_| {
        let worker = Store::connect(&connector, true).unwrap();
        let result = worker.add_dep(1, 1);
        assert!(matches!(result, Err(shm_store::ShmError::WorkerShouldExit)));
    });

    master.set_allow_dep_reads(true).unwrap();
    assert!(master.get_dep(1).unwrap().is_empty());
}
