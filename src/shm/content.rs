/// The lock-free key-to-address content table: a fixed-width slot array
/// `{hash, addr}` plus the variable-sized, LZ4-compressing heap in
/// `heap.rs`. Supports concurrent insert/read, master-only remove/move,
/// and feeds the compactor in `compactor.rs`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lz4_flex::block::{compress, decompress};

use crate::error::{Result, ShmError};
use crate::guards::{self, Role};

use super::heap;
use super::region::Region;

pub(crate) const NULL_ADDR: u64 = 0;
pub(crate) const WRITE_IN_PROGRESS: u64 = 1;

const WATCHDOG: Duration = Duration::from_secs(60);
const MAX_PAYLOAD: usize = (1usize << 31) - 1;

/// Sentinel returned by `add` when a concurrent writer won the race for
/// this key and this call's data was dropped.
pub const DROPPED: i64 = i64::MIN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Serialized,
    RawString,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemResult {
    Present,
    Removed,
    Absent,
}

pub(crate) struct HashtblSlotRef<'a> {
    pub hash: &'a AtomicU64,
    pub addr: &'a AtomicU64,
}

pub(crate) fn slot_at(region: &Region, idx: u32) -> HashtblSlotRef<'_> {
    unsafe {
        let base = region
            .base_ptr()
            .add(region.layout.hashtbl_offset() + idx as usize * 16);
        HashtblSlotRef {
            hash: &*(base as *const AtomicU64),
            addr: &*(base.add(8) as *const AtomicU64),
        }
    }
}

pub(crate) fn hashtbl_mask(region: &Region) -> u32 {
    region.layout.hashtbl_slots - 1
}

fn find_slot_index(region: &Region, hash: u64) -> Option<u32> {
    let m = hashtbl_mask(region);
    let init = (hash & m as u64) as u32;
    let mut idx = init;
    loop {
        let slot = slot_at(region, idx);
        let s = slot.hash.load(Ordering::Acquire);
        if s == hash {
            return Some(idx);
        }
        if s == 0 {
            return None;
        }
        idx = (idx + 1) & m;
        if idx == init {
            return None;
        }
    }
}

fn compress_payload(payload: &[u8]) -> (Vec<u8>, u32) {
    if payload.is_empty() {
        return (Vec::new(), 0);
    }
    let compressed = compress(payload);
    if compressed.len() < payload.len() {
        (compressed, payload.len() as u32)
    } else {
        (payload.to_vec(), 0)
    }
}

fn write_at(region: &Region, slot: &HashtblSlotRef, payload: &[u8], kind: EntryKind) -> Result<(i64, i64)> {
    match slot
        .addr
        .compare_exchange(NULL_ADDR, WRITE_IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
    {
        Err(_) => Ok((DROPPED, DROPPED)),
        Ok(_) => {
            let (stored, uncompressed_size) = compress_payload(payload);
            let heap_offset = heap::alloc(region, stored.len())?;
            let entry_ptr = heap::entry_ptr(region, heap_offset);
            let header = heap::make_header(uncompressed_size, kind == EntryKind::RawString, stored.len() as u32);
            unsafe {
                std::ptr::write_unaligned(entry_ptr as *mut u64, header);
                std::ptr::copy_nonoverlapping(stored.as_ptr(), entry_ptr.add(8), stored.len());
            }
            let total = 8 + stored.len();
            slot.addr.store(entry_ptr as u64, Ordering::Release);
            Ok((total as i64, payload.len() as i64))
        }
    }
}

/// Insert `payload` under `hash`, or update it in place if the hash is
/// already claimed by a prior writer with the same key.
pub fn add(region: &Region, writes_enabled: bool, hash: u64, payload: &[u8], kind: EntryKind) -> Result<(i64, i64)> {
    guards::require_writes_enabled(writes_enabled)?;
    assert!(payload.len() <= MAX_PAYLOAD, "payload exceeds the 2 GiB limit");

    let m = hashtbl_mask(region);
    let init = (hash & m as u64) as u32;
    let mut idx = init;
    loop {
        let slot = slot_at(region, idx);
        let s = slot.hash.load(Ordering::Acquire);
        if s == hash {
            return write_at(region, &slot, payload, kind);
        }
        if s == 0 {
            let count = region.globals().hashtbl_count.0.load(Ordering::Relaxed);
            if count >= region.layout.hashtbl_slots as u64 {
                return Err(ShmError::HashTableFull);
            }
            match slot.hash.compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    region.globals().hashtbl_count.0.fetch_add(1, Ordering::Relaxed);
                    return write_at(region, &slot, payload, kind);
                }
                Err(observed) if observed == hash => return write_at(region, &slot, payload, kind),
                Err(_) => {}
            }
        }
        idx = (idx + 1) & m;
        if idx == init {
            return Err(ShmError::HashTableFull);
        }
    }
}

fn wait_for_publish(slot: &HashtblSlotRef) -> Result<MemResult> {
    let deadline = Instant::now() + WATCHDOG;
    loop {
        let addr = slot.addr.load(Ordering::Acquire);
        if addr == NULL_ADDR {
            return Ok(MemResult::Removed);
        }
        if addr != WRITE_IN_PROGRESS {
            return Ok(MemResult::Present);
        }
        if Instant::now() >= deadline {
            return Err(ShmError::WatchdogStuck {
                key_hash: slot.hash.load(Ordering::Relaxed),
            });
        }
        std::hint::spin_loop();
    }
}

pub fn mem(region: &Region, hash: u64) -> Result<MemResult> {
    let m = hashtbl_mask(region);
    let init = (hash & m as u64) as u32;
    let mut idx = init;
    loop {
        let slot = slot_at(region, idx);
        let s = slot.hash.load(Ordering::Acquire);
        if s == 0 {
            return Ok(MemResult::Absent);
        }
        if s == hash {
            return wait_for_publish(&slot);
        }
        idx = (idx + 1) & m;
        if idx == init {
            return Ok(MemResult::Absent);
        }
    }
}

fn resolve_present_addr(region: &Region, hash: u64) -> Result<u64> {
    match mem(region, hash)? {
        MemResult::Present => {
            let idx = find_slot_index(region, hash).ok_or(ShmError::Unreachable)?;
            Ok(slot_at(region, idx).addr.load(Ordering::Acquire))
        }
        MemResult::Removed | MemResult::Absent => Err(ShmError::AssertionViolation(
            "key is not present in the content table",
        )),
    }
}

pub fn get(region: &Region, hash: u64) -> Result<Vec<u8>> {
    let addr = resolve_present_addr(region, hash)?;
    let header = unsafe { std::ptr::read_unaligned(addr as *const u64) };
    let (uncompressed_size, _kind, stored_size) = heap::parse_header(header);
    let stored = unsafe { std::slice::from_raw_parts((addr + 8) as *const u8, stored_size as usize) };
    if uncompressed_size != 0 {
        let decompressed = decompress(stored, uncompressed_size as usize)
            .map_err(|_| ShmError::AssertionViolation("lz4 decompression failed"))?;
        debug_assert_eq!(decompressed.len(), uncompressed_size as usize);
        Ok(decompressed)
    } else {
        Ok(stored.to_vec())
    }
}

pub fn get_size(region: &Region, hash: u64) -> Result<usize> {
    let addr = resolve_present_addr(region, hash)?;
    let header = unsafe { std::ptr::read_unaligned(addr as *const u64) };
    let (uncompressed_size, _kind, stored_size) = heap::parse_header(header);
    Ok(if uncompressed_size != 0 {
        uncompressed_size as usize
    } else {
        stored_size as usize
    })
}

/// Move the entry at `from_hash` to `to_hash`. Master-only, requires
/// quiescence: `from_hash` must be present, `to_hash` must be absent.
pub fn move_key(region: &Region, role: Role, from_hash: u64, to_hash: u64) -> Result<()> {
    guards::require_master(role)?;
    guards::require_removes_allowed(region.globals())?;

    let from_idx = find_slot_index(region, from_hash)
        .ok_or(ShmError::AssertionViolation("move source key is not present"))?;
    let from_slot = slot_at(region, from_idx);
    let from_addr = from_slot.addr.load(Ordering::Acquire);
    if from_addr == NULL_ADDR || from_addr == WRITE_IN_PROGRESS {
        return Err(ShmError::AssertionViolation("move source key is not present"));
    }

    let m = hashtbl_mask(region);
    let init = (to_hash & m as u64) as u32;
    let mut idx = init;
    let to_idx = loop {
        let slot = slot_at(region, idx);
        let s = slot.hash.load(Ordering::Acquire);
        if s == to_hash {
            if slot.addr.load(Ordering::Acquire) != NULL_ADDR {
                return Err(ShmError::AssertionViolation(
                    "move destination key is already present",
                ));
            }
            break idx;
        }
        if s == 0 {
            let count = region.globals().hashtbl_count.0.load(Ordering::Relaxed);
            if count >= region.layout.hashtbl_slots as u64 {
                return Err(ShmError::HashTableFull);
            }
            if slot
                .hash
                .compare_exchange(0, to_hash, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                region.globals().hashtbl_count.0.fetch_add(1, Ordering::Relaxed);
                break idx;
            }
            continue;
        }
        idx = (idx + 1) & m;
        if idx == init {
            return Err(ShmError::HashTableFull);
        }
    };

    slot_at(region, to_idx).addr.store(from_addr, Ordering::Release);
    from_slot.addr.store(NULL_ADDR, Ordering::Release);
    Ok(())
}

/// Remove the entry at `hash`. Master-only, requires quiescence.
pub fn remove(region: &Region, role: Role, hash: u64) -> Result<()> {
    guards::require_master(role)?;
    guards::require_removes_allowed(region.globals())?;

    let idx = find_slot_index(region, hash)
        .ok_or(ShmError::AssertionViolation("remove target key is not present"))?;
    let slot = slot_at(region, idx);
    let addr = slot.addr.swap(NULL_ADDR, Ordering::AcqRel);
    if addr != NULL_ADDR && addr != WRITE_IN_PROGRESS {
        let header = unsafe { std::ptr::read_unaligned(addr as *const u64) };
        let (_, _, stored_size) = heap::parse_header(header);
        region
            .globals()
            .wasted_heap_size
            .0
            .fetch_add(heap::slot_size_for(stored_size) as u64, Ordering::Relaxed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shm::region::Region;

    fn test_region() -> Region {
        let config = Config {
            global_size_b: 256,
            heap_size: 1 << 20,
            dep_table_pow: 6,
            hash_table_pow: 6,
            ..Config::default()
        };
        let (region, _connector) = Region::init(&config).expect("region init");
        region.globals().allow_removes.0.store(1, std::sync::atomic::Ordering::Relaxed);
        region
    }

    #[test]
    fn add_then_get_round_trips() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        let (alloc_bytes, orig_bytes) = add(&region, true, 0xAA, b"hello", EntryKind::RawString).unwrap();
        assert!(alloc_bytes > 0 && orig_bytes > 0);
        assert_eq!(get(&region, 0xAA).unwrap(), b"hello");
        assert_eq!(get_size(&region, 0xAA).unwrap(), 5);
        assert_eq!(mem(&region, 0xAA).unwrap(), MemResult::Present);
    }

    #[test]
    fn mem_distinguishes_absent_present_removed() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        assert_eq!(mem(&region, 0xBB).unwrap(), MemResult::Absent);
        add(&region, true, 0xBB, b"value", EntryKind::RawString).unwrap();
        assert_eq!(mem(&region, 0xBB).unwrap(), MemResult::Present);
        remove(&region, Role::Master, 0xBB).unwrap();
        assert_eq!(mem(&region, 0xBB).unwrap(), MemResult::Removed);
    }

    #[test]
    fn remove_requires_master_and_quiescence() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        add(&region, true, 0xCC, b"value", EntryKind::RawString).unwrap();
        assert!(matches!(
            remove(&region, Role::Worker, 0xCC),
            Err(ShmError::AssertionViolation(_))
        ));
        region.globals().allow_removes.0.store(0, std::sync::atomic::Ordering::Relaxed);
        assert!(matches!(
            remove(&region, Role::Master, 0xCC),
            Err(ShmError::AssertionViolation(_))
        ));
    }

    #[test]
    fn move_key_transfers_content_and_nulls_source() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        add(&region, true, 0xD1, b"moved value", EntryKind::RawString).unwrap();
        move_key(&region, Role::Master, 0xD1, 0xD2).unwrap();
        assert_eq!(mem(&region, 0xD1).unwrap(), MemResult::Removed);
        assert_eq!(mem(&region, 0xD2).unwrap(), MemResult::Present);
        assert_eq!(get(&region, 0xD2).unwrap(), b"moved value");
    }

    #[test]
    fn large_compressible_payload_round_trips() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        let payload = vec![b'z'; 8192];
        add(&region, true, 0xE1, &payload, EntryKind::RawString).unwrap();
        assert_eq!(get(&region, 0xE1).unwrap(), payload);
    }

    #[test]
    fn concurrent_insert_to_same_key_drops_loser() {
        use std::sync::atomic::AtomicI64;
        use std::sync::Arc;
        use std::thread;

        let _g = super::super::region::lock_for_test();
        let region = Arc::new(test_region());
        let positives = Arc::new(AtomicI64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let region = Arc::clone(&region);
                let positives = Arc::clone(&positives);
                thread::spawn(move || {
                    let (alloc_bytes, _) = add(&region, true, 0xF0, b"same-value", EntryKind::RawString).unwrap();
                    if alloc_bytes != DROPPED {
                        positives.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(positives.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(get(&region, 0xF0).unwrap(), b"same-value");
        assert_eq!(mem(&region, 0xF0).unwrap(), MemResult::Present);
    }
}
