/// In-place mark-and-move compaction of the heap. Runs only while the
/// master holds quiescence: it relocates every live entry to close the
/// gaps left by `remove`, using the header LSB as the sole tag that
/// distinguishes a live entry's header from a dead entry's relocation
/// back-pointer — no side table is needed.
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::guards::{self, Role};

use super::content::{self, NULL_ADDR, WRITE_IN_PROGRESS};
use super::heap;
use super::region::Region;

/// Whether a compaction pass is worth running: `used >= factor * live`,
/// where `factor` is 1.2 for an aggressive pass or 2.0 by default.
pub fn should_run(region: &Region, aggressive: bool) -> bool {
    let used = region.globals().heap_top.0.load(Ordering::Relaxed);
    let wasted = region.globals().wasted_heap_size.0.load(Ordering::Relaxed);
    if wasted == 0 {
        return false;
    }
    if wasted >= used {
        return true;
    }
    let live = used - wasted;
    let factor = if aggressive { 1.2 } else { 2.0 };
    used as f64 >= factor * live as f64
}

/// Mark pass: for every live hashtbl slot, swap its `addr` field (a
/// pointer) for the entry's header, and leave a back-pointer to that same
/// `addr` field in the heap word where the header used to live. The
/// `addr` field is 8-byte aligned, so the back-pointer's LSB is always 0 —
/// the opposite of a header's LSB, which is always 1.
fn mark(region: &Region) {
    for idx in 0..region.layout.hashtbl_slots {
        let slot = content::slot_at(region, idx);
        let addr = slot.addr.load(Ordering::Acquire);
        if addr == NULL_ADDR || addr == WRITE_IN_PROGRESS {
            continue;
        }
        let back_ptr = slot.addr as *const std::sync::atomic::AtomicU64 as u64;
        unsafe {
            let heap_word = addr as *mut u64;
            let header = std::ptr::read_unaligned(heap_word);
            debug_assert_eq!(header & 1, 1, "live heap entry is missing its header tag bit");
            slot.addr.store(header, Ordering::Relaxed);
            std::ptr::write_unaligned(heap_word, back_ptr);
        }
    }
}

/// Sweep pass: walk the heap linearly, skipping dead entries (still
/// tagged as headers) and sliding live entries (tagged as back-pointers)
/// down to close the gaps, restoring each header and republishing its
/// relocated address into the hashtbl slot it came from. Returns the new
/// heap-top offset.
fn sweep(region: &Region) -> usize {
    let heap_base = unsafe { region.base_mut_ptr().add(region.layout.heap_offset()) };
    let heap_top = region.globals().heap_top.0.load(Ordering::Relaxed) as usize;

    let mut src = 0usize;
    let mut dst = 0usize;
    while src < heap_top {
        let src_ptr = unsafe { heap_base.add(src) };
        let word = unsafe { std::ptr::read_unaligned(src_ptr as *const u64) };

        if word & 1 == 1 {
            let (_, _, stored_size) = heap::parse_header(word);
            src += heap::slot_size_for(stored_size);
            continue;
        }

        let back_ptr = word as *mut u64;
        let header = unsafe { std::ptr::read_unaligned(back_ptr) };
        let (_, _, stored_size) = heap::parse_header(header);
        let slot_size = heap::slot_size_for(stored_size);
        let dst_addr = heap_base as u64 + dst as u64;

        unsafe {
            std::ptr::write_unaligned(back_ptr, dst_addr);
            std::ptr::write_unaligned(src_ptr as *mut u64, header);
            if src != dst {
                std::ptr::copy(src_ptr, heap_base.add(dst), slot_size);
            }
        }
        dst += slot_size;
        src += slot_size;
    }
    dst
}

/// Run a full compaction pass. Master-only, requires quiescence.
pub fn collect(region: &Region, role: Role) -> Result<()> {
    guards::require_master(role)?;
    guards::require_removes_allowed(region.globals())?;

    mark(region);
    let new_top = sweep(region);

    region.globals().heap_top.0.store(new_top as u64, Ordering::Release);
    region.globals().wasted_heap_size.0.store(0, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shm::content::{add, get, mem, remove, EntryKind, MemResult};
    use crate::shm::region::Region;

    fn test_region() -> Region {
        let config = Config {
            global_size_b: 256,
            heap_size: 1 << 16,
            dep_table_pow: 6,
            hash_table_pow: 6,
            ..Config::default()
        };
        let (region, _connector) = Region::init(&config).expect("region init");
        region
            .globals()
            .allow_removes
            .0
            .store(1, Ordering::Relaxed);
        region
    }

    #[test]
    fn no_op_when_nothing_wasted() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        add(&region, true, 1, b"a", EntryKind::RawString).unwrap();
        assert!(!should_run(&region, false));
        let top_before = region.globals().heap_top.0.load(Ordering::Relaxed);
        collect(&region, Role::Master).unwrap();
        assert_eq!(region.globals().heap_top.0.load(Ordering::Relaxed), top_before);
    }

    #[test]
    fn collect_preserves_surviving_entries_and_reclaims_removed_ones() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();

        for k in 1..=10u64 {
            add(&region, true, k, format!("value-{k}").as_bytes(), EntryKind::RawString).unwrap();
        }
        for k in 1..=5u64 {
            remove(&region, Role::Master, k).unwrap();
        }

        assert!(should_run(&region, true));
        collect(&region, Role::Master).unwrap();

        assert_eq!(region.globals().wasted_heap_size.0.load(Ordering::Relaxed), 0);
        for k in 1..=5u64 {
            assert_eq!(mem(&region, k).unwrap(), MemResult::Removed);
        }
        for k in 6..=10u64 {
            assert_eq!(mem(&region, k).unwrap(), MemResult::Present);
            assert_eq!(get(&region, k).unwrap(), format!("value-{k}").as_bytes());
        }
    }

    #[test]
    fn collect_requires_master_and_quiescence() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        assert!(matches!(
            collect(&region, Role::Worker),
            Err(crate::error::ShmError::AssertionViolation(_))
        ));
    }
}
