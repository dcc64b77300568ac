/// Lock-free append-only dependency multimap: 31-bit key to a set of 31-bit
/// values, stored as an open-addressed slot array whose slots double as
/// linked-list cells. See the module-level notes in `region.rs` for why
/// addresses/offsets written here stay valid across every mapped process.
///
/// Every slot is a single `u64`: the high 32 bits are the `key` word, the
/// low 32 bits are the `next` word. Each word packs a 31-bit number plus a
/// 1-bit tag (`num | tag << 31`). A slot is empty iff the whole `u64` is
/// zero — the one invariant every function here has to preserve, since
/// `TAG_VAL = 0` makes an all-zero word ambiguous with a legitimate
/// `{val: 0}` pair otherwise.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ShmError};
use crate::guards::{self, Role};

use super::region::Region;

const TAG_BIT: u32 = 1 << 31;
const NUM_MASK: u32 = 0x7FFF_FFFF;

fn pack(num: u32, tag: bool) -> u32 {
    debug_assert!(num <= NUM_MASK, "deptbl key/value does not fit in 31 bits");
    (num & NUM_MASK) | if tag { TAG_BIT } else { 0 }
}

fn unpack(word: u32) -> (u32, bool) {
    (word & NUM_MASK, word & TAG_BIT != 0)
}

fn make_slot(key_num: u32, key_tag: bool, next_num: u32, next_tag: bool) -> u64 {
    ((pack(key_num, key_tag) as u64) << 32) | pack(next_num, next_tag) as u64
}

fn split_slot(raw: u64) -> ((u32, bool), (u32, bool)) {
    (unpack((raw >> 32) as u32), unpack(raw as u32))
}

fn deptbl_slot(region: &Region, idx: u32) -> &AtomicU64 {
    unsafe {
        let base = region.base_ptr().add(region.layout.deptbl_offset());
        &*(base as *const AtomicU64).add(idx as usize)
    }
}

fn bindings_slot(region: &Region, idx: u32) -> &AtomicU64 {
    unsafe {
        let base = region.base_ptr().add(region.layout.bindings_offset());
        &*(base as *const AtomicU64).add(idx as usize)
    }
}

fn mask(region: &Region) -> u32 {
    region.layout.dep_slots - 1
}

fn hash_u32(x: u32) -> u32 {
    let mut h = x;
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846c_a68b);
    h ^= h >> 16;
    h
}

fn hash_pair(key: u32, val: u32) -> u32 {
    hash_u32(key.wrapping_mul(2_654_435_761).wrapping_add(val))
}

/// Bindings precheck: an open-addressed set of `(key, val)` pairs used to
/// short-circuit duplicate edges in O(1) average without walking the
/// deptbl list. Returns `Ok(true)` the first time this edge is observed —
/// the caller must then splice it into the deptbl list.
fn add_binding(region: &Region, key: u32, val: u32) -> Result<bool> {
    let m = mask(region);
    let pair = ((key as u64) << 31) | val as u64;
    let start = hash_pair(key, val) & m;
    let mut idx = start;
    loop {
        let slot = bindings_slot(region, idx);
        let current = slot.load(Ordering::Acquire);
        if current == pair {
            return Ok(false);
        }
        if current == 0 {
            let count = region.globals().deptbl_count.0.load(Ordering::Relaxed);
            if count >= region.layout.dep_slots as u64 {
                return Err(ShmError::DepTableFull);
            }
            match slot.compare_exchange(0, pair, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    region.globals().deptbl_count.0.fetch_add(1, Ordering::Relaxed);
                    return Ok(true);
                }
                Err(observed) if observed == pair => return Ok(false),
                Err(_) => {}
            }
        }
        idx = (idx + 1) & m;
        if idx == start {
            return Err(ShmError::DepTableFull);
        }
    }
}

/// Allocate an interior node slot for `val`, starting the probe from
/// `hash(key<<31|val)`. The node is unreachable until a subsequent head CAS
/// links it in, so a plain store can finish populating it.
fn alloc_deptbl_node(region: &Region, key: u32, val: u32) -> Result<u32> {
    let m = mask(region);
    let start = hash_pair(key, val) & m;
    let mut idx = start;
    loop {
        let slot = deptbl_slot(region, idx);
        if slot.load(Ordering::Acquire) == 0 {
            // Claim with a placeholder; the real next-field is overwritten
            // below once we know it, before we ever publish this index.
            let claim = make_slot(val, false, NUM_MASK, true);
            if slot
                .compare_exchange(0, claim, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(idx);
            }
        }
        idx = (idx + 1) & m;
        if idx == start {
            return Err(ShmError::DepTableFull);
        }
    }
}

fn splice_new_head(region: &Region, head_idx: u32, mut observed: u64, key: u32, val: u32) -> Result<()> {
    loop {
        let (_, (next_num, next_tag)) = split_slot(observed);
        let node_idx = alloc_deptbl_node(region, key, val)?;
        deptbl_slot(region, node_idx).store(
            make_slot(val, false, next_num, next_tag),
            Ordering::Release,
        );

        let head_slot = deptbl_slot(region, head_idx);
        let new_head = make_slot(key, true, node_idx, true);
        match head_slot.compare_exchange(observed, new_head, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(()),
            Err(current) => {
                // Lost the race for the head. The node slot we just claimed
                // stays occupied forever — the table is append-only and
                // never reclaims deptbl nodes — so this is wasted space,
                // not a correctness problem. Retry against the new head.
                observed = current;
            }
        }
    }
}

fn prepend_to_deptbl_list(region: &Region, key: u32, val: u32) -> Result<()> {
    let m = mask(region);
    let start = hash_u32(key) & m;
    let mut probe = start;
    loop {
        let slot = deptbl_slot(region, probe);
        let raw = slot.load(Ordering::Acquire);
        if raw == 0 {
            let candidate = make_slot(key, true, val, false);
            match slot.compare_exchange(0, candidate, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(_) => continue,
            }
        }
        let ((key_num, key_tag), _) = split_slot(raw);
        if key_tag && key_num == key {
            return splice_new_head(region, probe, raw, key, val);
        }
        probe = (probe + 1) & m;
        if probe == start {
            return Err(ShmError::DepTableFull);
        }
    }
}

/// Record the edge `key -> val`. Idempotent: a second `add_dep` with the
/// same pair is a no-op.
pub fn add_dep(region: &Region, key: u32, val: u32) -> Result<()> {
    if add_binding(region, key, val)? {
        prepend_to_deptbl_list(region, key, val)?;
    }
    Ok(())
}

fn walk_chain(region: &Region, head_next_num: u32, head_next_tag: bool) -> Vec<u32> {
    let mut out = Vec::new();
    if !head_next_tag {
        out.push(head_next_num);
        return out;
    }
    let mut idx = head_next_num;
    loop {
        let raw = deptbl_slot(region, idx).load(Ordering::Acquire);
        let ((edge_val, _), (next_num, next_tag)) = split_slot(raw);
        out.push(edge_val);
        if next_tag {
            idx = next_num;
        } else {
            out.push(next_num);
            return out;
        }
    }
}

/// All values bound to `key`. Order is unspecified.
pub fn get_dep(region: &Region, key: u32) -> Result<Vec<u32>> {
    guards::require_dep_reads_allowed(region.globals())?;
    let m = mask(region);
    let start = hash_u32(key) & m;
    let mut probe = start;
    loop {
        let raw = deptbl_slot(region, probe).load(Ordering::Acquire);
        if raw == 0 {
            return Ok(Vec::new());
        }
        let ((key_num, key_tag), (next_num, next_tag)) = split_slot(raw);
        if key_tag && key_num == key {
            return Ok(walk_chain(region, next_num, next_tag));
        }
        probe = (probe + 1) & m;
        if probe == start {
            return Ok(Vec::new());
        }
    }
}

pub fn total_slots(region: &Region) -> u32 {
    region.layout.dep_slots
}

pub fn entry_count(region: &Region) -> u64 {
    region.globals().deptbl_count.0.load(Ordering::Relaxed)
}

pub fn used_slots(region: &Region) -> u32 {
    (0..region.layout.dep_slots)
        .filter(|&i| deptbl_slot(region, i).load(Ordering::Relaxed) != 0)
        .count() as u32
}

/// Zero both the deptbl and the bindings precheck table. Master-only,
/// requires quiescence (no worker touching the store).
pub fn reset(region: &Region, role: Role) -> Result<()> {
    guards::require_master(role)?;
    for i in 0..region.layout.dep_slots {
        deptbl_slot(region, i).store(0, Ordering::Relaxed);
        bindings_slot(region, i).store(0, Ordering::Relaxed);
    }
    region.globals().deptbl_count.0.store(0, Ordering::Relaxed);
    Ok(())
}

/// Enumerate every (key, values) entry currently in the table by scanning
/// for head slots. Used by the persistence sink; not on any hot path.
pub fn for_each_entry<F: FnMut(u32, Vec<u32>)>(region: &Region, mut f: F) {
    for idx in 0..region.layout.dep_slots {
        let raw = deptbl_slot(region, idx).load(Ordering::Acquire);
        if raw == 0 {
            continue;
        }
        let ((key_num, key_tag), (next_num, next_tag)) = split_slot(raw);
        if key_tag {
            f(key_num, walk_chain(region, next_num, next_tag));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shm::region::Region;

    fn test_region() -> Region {
        let config = Config {
            global_size_b: 256,
            heap_size: 4096,
            dep_table_pow: 6,
            hash_table_pow: 6,
            ..Config::default()
        };
        let (region, _connector) = Region::init(&config).expect("region init");
        region.globals().allow_dep_reads.0.store(1, Ordering::Relaxed);
        region
    }

    #[test]
    fn add_dep_is_idempotent_and_unordered() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        add_dep(&region, 1, 2).unwrap();
        add_dep(&region, 1, 3).unwrap();
        add_dep(&region, 1, 2).unwrap();

        let mut values = get_dep(&region, 1).unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![2, 3]);
        assert_eq!(entry_count(&region), 2);
    }

    #[test]
    fn get_dep_on_missing_key_is_empty() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        assert!(get_dep(&region, 42).unwrap().is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        add_dep(&region, 5, 6).unwrap();
        reset(&region, Role::Master).unwrap();
        assert!(get_dep(&region, 5).unwrap().is_empty());
        assert_eq!(entry_count(&region), 0);
    }

    #[test]
    fn reset_rejects_worker() {
        let _g = super::super::region::lock_for_test();
        let region = test_region();
        assert!(matches!(
            reset(&region, Role::Worker),
            Err(ShmError::AssertionViolation(_))
        ));
    }

    #[test]
    fn concurrent_adds_from_many_threads_all_land() {
        use std::sync::Arc;
        use std::thread;

        let _g = super::super::region::lock_for_test();
        let region = Arc::new(test_region());
        let n = 20u32;
        let handles: Vec<_> = (1..=n)
            .map(|v| {
                let region = Arc::clone(&region);
                thread::spawn(move || add_dep(&region, 100, v).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut values = get_dep(&region, 100).unwrap();
        values.sort_unstable();
        assert_eq!(values, (1..=n).collect::<Vec<_>>());
        assert_eq!(entry_count(&region), n as u64);
    }
}
