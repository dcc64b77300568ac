/// `#[repr(C)]` structures and offset arithmetic for the shared region.
///
/// All structs use fixed-size, explicitly-aligned fields so the layout is
/// identical across compilations and across every process that maps the
/// region. Nothing here is allowed to contain a pointer-width-dependent
/// field whose size differs between 32- and 64-bit builds; the store only
/// targets 64-bit platforms for that reason (see [`super::region`]).
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Magic bytes written at the start of the region to validate a mapping.
pub const MAGIC: [u8; 8] = *b"TCSHM001";

/// Native page size assumed for the small-objects page and the sink-path
/// page. The region manager rounds up to the real OS page size at runtime;
/// this constant only sizes the fixed layout regions conservatively.
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved for the external sink's filename, including its length
/// prefix.
pub const SINK_PATH_SIZE: usize = PAGE_SIZE;

/// Sentinel meaning "no slot" wherever a signed 32-bit slot index is used.
pub const SLOT_NONE: i32 = -1;

/// A value padded out to one full cache line (64 bytes) so that no two
/// atomics in [`Globals`] can ever share a cache line.
#[repr(C, align(64))]
pub struct CacheLinePad<T>(pub T);

const _: () = assert!(std::mem::size_of::<CacheLinePad<AtomicU64>>() == 64);
const _: () = assert!(std::mem::size_of::<CacheLinePad<AtomicU32>>() == 64);

/// The small-objects page: every cross-process counter and flag, each
/// isolated on its own cache line. Lives at offset 0 of the region.
#[repr(C)]
pub struct Globals {
    /// Bump pointer into the heap; bytes already handed out.
    pub heap_top: CacheLinePad<AtomicU64>,
    /// Number of occupied hashtbl slots (`hcounter`).
    pub hashtbl_count: CacheLinePad<AtomicU64>,
    /// Number of occupied deptbl bindings (`dcounter`).
    pub deptbl_count: CacheLinePad<AtomicU64>,
    /// Global monotonic counter, shared by every process.
    pub monotonic_counter: CacheLinePad<AtomicU64>,
    /// pid of the process that called `init`.
    pub master_pid: CacheLinePad<AtomicU64>,
    /// Observability knob: a `tracing::Level`-like integer, consulted by a
    /// caller-installed subscriber layer. Not interpreted by this crate.
    pub log_level: CacheLinePad<AtomicU32>,
    /// Observability knob: sampling rate in parts-per-thousand.
    pub sample_rate: CacheLinePad<AtomicU32>,
    /// Cooperative cancellation flag set by the master.
    pub workers_should_exit: CacheLinePad<AtomicU32>,
    /// Bytes in the heap freed by `remove` but not yet reclaimed.
    pub wasted_heap_size: CacheLinePad<AtomicU64>,
    /// Master-only removes are gated behind this region-global flag so
    /// that a worker process can never observe a partially-quiescent
    /// region as safe to mutate.
    pub allow_removes: CacheLinePad<AtomicU32>,
    /// Whether `get_dep` / dependency-table reads are currently permitted.
    pub allow_dep_reads: CacheLinePad<AtomicU32>,
}

pub const GLOBALS_SIZE: usize = std::mem::size_of::<Globals>();
const _: () = assert!(GLOBALS_SIZE <= PAGE_SIZE);

/// One slot in the dependency table or its bindings set: a single 64-bit
/// word, reinterpreted per §3/§4.4 of the data model.
pub const DEPTBL_SLOT_SIZE: usize = 8;

/// One bucket of the content-table hash table: `{ hash: u64, addr: u64 }`.
pub const HASHTBL_SLOT_SIZE: usize = 16;

/// Layout offsets computed from the three caller-chosen sizes. All offsets
/// are byte offsets from the start of the mapped region.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub global_size_b: usize,
    pub dep_slots: u32,
    pub hashtbl_slots: u32,
    pub heap_size: usize,
}

impl Layout {
    pub fn new(global_size_b: usize, dep_table_pow: u8, hash_table_pow: u8, heap_size: usize) -> Self {
        Layout {
            global_size_b,
            dep_slots: 1u32 << dep_table_pow,
            hashtbl_slots: 1u32 << hash_table_pow,
            heap_size,
        }
    }

    pub fn globals_offset(&self) -> usize {
        0
    }

    pub fn sink_path_offset(&self) -> usize {
        PAGE_SIZE
    }

    pub fn blob_offset(&self) -> usize {
        2 * PAGE_SIZE
    }

    pub fn deptbl_offset(&self) -> usize {
        self.blob_offset() + self.global_size_b
    }

    pub fn bindings_offset(&self) -> usize {
        self.deptbl_offset() + self.dep_slots as usize * DEPTBL_SLOT_SIZE
    }

    pub fn hashtbl_offset(&self) -> usize {
        self.bindings_offset() + self.dep_slots as usize * DEPTBL_SLOT_SIZE
    }

    pub fn heap_offset(&self) -> usize {
        self.hashtbl_offset() + self.hashtbl_slots as usize * HASHTBL_SLOT_SIZE
    }

    pub fn total_size(&self) -> usize {
        self.heap_offset() + self.heap_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_monotone_and_matches_formula() {
        let l = Layout::new(256, 4, 4, 4096);
        assert!(l.globals_offset() < l.sink_path_offset());
        assert!(l.sink_path_offset() < l.blob_offset());
        assert!(l.blob_offset() < l.deptbl_offset());
        assert!(l.deptbl_offset() < l.bindings_offset());
        assert!(l.bindings_offset() < l.hashtbl_offset());
        assert!(l.hashtbl_offset() < l.heap_offset());

        let expected = l.global_size_b
            + l.dep_slots as usize * 8
            + l.dep_slots as usize * 8
            + l.hashtbl_slots as usize * 16
            + l.heap_size
            + 2 * PAGE_SIZE;
        assert_eq!(l.total_size(), expected);
    }
}
