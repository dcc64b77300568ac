/// The bump-allocated, LZ4-compressing heap backing the content table.
///
/// A heap entry is an 8-byte header followed by its (possibly compressed)
/// payload, aligned up to a 64-byte boundary. The header's bit layout
/// (LSB first) is:
///
/// - bit 0: tag bit, always 1 while the word is a header. The compactor
///   relies on this being the one bit that distinguishes a header from a
///   relocation back-pointer, whose LSB is 0 by construction (back-pointers
///   are addresses of 8-byte-aligned atomics).
/// - bits 1..31: uncompressed size, or 0 if the payload was stored raw.
/// - bit 32: kind — 0 = serialized object, 1 = raw string.
/// - bits 33..63: stored size in bytes (compressed size, or raw size if
///   compression didn't help).
use crate::error::{Result, ShmError};

use super::region::Region;

pub(crate) const HEAP_ALIGN: usize = 64;

pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Bump-allocate an entry of `payload_len` stored bytes, returning its
/// offset relative to the heap's base.
pub(crate) fn alloc(region: &Region, payload_len: usize) -> Result<usize> {
    let slot_size = align_up(8 + payload_len, HEAP_ALIGN);
    let offset = region
        .globals()
        .heap_top
        .0
        .fetch_add(slot_size as u64, std::sync::atomic::Ordering::AcqRel) as usize;
    if offset + slot_size > region.layout.heap_size {
        return Err(ShmError::HeapFull);
    }
    Ok(offset)
}

pub(crate) fn entry_ptr(region: &Region, heap_offset: usize) -> *mut u8 {
    unsafe { region.base_mut_ptr().add(region.layout.heap_offset() + heap_offset) }
}

const TAG_BIT: u64 = 1;
const KIND_BIT: u64 = 1 << 32;
const SIZE_MASK: u64 = 0x7FFF_FFFF;

pub(crate) fn make_header(uncompressed_size: u32, raw_string: bool, stored_size: u32) -> u64 {
    debug_assert!(uncompressed_size as u64 <= SIZE_MASK);
    debug_assert!(stored_size as u64 <= SIZE_MASK);
    TAG_BIT
        | ((uncompressed_size as u64 & SIZE_MASK) << 1)
        | if raw_string { KIND_BIT } else { 0 }
        | ((stored_size as u64 & SIZE_MASK) << 33)
}

/// Returns `(uncompressed_size, is_raw_string, stored_size)`.
pub(crate) fn parse_header(header: u64) -> (u32, bool, u32) {
    let uncompressed_size = ((header >> 1) & SIZE_MASK) as u32;
    let is_raw_string = header & KIND_BIT != 0;
    let stored_size = ((header >> 33) & SIZE_MASK) as u32;
    (uncompressed_size, is_raw_string, stored_size)
}

pub(crate) fn slot_size_for(stored_size: u32) -> usize {
    align_up(8 + stored_size as usize, HEAP_ALIGN)
}
