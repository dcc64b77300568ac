/// The global one-slot blob: a single size-prefixed buffer the master
/// writes once per phase and workers read concurrently.
use crate::error::{Result, ShmError};
use crate::guards::{self, Role};

use super::region::Region;

pub fn store(region: &Region, role: Role, bytes: &[u8]) -> Result<()> {
    guards::require_master(role)?;
    let capacity = region.layout.global_size_b;
    assert!(
        bytes.len() < capacity - 8,
        "blob payload exceeds the configured global_size_b"
    );

    let base = unsafe { region.base_mut_ptr().add(region.layout.blob_offset()) };
    let len_ptr = base as *mut u64;
    let current_len = unsafe { std::ptr::read_volatile(len_ptr) };
    if current_len != 0 {
        return Err(ShmError::AssertionViolation(
            "global blob already holds a value; call clear() first",
        ));
    }

    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(8), bytes.len());
        std::ptr::write_volatile(len_ptr, bytes.len() as u64);
    }
    Ok(())
}

pub fn load(region: &Region) -> Result<Vec<u8>> {
    let base = unsafe { region.base_ptr().add(region.layout.blob_offset()) };
    let len = unsafe { std::ptr::read_volatile(base as *const u64) };
    if len == 0 {
        return Err(ShmError::AssertionViolation(
            "global blob has not been written yet",
        ));
    }
    let data = unsafe { std::slice::from_raw_parts(base.add(8), len as usize) };
    Ok(data.to_vec())
}

pub fn clear(region: &Region, role: Role) -> Result<()> {
    guards::require_master(role)?;
    let base = unsafe { region.base_mut_ptr().add(region.layout.blob_offset()) };
    unsafe { std::ptr::write_volatile(base as *mut u64, 0u64) };
    Ok(())
}
