/// Role and phase assertions that make the lock-free protocols in
/// [`crate::shm`] safe. These aren't cosmetic: they enforce that removes,
/// moves, and compaction only ever run while no worker is touching the
/// store, which is the entire correctness argument for the atomic
/// protocols not needing a lock.
use std::sync::atomic::Ordering;

use crate::error::{Result, ShmError};
use crate::shm::layout::Globals;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

pub fn require_master(role: Role) -> Result<()> {
    if role != Role::Master {
        debug_assert!(false, "master-only operation invoked by a worker");
        return Err(ShmError::AssertionViolation("operation is master-only"));
    }
    Ok(())
}

pub fn require_removes_allowed(globals: &Globals) -> Result<()> {
    if globals.allow_removes.0.load(Ordering::Acquire) == 0 {
        debug_assert!(false, "remove/move/compact attempted outside a quiescent phase");
        return Err(ShmError::AssertionViolation(
            "removes are not allowed in the current phase",
        ));
    }
    Ok(())
}

pub fn require_dep_reads_allowed(globals: &Globals) -> Result<()> {
    if globals.allow_dep_reads.0.load(Ordering::Acquire) == 0 {
        debug_assert!(false, "dependency read attempted while reads are disallowed");
        return Err(ShmError::AssertionViolation(
            "dependency-table reads are not allowed in the current phase",
        ));
    }
    Ok(())
}

pub fn require_writes_enabled(writes_enabled: bool) -> Result<()> {
    if !writes_enabled {
        debug_assert!(false, "write attempted by a process with writes disabled");
        return Err(ShmError::AssertionViolation(
            "writes are disabled for the current process",
        ));
    }
    Ok(())
}

/// Cooperative cancellation check. A worker with `worker_can_exit = false`
/// never observes the stop flag; this lets a process opt out of early exit
/// for a critical section.
pub fn check_should_exit(globals: &Globals, worker_can_exit: bool) -> Result<()> {
    if worker_can_exit && globals.workers_should_exit.0.load(Ordering::Acquire) != 0 {
        return Err(ShmError::WorkerShouldExit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_only_rejects_worker() {
        assert!(require_master(Role::Master).is_ok());
        assert!(matches!(
            require_master(Role::Worker),
            Err(ShmError::AssertionViolation(_))
        ));
    }
}
