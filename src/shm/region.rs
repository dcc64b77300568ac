/// Shared-memory region management: creation, fixed-address mapping, and
/// cross-process reconnection.
///
/// The region is backed by an anonymous, file-descriptor-backed mapping so
/// it survives `fork()` and every process can map the *same* bytes at the
/// *same* virtual address. That last property is what makes every other
/// module in this crate safe: an address stored inside the region by one
/// process is a valid address in every other process that has called
/// [`Region::connect`].
use std::ffi::CString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;
use crate::error::{Result, ShmError};

use super::layout::{Globals, Layout, GLOBALS_SIZE, MAGIC, PAGE_SIZE, SINK_PATH_SIZE};

/// Fixed virtual base address every process maps the region at.
///
/// Chosen well above the typical heap/mmap region on x86_64 Linux so it
/// doesn't collide with ASLR'd libraries or the default mmap arena.
#[cfg(target_pointer_width = "64")]
const FIXED_BASE_ADDR: usize = 0x0000_6000_0000_0000;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("shm_store requires a 64-bit target: stored addresses are 64-bit words");

/// Everything a worker needs to map the same region the master created.
///
/// `fd` is inherited across `fork()`; workers pass this struct (typically
/// serialized alongside the forked argv/env) to [`Region::connect`].
#[derive(Clone, Copy, Debug)]
pub struct Connector {
    pub fd: RawFd,
    pub global_size_b: usize,
    pub heap_size: usize,
    pub dep_table_pow: u8,
    pub hash_table_pow: u8,
}

/// A live mapping of the shared region in the current process.
pub struct Region {
    base: *mut u8,
    size: usize,
    pub layout: Layout,
    fd: RawFd,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a brand-new region: allocate backing storage, map it at the
    /// fixed address, and zero every counter. Called exactly once, by the
    /// master, before any `fork()`.
    pub fn init(config: &Config) -> Result<(Region, Connector)> {
        let layout = Layout::new(
            config.global_size_b,
            config.dep_table_pow,
            config.hash_table_pow,
            config.heap_size,
        );
        let total = layout.total_size();

        if let (Some(dir), Some(minimum)) = (&config.shm_dir, config.minimum_avail) {
            check_minimum_avail(dir, minimum)?;
        }

        let fd = create_backing_fd(config.shm_dir.as_deref())?;
        ftruncate_fd(fd, total)?;

        let base = map_fixed(fd, total)?;
        let region = Region {
            base,
            size: total,
            layout,
            fd,
        };

        region.write_magic();
        region
            .globals()
            .master_pid
            .0
            .store(std::process::id() as u64, Ordering::Relaxed);
        region
            .globals()
            .log_level
            .0
            .store(config.log_level, Ordering::Relaxed);
        region
            .globals()
            .sample_rate
            .0
            .store(config.sample_rate, Ordering::Relaxed);

        let connector = Connector {
            fd,
            global_size_b: config.global_size_b,
            heap_size: config.heap_size,
            dep_table_pow: config.dep_table_pow,
            hash_table_pow: config.hash_table_pow,
        };

        tracing::info!(
            total_bytes = total,
            dep_slots = layout.dep_slots,
            hashtbl_slots = layout.hashtbl_slots,
            "shared region initialized"
        );

        Ok((region, connector))
    }

    /// Map an already-initialized region in the current process.
    ///
    /// Workers call this after `fork()`. The master may call it again if it
    /// needs a second handle (e.g. a supervisor thread), passing
    /// `is_master = true` so the pid slot is kept current.
    pub fn connect(connector: &Connector, is_master: bool) -> Result<Region> {
        let layout = Layout::new(
            connector.global_size_b,
            connector.dep_table_pow,
            connector.hash_table_pow,
            connector.heap_size,
        );
        let total = layout.total_size();
        let base = map_fixed(connector.fd, total)?;

        let region = Region {
            base,
            size: total,
            layout,
            fd: connector.fd,
        };
        region.verify_magic()?;

        if is_master {
            region
                .globals()
                .master_pid
                .0
                .store(std::process::id() as u64, Ordering::Relaxed);
        }

        tracing::info!(is_master, total_bytes = total, "connected to shared region");
        Ok(region)
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.base
    }

    pub fn base_mut_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn globals(&self) -> &Globals {
        unsafe { &*(self.base.add(self.layout.globals_offset()) as *const Globals) }
    }

    /// pid of the process that most recently called `init`/`connect(is_master=true)`.
    pub fn master_pid(&self) -> u32 {
        self.globals().master_pid.0.load(Ordering::Relaxed) as u32
    }

    fn write_magic(&self) {
        unsafe {
            let ptr = self.base.add(self.layout.sink_path_offset());
            std::ptr::copy_nonoverlapping(MAGIC.as_ptr(), ptr, MAGIC.len());
        }
    }

    fn verify_magic(&self) -> Result<()> {
        let mut found = [0u8; 8];
        unsafe {
            let ptr = self.base.add(self.layout.sink_path_offset());
            std::ptr::copy_nonoverlapping(ptr, found.as_mut_ptr(), 8);
        }
        if found != MAGIC {
            return Err(ShmError::AssertionViolation(
                "region magic mismatch: connected to a stale or foreign mapping",
            ));
        }
        Ok(())
    }

    /// Store the external persistence sink's filename into the reserved page.
    /// Master-only by convention of the caller (enforced by [`crate::guards`]).
    pub fn set_sink_path(&self, path: &str) {
        assert!(path.len() < SINK_PATH_SIZE - 8 - 8, "sink path too long");
        unsafe {
            let base = self.base.add(self.layout.sink_path_offset() + 8);
            std::ptr::write_unaligned(base as *mut u64, path.len() as u64);
            std::ptr::copy_nonoverlapping(path.as_ptr(), base.add(8), path.len());
        }
    }

    pub fn sink_path(&self) -> Option<String> {
        unsafe {
            let base = self.base.add(self.layout.sink_path_offset() + 8);
            let len = std::ptr::read_unaligned(base as *const u64) as usize;
            if len == 0 {
                return None;
            }
            let bytes = std::slice::from_raw_parts(base.add(8), len);
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn create_backing_fd(dir: Option<&Path>) -> Result<RawFd> {
    if let Some(dir) = dir {
        return create_tmpfile_fd(dir);
    }
    if let Some(fd) = try_memfd_create() {
        return Ok(fd);
    }
    if let Some(fd) = try_shm_open() {
        return Ok(fd);
    }
    Err(ShmError::FailedAnonymousMemfdInit)
}

#[cfg(target_os = "linux")]
fn try_memfd_create() -> Option<RawFd> {
    let name = CString::new("tcshm").ok()?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd >= 0 {
        Some(fd)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn try_memfd_create() -> Option<RawFd> {
    None
}

static SHM_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

fn try_shm_open() -> Option<RawFd> {
    let unique = SHM_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("/tcshm-{}-{unique}", std::process::id());
    let cname = CString::new(name).ok()?;
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return None;
    }
    unsafe {
        libc::shm_unlink(cname.as_ptr());
    }
    Some(fd)
}

fn create_tmpfile_fd(dir: &Path) -> Result<RawFd> {
    let template = dir.join("tcshm-XXXXXX");
    let mut bytes = template.into_os_string().into_vec();
    bytes.push(0);
    let fd = unsafe { libc::mkstemp(bytes.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(ShmError::Io(std::io::Error::last_os_error()));
    }
    let cpath = unsafe { std::ffi::CStr::from_ptr(bytes.as_ptr() as *const libc::c_char) };
    let path = PathBuf::from(std::ffi::OsStr::from_bytes(cpath.to_bytes()));
    let _ = std::fs::remove_file(&path);
    Ok(fd)
}

fn ftruncate_fd(fd: RawFd, size: usize) -> Result<()> {
    let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if ret != 0 {
        return Err(ShmError::OutOfSharedMemory {
            requested: size,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn map_fixed(fd: RawFd, size: usize) -> Result<*mut u8> {
    let addr = FIXED_BASE_ADDR as *mut libc::c_void;
    let ptr = unsafe {
        libc::mmap(
            addr,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED | libc::MAP_NORESERVE,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::OutOfSharedMemory {
            requested: size,
            source: std::io::Error::last_os_error(),
        });
    }
    debug_assert_eq!(ptr as usize, FIXED_BASE_ADDR);
    exclude_from_core_dumps(ptr, size);
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "linux")]
fn exclude_from_core_dumps(ptr: *mut libc::c_void, size: usize) {
    unsafe {
        libc::madvise(ptr, size, libc::MADV_DONTDUMP);
    }
}

#[cfg(not(target_os = "linux"))]
fn exclude_from_core_dumps(_ptr: *mut libc::c_void, _size: usize) {}

fn check_minimum_avail(dir: &Path, minimum: u64) -> Result<()> {
    let cpath = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| ShmError::FailedAnonymousMemfdInit)?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(ShmError::Io(std::io::Error::last_os_error()));
    }
    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    if available < minimum {
        return Err(ShmError::LessThanMinimumAvailable {
            dir: dir.to_path_buf(),
            available,
            minimum,
        });
    }
    Ok(())
}

const _: () = assert!(GLOBALS_SIZE <= PAGE_SIZE);
const _: () = assert!(SINK_PATH_SIZE > 16);

/// Every `Region` in this process maps at the same fixed virtual address,
/// so tests that create one must not run concurrently with each other —
/// the second `mmap(MAP_FIXED)` would silently replace the first mapping
/// out from under it. Acquire this for the lifetime of any test that calls
/// `Region::init`/`Region::connect`.
#[cfg(test)]
pub(crate) static TEST_REGION_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn lock_for_test() -> std::sync::MutexGuard<'static, ()> {
    TEST_REGION_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
