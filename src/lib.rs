//! Fixed-address shared-memory key/value and dependency store for a
//! multi-process analysis pipeline.
//!
//! A master process calls [`Store::init`], forks its workers, and each
//! worker calls [`Store::connect`] with the returned [`Connector`]. Every
//! process then maps the same region at the same virtual address, so a
//! pointer written into the region by one process is dereferenceable in
//! any other. Three structures live in that region: a global blob slot
//! (master writes, workers read), a lock-free dependency multimap, and a
//! lock-free content table with an LZ4-compressing heap and a compacting
//! garbage collector. Removes, moves, and compaction are master-only and
//! require the caller to have paused every worker first — these protocols
//! are not safe against a concurrent worker, by design.
pub mod codec;
pub mod config;
pub mod error;
pub mod guards;
pub mod shm;
pub mod sink;

use std::path::PathBuf;

pub use codec::{hashtbl_key, KeyHash128, ValueCodec, Xxh3KeyHash};
pub use config::Config;
pub use error::{Result, ShmError};
pub use guards::Role;
pub use shm::content::{EntryKind, MemResult, DROPPED};
pub use shm::region::Connector;

use shm::region::Region;

/// Environment variable naming the relational mirror file. Empty or unset
/// disables the sink.
pub const FILE_INFO_ON_DISK_PATH_VAR: &str = "FILE_INFO_ON_DISK_PATH";

/// One process's handle onto the shared region: the live mapping plus this
/// process's role and its process-local write/exit policy. Unlike the
/// region-global flags (`allow_removes`, `allow_dep_reads`,
/// `workers_should_exit`), these two fields are deliberately per-process —
/// a test runner can force a read-only persona on one process without
/// touching shared state any other process observes.
pub struct Store {
    region: Region,
    role: Role,
    writes_enabled: bool,
    worker_can_exit: bool,
}

impl Store {
    /// Master-side: create the region from scratch. Call before forking
    /// any workers.
    pub fn init(config: &Config) -> Result<(Store, Connector)> {
        let (region, connector) = Region::init(config)?;
        let store = Store {
            region,
            role: Role::Master,
            writes_enabled: true,
            worker_can_exit: false,
        };
        Ok((store, connector))
    }

    /// Worker-side: map an already-initialized region. `worker_can_exit`
    /// governs whether [`Store::check_should_exit`] is allowed to return
    /// early for this process.
    pub fn connect(connector: &Connector, worker_can_exit: bool) -> Result<Store> {
        let region = Region::connect(connector, false)?;
        Ok(Store {
            region,
            role: Role::Worker,
            writes_enabled: true,
            worker_can_exit,
        })
    }

    /// A second handle for the master process itself (e.g. a supervisor
    /// thread), refreshing the master-pid slot.
    pub fn reconnect_as_master(connector: &Connector) -> Result<Store> {
        let region = Region::connect(connector, true)?;
        Ok(Store {
            region,
            role: Role::Master,
            writes_enabled: true,
            worker_can_exit: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn master_pid(&self) -> u32 {
        self.region.master_pid()
    }

    /// Flip this process's local write gate, independent of any
    /// region-global state.
    pub fn set_writes_enabled(&mut self, enabled: bool) {
        self.writes_enabled = enabled;
    }

    pub fn check_should_exit(&self) -> Result<()> {
        guards::check_should_exit(self.region.globals(), self.worker_can_exit)
    }

    pub fn next_counter(&self) -> u64 {
        shm::counter::next(Some(&self.region))
    }

    /// Open or close the quiescent phase during which `remove`/`move_key`/
    /// `collect` are permitted. Master-only: the caller is responsible for
    /// having actually paused every worker before flipping this on.
    pub fn set_allow_removes(&self, allowed: bool) -> Result<()> {
        guards::require_master(self.role)?;
        self.region
            .globals()
            .allow_removes
            .0
            .store(allowed as u32, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Open or close `get_dep` reads region-wide. Master-only.
    pub fn set_allow_dep_reads(&self, allowed: bool) -> Result<()> {
        guards::require_master(self.role)?;
        self.region
            .globals()
            .allow_dep_reads
            .0
            .store(allowed as u32, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Set or clear the region-wide cooperative cancellation flag. Master-only.
    pub fn set_workers_should_exit(&self, stop: bool) -> Result<()> {
        guards::require_master(self.role)?;
        self.region
            .globals()
            .workers_should_exit
            .0
            .store(stop as u32, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    // -- global blob ---------------------------------------------------

    pub fn store_blob(&self, bytes: &[u8]) -> Result<()> {
        shm::blob::store(&self.region, self.role, bytes)
    }

    pub fn load_blob(&self) -> Result<Vec<u8>> {
        shm::blob::load(&self.region)
    }

    pub fn clear_blob(&self) -> Result<()> {
        shm::blob::clear(&self.region, self.role)
    }

    // -- dependency table ------------------------------------------------

    pub fn add_dep(&self, key: u32, val: u32) -> Result<()> {
        self.check_should_exit()?;
        shm::deptbl::add_dep(&self.region, key, val)
    }

    pub fn get_dep(&self, key: u32) -> Result<Vec<u32>> {
        shm::deptbl::get_dep(&self.region, key)
    }

    pub fn dep_used_slots(&self) -> u32 {
        shm::deptbl::used_slots(&self.region)
    }

    pub fn dep_total_slots(&self) -> u32 {
        shm::deptbl::total_slots(&self.region)
    }

    pub fn dep_entry_count(&self) -> u64 {
        shm::deptbl::entry_count(&self.region)
    }

    pub fn reset_deps(&self) -> Result<()> {
        shm::deptbl::reset(&self.region, self.role)
    }

    // -- content table ---------------------------------------------------

    pub fn add(&self, hash128: &[u8; 16], payload: &[u8], kind: EntryKind) -> Result<(i64, i64)> {
        self.check_should_exit()?;
        shm::content::add(&self.region, self.writes_enabled, hashtbl_key(hash128), payload, kind)
    }

    pub fn mem(&self, hash128: &[u8; 16]) -> Result<MemResult> {
        shm::content::mem(&self.region, hashtbl_key(hash128))
    }

    pub fn get(&self, hash128: &[u8; 16]) -> Result<Vec<u8>> {
        shm::content::get(&self.region, hashtbl_key(hash128))
    }

    pub fn get_size(&self, hash128: &[u8; 16]) -> Result<usize> {
        shm::content::get_size(&self.region, hashtbl_key(hash128))
    }

    pub fn move_key(&self, from: &[u8; 16], to: &[u8; 16]) -> Result<()> {
        shm::content::move_key(&self.region, self.role, hashtbl_key(from), hashtbl_key(to))
    }

    pub fn remove(&self, hash128: &[u8; 16]) -> Result<()> {
        shm::content::remove(&self.region, self.role, hashtbl_key(hash128))
    }

    // -- compaction -------------------------------------------------------

    pub fn should_collect(&self, aggressive: bool) -> bool {
        shm::compactor::should_run(&self.region, aggressive)
    }

    pub fn collect(&self) -> Result<()> {
        shm::compactor::collect(&self.region, self.role)
    }

    // -- persistence sink -------------------------------------------------

    pub fn sink_path(&self) -> Option<PathBuf> {
        self.region.sink_path().map(PathBuf::from)
    }

    pub fn set_sink_path(&self, path: &str) {
        self.region.set_sink_path(path)
    }

    pub fn save_sink(&self, conn: &rusqlite::Connection) -> Result<()> {
        sink::save(&self.region, self.role, conn)
    }
}

unsafe impl Send for Store {}
unsafe impl Sync for Store {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            global_size_b: 256,
            heap_size: 1 << 16,
            dep_table_pow: 6,
            hash_table_pow: 6,
            ..Config::default()
        }
    }

    #[test]
    fn master_init_then_worker_connect_see_the_same_data() {
        let _g = shm::region::lock_for_test();
        let (master, connector) = Store::init(&test_config()).unwrap();
        master.store_blob(b"shared").unwrap();

        let worker = Store::connect(&connector, true).unwrap();
        assert_eq!(worker.load_blob().unwrap(), b"shared");
        assert_eq!(worker.role(), Role::Worker);
    }

    #[test]
    fn worker_exits_cooperatively_once_flag_is_set() {
        let _g = shm::region::lock_for_test();
        let (master, connector) = Store::init(&test_config()).unwrap();
        let worker = Store::connect(&connector, true).unwrap();

        worker.add_dep(1, 1).unwrap();
        master.set_workers_should_exit(true).unwrap();

        assert!(matches!(worker.add_dep(1, 2), Err(ShmError::WorkerShouldExit)));

        master.set_workers_should_exit(false).unwrap();
        assert!(worker.add_dep(1, 2).is_ok());
    }
}
