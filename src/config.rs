/// Caller-supplied sizing and observability parameters.
///
/// Mirrors the configuration surface in spec §6. Parsing this from a file
/// or environment is left to the embedding application; this crate only
/// defines the struct and sane defaults, the way a library crate should.
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes reserved for the global blob slot, length prefix included.
    pub global_size_b: usize,
    /// Bytes of variable-payload heap for the content table.
    pub heap_size: usize,
    /// `log2` of the dependency table's slot count.
    pub dep_table_pow: u8,
    /// `log2` of the content table's slot count.
    pub hash_table_pow: u8,
    /// Observability knob written into the region's globals at `init`.
    pub log_level: u32,
    /// Observability knob written into the region's globals at `init`.
    pub sample_rate: u32,
    /// Refuse to initialize if the backing directory has less free space
    /// than this, in bytes.
    pub minimum_avail: Option<u64>,
    /// Optional backing directory; `None` selects an anonymous in-RAM
    /// backend with no directory entry.
    pub shm_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            global_size_b: 1 << 16,
            heap_size: 1 << 30,
            dep_table_pow: 17,
            hash_table_pow: 18,
            log_level: 0,
            sample_rate: 0,
            minimum_avail: None,
            shm_dir: None,
        }
    }
}
