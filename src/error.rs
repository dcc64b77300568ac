/// Crate-wide error type.
///
/// Every kind here is fatal except [`ShmError::WorkerShouldExit`], which a
/// worker's supervisor is expected to catch and use to unwind the worker
/// cleanly. The store never retries internally.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to reserve {requested} bytes of shared memory: {source}")]
    OutOfSharedMemory {
        requested: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("no anonymous memfd backend available on this platform")]
    FailedAnonymousMemfdInit,

    #[error("backing directory {dir} has only {available} bytes free, need at least {minimum}")]
    LessThanMinimumAvailable {
        dir: PathBuf,
        available: u64,
        minimum: u64,
    },

    #[error("heap exhausted: requested allocation would exceed heap_max")]
    HeapFull,

    #[error("hash table full: no empty probe slot found before wrapping to the start")]
    HashTableFull,

    #[error("dependency table full: bindings set has reached its configured capacity")]
    DepTableFull,

    #[error("worker was asked to exit")]
    WorkerShouldExit,

    #[error("phase guard violated: {0}")]
    AssertionViolation(&'static str),

    #[error("busy-wait on WRITE_IN_PROGRESS exceeded the 60s watchdog for key hash {key_hash:#018x}")]
    WatchdogStuck { key_hash: u64 },

    #[error("persistence sink returned an unexpected value outside its contracted result set")]
    Unreachable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("persistence sink error: {0}")]
    Sink(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, ShmError>;
