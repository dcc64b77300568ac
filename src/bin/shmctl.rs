/// Operator inspection tool for a running (or freshly created) region.
/// Not part of the library's public contract — a thin `clap` wrapper
/// around `shm_store::Store` for manual testing and debugging.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use shm_store::{Config, EntryKind, Store};

#[derive(Parser)]
#[command(name = "shmctl", about = "Inspect a shm-store region")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh region and print its connector as a one-line summary.
    Init {
        #[arg(long, default_value_t = 1 << 16)]
        global_size_b: usize,
        #[arg(long, default_value_t = 1 << 30)]
        heap_size: usize,
        #[arg(long, default_value_t = 17)]
        dep_table_pow: u8,
        #[arg(long, default_value_t = 18)]
        hash_table_pow: u8,
        #[arg(long)]
        shm_dir: Option<PathBuf>,
    },
    /// Print occupancy counters for a freshly-initialized region with the
    /// given sizing (a standalone smoke test; real inspection of a live
    /// region requires passing its connector out-of-band).
    Stats {
        #[arg(long, default_value_t = 1 << 16)]
        global_size_b: usize,
        #[arg(long, default_value_t = 1 << 30)]
        heap_size: usize,
        #[arg(long, default_value_t = 17)]
        dep_table_pow: u8,
        #[arg(long, default_value_t = 18)]
        hash_table_pow: u8,
    },
    /// Dump every dependency-table entry from a persisted sink file.
    DumpDeps {
        path: PathBuf,
        #[arg(long)]
        ignore_build_revision: bool,
        #[arg(long)]
        key: Option<u32>,
    },
    /// Run a compaction pass on a freshly-initialized region populated
    /// with throwaway data, demonstrating the effect of `collect`.
    Compact {
        #[arg(long, default_value_t = 1 << 16)]
        heap_size: usize,
        #[arg(long)]
        aggressive: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Init {
            global_size_b,
            heap_size,
            dep_table_pow,
            hash_table_pow,
            shm_dir,
        } => {
            let config = Config {
                global_size_b,
                heap_size,
                dep_table_pow,
                hash_table_pow,
                shm_dir,
                ..Config::default()
            };
            let (store, connector) = Store::init(&config)?;
            println!(
                "region initialized: fd={} heap_size={} dep_slots=2^{} hashtbl_slots=2^{} master_pid={}",
                connector.fd, connector.heap_size, connector.dep_table_pow, connector.hash_table_pow,
                store.master_pid()
            );
        }
        Command::Stats {
            global_size_b,
            heap_size,
            dep_table_pow,
            hash_table_pow,
        } => {
            let config = Config {
                global_size_b,
                heap_size,
                dep_table_pow,
                hash_table_pow,
                ..Config::default()
            };
            let (store, _connector) = Store::init(&config)?;
            println!("dep_used_slots={}", store.dep_used_slots());
            println!("dep_total_slots={}", store.dep_total_slots());
            println!("dep_entry_count={}", store.dep_entry_count());
        }
        Command::DumpDeps {
            path,
            ignore_build_revision,
            key,
        } => {
            let reader = shm_store::sink::load(&path, ignore_build_revision)?;
            match key {
                Some(k) => {
                    for v in reader.get_dep(k)? {
                        println!("{k} -> {v}");
                    }
                }
                None => {
                    eprintln!("pass --key to query a specific vertex; full-table scan is not exposed by the sink reader");
                }
            }
        }
        Command::Compact { heap_size, aggressive } => {
            let config = Config {
                heap_size,
                ..Config::default()
            };
            let (store, _connector) = Store::init(&config)?;
            for i in 0..16u64 {
                let mut hash = [0u8; 16];
                hash[..8].copy_from_slice(&i.to_le_bytes());
                store.add(&hash, format!("demo-{i}").as_bytes(), EntryKind::RawString)?;
            }
            store.set_allow_removes(true)?;
            for i in 0..8u64 {
                let mut hash = [0u8; 16];
                hash[..8].copy_from_slice(&i.to_le_bytes());
                store.remove(&hash)?;
            }
            let should_run = store.should_collect(aggressive);
            println!("should_collect({aggressive}) = {should_run}");
            store.collect()?;
            println!("collect complete");
        }
    }

    Ok(())
}
