/// Optional external collaborator: mirrors the dependency table to a
/// relational file so it can survive process exit, and can serve
/// `get_dep` queries directly without an in-memory region at all.
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, ShmError};
use crate::guards::{self, Role};
use crate::shm::deptbl;
use crate::shm::region::Region;

/// `0xFACEFACEFACEB000` reinterpreted as a signed 64-bit integer, since
/// SQLite's native integer column type is signed.
pub const MAGIC: i64 = 0xFACE_FACE_FACE_B000u64 as i64;

/// Identifies the crate version that wrote a sink file. `load` can be told
/// to ignore a mismatch when reading files from an older build.
pub const BUILD_REVISION: &str = env!("CARGO_PKG_VERSION");

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS header (magic INTEGER NOT NULL, build_revision TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS deptable (key_vertex INTEGER NOT NULL PRIMARY KEY, value_vertex BLOB NOT NULL);";

fn encode_values(values: &[u32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_values(blob: &[u8]) -> Vec<u32> {
    blob.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Walk every deptbl entry and upsert it into `conn`. Master-only: the sink
/// is written during a quiescent phase, same as any other deptbl snapshot
/// operation.
pub fn save(region: &Region, role: Role, conn: &Connection) -> Result<()> {
    guards::require_master(role)?;

    conn.execute_batch(SCHEMA)?;
    conn.execute("DELETE FROM header", [])?;
    conn.execute(
        "INSERT INTO header (magic, build_revision) VALUES (?1, ?2)",
        params![MAGIC, BUILD_REVISION],
    )?;

    let mut entries = Vec::new();
    deptbl::for_each_entry(region, |key, values| entries.push((key, values)));

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO deptable (key_vertex, value_vertex) VALUES (?1, ?2)
             ON CONFLICT (key_vertex) DO UPDATE SET value_vertex = excluded.value_vertex",
        )?;
        for (key, values) in &entries {
            stmt.execute(params![*key as i64, encode_values(values)])?;
        }
    }
    tx.commit()?;

    tracing::info!(entries = entries.len(), "sink.save complete");
    Ok(())
}

/// A read-only handle onto a persisted sink file, queried directly rather
/// than loaded back into a region's deptbl.
pub struct SinkReader {
    conn: Connection,
}

pub fn load<P: AsRef<Path>>(path: P, ignore_build_revision: bool) -> Result<SinkReader> {
    let conn = Connection::open(path)?;
    let (magic, build_revision): (i64, String) = conn
        .query_row("SELECT magic, build_revision FROM header", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?
        .ok_or(ShmError::AssertionViolation("sink file has no header row"))?;

    if magic != MAGIC {
        return Err(ShmError::AssertionViolation("sink file magic does not match"));
    }
    if !ignore_build_revision && build_revision != BUILD_REVISION {
        return Err(ShmError::AssertionViolation(
            "sink file build revision does not match this binary",
        ));
    }

    tracing::info!("sink.load complete");
    Ok(SinkReader { conn })
}

impl SinkReader {
    /// Query the on-disk mirror directly, bypassing the in-memory deptbl.
    pub fn get_dep(&self, key: u32) -> Result<Vec<u32>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value_vertex FROM deptable WHERE key_vertex = ?1",
                params![key as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| decode_values(&b)).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shm::region::Region;

    #[test]
    fn save_then_load_round_trips_dependencies() {
        let _g = crate::shm::region::lock_for_test();
        let config = Config {
            global_size_b: 256,
            heap_size: 4096,
            dep_table_pow: 6,
            hash_table_pow: 6,
            ..Config::default()
        };
        let (region, _connector) = Region::init(&config).unwrap();
        deptbl::add_dep(&region, 1, 2).unwrap();
        deptbl::add_dep(&region, 1, 3).unwrap();
        deptbl::add_dep(&region, 9, 9).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sqlite");
        let conn = Connection::open(&path).unwrap();
        save(&region, Role::Master, &conn).unwrap();
        drop(conn);

        let reader = load(&path, false).unwrap();
        let mut values = reader.get_dep(1).unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![2, 3]);
        assert_eq!(reader.get_dep(9).unwrap(), vec![9]);
        assert!(reader.get_dep(404).unwrap().is_empty());
    }

    #[test]
    fn save_rejects_worker_role() {
        let _g = crate::shm::region::lock_for_test();
        let config = Config {
            global_size_b: 256,
            heap_size: 4096,
            dep_table_pow: 6,
            hash_table_pow: 6,
            ..Config::default()
        };
        let (region, _connector) = Region::init(&config).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            save(&region, Role::Worker, &conn),
            Err(ShmError::AssertionViolation(_))
        ));
    }
}
