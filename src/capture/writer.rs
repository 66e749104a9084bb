//! Streaming snapshot sink.
//!
//! Accepts records in whatever order the traversal discovers them and lands
//! them in the raw artifact in fixed-size batches. Every batch is its own
//! transaction, so an aborted capture leaves a valid (if incomplete)
//! database behind; only `finish` sets the completeness flag in the header.

use std::path::Path;
use std::time::Instant;

use rusqlite::{params, Connection};

use crate::db::schema::{initialize_database, FORMAT_VERSION};
use crate::error::{ObjexError, Result};
use crate::types::{Addr, ObjectId};

/// Rows buffered before the current transaction is committed.
const BATCH_SIZE: usize = 512;

#[derive(Debug)]
pub struct SnapshotWriter {
    conn: Connection,
    pending: usize,
    in_tx: bool,
    started: Instant,
}

impl SnapshotWriter {
    /// Create the artifact at `path`, which must not already exist, and
    /// write the header row.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(ObjexError::SnapshotIo(format!(
                "snapshot already exists at {}",
                path.display()
            )));
        }
        let path_str = path.to_str().ok_or_else(|| {
            ObjexError::SnapshotIo(format!("non-UTF-8 snapshot path {}", path.display()))
        })?;
        let conn = initialize_database(path_str)?;
        conn.execute(
            "INSERT INTO meta (id, hostname, pid, rss_mb, format_version) \
             VALUES (0, ?1, ?2, ?3, ?4)",
            params![hostname(), std::process::id(), rss_mb(), FORMAT_VERSION],
        )?;
        Ok(Self {
            conn,
            pending: 0,
            in_tx: false,
            started: Instant::now(),
        })
    }

    fn record_written(&mut self) -> Result<()> {
        self.pending += 1;
        if self.pending >= BATCH_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn begin_if_needed(&mut self) -> Result<()> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN")?;
            self.in_tx = true;
        }
        Ok(())
    }

    /// Commit the open batch. Safe to call at any point; records written so
    /// far become durable even if the capture later aborts.
    pub fn flush(&mut self) -> Result<()> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
        }
        self.pending = 0;
        Ok(())
    }

    pub fn insert_object(
        &mut self,
        id: ObjectId,
        addr: Addr,
        type_id: i64,
        size: u64,
        refcount: u64,
        len: Option<u64>,
        preview: Option<&str>,
        error: bool,
    ) -> Result<()> {
        self.begin_if_needed()?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO object (id, addr, type_id, size, refcount, len, preview, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.execute(params![
            id,
            addr as i64,
            type_id,
            size as i64,
            refcount as i64,
            len.map(|l| l as i64),
            preview,
            error as i64,
        ])?;
        drop(stmt);
        self.record_written()
    }

    pub fn insert_type(
        &mut self,
        id: i64,
        object: ObjectId,
        name: &str,
        classification: &str,
    ) -> Result<()> {
        self.begin_if_needed()?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO type (id, object, name, classification) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![id, object, name, classification])?;
        drop(stmt);
        self.record_written()
    }

    pub fn insert_reference(&mut self, src: ObjectId, label: &str, dst: ObjectId) -> Result<()> {
        self.begin_if_needed()?;
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO reference (src, ref, dst) VALUES (?1, ?2, ?3)")?;
        stmt.execute(params![src, label, dst])?;
        drop(stmt);
        self.record_written()
    }

    pub fn insert_thread(&mut self, thread_id: i64, stack_obj_id: ObjectId) -> Result<()> {
        self.begin_if_needed()?;
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO thread (thread_id, stack_obj_id) VALUES (?1, ?2)")?;
        stmt.execute(params![thread_id, stack_obj_id])?;
        drop(stmt);
        self.record_written()
    }

    /// Flush the tail batch, stamp the duration, and mark the snapshot
    /// complete. A writer that is dropped without `finish` leaves the
    /// completeness flag unset.
    pub fn finish(mut self) -> Result<()> {
        self.flush()?;
        self.conn.execute(
            "UPDATE meta SET duration_s = ?1, complete = 1 WHERE id = 0",
            params![self.started.elapsed().as_secs_f64()],
        )?;
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Resident set size of this process in MiB, 0 where unavailable.
fn rss_mb() -> i64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = pages.parse::<i64>() {
                    return pages * 4096 / (1024 * 1024);
                }
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
