//! Offline analysis pass.
//!
//! Turns a raw collection snapshot into a query-ready artifact: copies the
//! file, applies the query indices, materializes the root set and summary
//! statistics, patches in instance→type references, and bumps the analysis
//! version the query engine checks for. The input is never modified, and the
//! pass is deterministic: the same raw snapshot always yields the same
//! analysis artifact.

use std::path::Path;

use rusqlite::Connection;

use crate::db::schema::{ANALYSIS_INDICES, ANALYSIS_TABLES, ANALYSIS_VERSION, FORMAT_VERSION};
use crate::error::{ObjexError, Result};

/// Ensure every object has a `__class__` reference to its type's node.
///
/// The capture phase only records the references the shape adapters surface;
/// the instance→type edge is implied by `object.type_id` and is materialized
/// here so the explorer can follow it like any other reference.
const ADD_CLASS_REFERENCES: &str = "\
INSERT INTO reference (src, ref, dst)
SELECT o.id, '__class__', t.object
FROM object o JOIN type t ON t.id = o.type_id
WHERE NOT EXISTS (
    SELECT 1 FROM reference
    WHERE src = o.id AND dst = t.object AND ref = '__class__'
)";

const FILL_ROOTS: &str = "\
INSERT INTO root (object_id, classification)
SELECT o.id, t.classification
FROM object o JOIN type t ON t.id = o.type_id
WHERE t.classification IN ('module', 'frame')
ORDER BY o.id";

const FILL_SUMMARY: &str = "\
INSERT INTO summary (classification, objects, bytes)
SELECT t.classification, count(*), sum(o.size)
FROM object o JOIN type t ON t.id = o.type_id
GROUP BY t.classification
ORDER BY t.classification";

/// Build the analysis artifact at `analysis_path` from the raw snapshot at
/// `raw_path`.
///
/// Refuses to overwrite an existing artifact and rejects raw snapshots whose
/// format version this build does not understand. An incomplete snapshot
/// (aborted capture) is still analyzable; the completeness flag carries over
/// and the query engine surfaces it.
pub fn make_analysis_db(raw_path: &Path, analysis_path: &Path) -> Result<()> {
    if !raw_path.exists() {
        return Err(ObjexError::SnapshotIo(format!(
            "collection snapshot doesn't exist at {}",
            raw_path.display()
        )));
    }
    if analysis_path.exists() {
        return Err(ObjexError::SnapshotIo(format!(
            "analysis artifact already exists at {}",
            analysis_path.display()
        )));
    }
    std::fs::copy(raw_path, analysis_path)?;

    let conn = Connection::open(analysis_path)?;
    check_format_version(&conn)?;

    for ddl in ANALYSIS_INDICES {
        conn.execute_batch(ddl)?;
    }
    for ddl in ANALYSIS_TABLES {
        conn.execute_batch(ddl)?;
    }
    conn.execute(ADD_CLASS_REFERENCES, [])?;
    conn.execute(FILL_ROOTS, [])?;
    conn.execute(FILL_SUMMARY, [])?;
    conn.execute(
        "UPDATE meta SET analysis_version = ?1 WHERE id = 0",
        [ANALYSIS_VERSION],
    )?;

    let roots: i64 = conn.query_row("SELECT count(*) FROM root", [], |row| row.get(0))?;
    tracing::info!(
        analysis = %analysis_path.display(),
        roots,
        "analysis artifact ready"
    );
    Ok(())
}

fn check_format_version(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("SELECT format_version FROM meta WHERE id = 0", [], |row| {
            row.get(0)
        })
        .map_err(|_| {
            ObjexError::SchemaMismatch("artifact has no snapshot header".to_string())
        })?;
    if version != FORMAT_VERSION {
        return Err(ObjexError::SchemaMismatch(format!(
            "snapshot format version {version} (this build reads {FORMAT_VERSION})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
