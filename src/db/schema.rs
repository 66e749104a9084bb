//! SQLite schema for the snapshot artifact.
//!
//! The raw snapshot carries only the base tables, optimized for write
//! throughput during capture. The analysis pass (see [`crate::analysis`])
//! layers indices and derived tables on a copy, never on the original.

use rusqlite::Connection;

/// Format version written into `meta` by the capture writer.
pub const FORMAT_VERSION: i64 = 1;

/// Version written into `meta.analysis_version` once the offline pass has
/// run. The query engine refuses artifacts without it.
pub const ANALYSIS_VERSION: i64 = 2;

// ---------------------------------------------------------------------------
// DDL constants — kept as separate strings so each statement can be executed
// individually and failures point at a specific table.
// ---------------------------------------------------------------------------

const CREATE_META: &str = "\
CREATE TABLE IF NOT EXISTS meta (
  id INTEGER PRIMARY KEY,
  ts TEXT NOT NULL DEFAULT (datetime('now')),
  hostname TEXT NOT NULL,
  pid INTEGER NOT NULL,
  rss_mb INTEGER NOT NULL,
  duration_s REAL,
  format_version INTEGER NOT NULL,
  analysis_version INTEGER,
  complete INTEGER NOT NULL DEFAULT 0
)";

const CREATE_OBJECT: &str = "\
CREATE TABLE IF NOT EXISTS object (
  id INTEGER PRIMARY KEY,
  addr INTEGER NOT NULL,
  type_id INTEGER NOT NULL,
  size INTEGER NOT NULL,
  refcount INTEGER NOT NULL DEFAULT 0,
  len INTEGER,
  preview TEXT,
  error INTEGER NOT NULL DEFAULT 0
)";

const CREATE_TYPE: &str = "\
CREATE TABLE IF NOT EXISTS type (
  id INTEGER PRIMARY KEY,
  object INTEGER NOT NULL,
  name TEXT NOT NULL,
  classification TEXT NOT NULL
)";

const CREATE_REFERENCE: &str = "\
CREATE TABLE IF NOT EXISTS reference (
  src INTEGER NOT NULL,
  ref TEXT NOT NULL,
  dst INTEGER NOT NULL
)";

const CREATE_THREAD: &str = "\
CREATE TABLE IF NOT EXISTS thread (
  id INTEGER PRIMARY KEY,
  thread_id INTEGER NOT NULL,
  stack_obj_id INTEGER NOT NULL
)";

// Analysis phase ---------------------------------------------------------

/// Indices applied when switching from collection mode to analysis mode.
/// `idx_reference_dst` is the materialization of the reverse-edge index;
/// `idx_object_type` serves the type-to-members queries.
pub const ANALYSIS_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_object_type ON object(type_id)",
    "CREATE INDEX IF NOT EXISTS idx_object_size ON object(size)",
    "CREATE INDEX IF NOT EXISTS idx_type_object ON type(object)",
    "CREATE INDEX IF NOT EXISTS idx_type_name ON type(name)",
    "CREATE INDEX IF NOT EXISTS idx_reference_src ON reference(src)",
    "CREATE INDEX IF NOT EXISTS idx_reference_dst ON reference(dst)",
    "CREATE INDEX IF NOT EXISTS idx_reference_ref ON reference(ref)",
];

/// Derived tables materialized by the analysis pass.
pub const ANALYSIS_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS root (
  object_id INTEGER PRIMARY KEY,
  classification TEXT NOT NULL
)",
    "CREATE TABLE IF NOT EXISTS summary (
  classification TEXT PRIMARY KEY,
  objects INTEGER NOT NULL,
  bytes INTEGER NOT NULL
)",
];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open (or create) the SQLite database at `db_path` and apply the raw
/// snapshot schema.
///
/// The returned connection has WAL mode and synchronous NORMAL configured,
/// matching the write-heavy collection phase.
pub fn initialize_database(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute_batch(CREATE_META)?;
    conn.execute_batch(CREATE_OBJECT)?;
    conn.execute_batch(CREATE_TYPE)?;
    conn.execute_batch(CREATE_REFERENCE)?;
    conn.execute_batch(CREATE_THREAD)?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        initialize_database(":memory:").expect("schema creation should succeed on :memory:")
    }

    /// Helper: query sqlite_master for a given type and name.
    fn object_exists(conn: &Connection, obj_type: &str, obj_name: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
                rusqlite::params![obj_type, obj_name],
                |row| row.get(0),
            )
            .unwrap();
        count > 0
    }

    #[test]
    fn raw_tables_exist() {
        let conn = setup();
        for table in &["meta", "object", "type", "reference", "thread"] {
            assert!(
                object_exists(&conn, "table", table),
                "table '{table}' should exist"
            );
        }
    }

    #[test]
    fn raw_schema_has_no_indices() {
        // Collection mode is write-optimized; indices arrive with analysis.
        let conn = setup();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn analysis_ddl_applies_cleanly() {
        let conn = setup();
        for ddl in ANALYSIS_INDICES {
            conn.execute_batch(ddl).unwrap();
        }
        for ddl in ANALYSIS_TABLES {
            conn.execute_batch(ddl).unwrap();
        }
        assert!(object_exists(&conn, "index", "idx_reference_dst"));
        assert!(object_exists(&conn, "table", "root"));
        assert!(object_exists(&conn, "table", "summary"));
    }

    #[test]
    fn analysis_ddl_is_idempotent() {
        let conn = setup();
        for _ in 0..2 {
            for ddl in ANALYSIS_INDICES {
                conn.execute_batch(ddl).unwrap();
            }
            for ddl in ANALYSIS_TABLES {
                conn.execute_batch(ddl).unwrap();
            }
        }
    }

    #[test]
    fn object_table_has_expected_columns() {
        let conn = setup();
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(object)")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for col in &[
            "id", "addr", "type_id", "size", "refcount", "len", "preview", "error",
        ] {
            assert!(
                columns.contains(&col.to_string()),
                "object table should have column '{col}', found: {columns:?}"
            );
        }
    }

    #[test]
    fn optional_columns_default_to_null() {
        let conn = setup();
        conn.execute(
            "INSERT INTO object (id, addr, type_id, size) VALUES (0, 140001, 0, 48)",
            [],
        )
        .unwrap();

        let (len, preview): (Option<i64>, Option<String>) = conn
            .query_row("SELECT len, preview FROM object WHERE id = 0", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert!(len.is_none());
        assert!(preview.is_none());
    }

    #[test]
    fn meta_complete_defaults_to_zero() {
        let conn = setup();
        conn.execute(
            "INSERT INTO meta (id, hostname, pid, rss_mb, format_version) \
             VALUES (0, 'host', 1, 10, ?1)",
            [FORMAT_VERSION],
        )
        .unwrap();
        let complete: i64 = conn
            .query_row("SELECT complete FROM meta WHERE id = 0", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(complete, 0);
    }
}
