//! Read-only query engine over an analysis artifact.
//!
//! Stateless per call: an interactive shell layers cursors, history, and
//! marks on top. Concurrent readers are fine; no writer is ever active
//! against an analysis artifact.

pub mod paths;

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema::{ANALYSIS_VERSION, FORMAT_VERSION};
use crate::error::{ObjexError, Result};
use crate::query::paths::{RetentionPaths, DEFAULT_VISIT_BUDGET};
use crate::types::{
    ClassStat, Classification, EdgeLabel, NodeSummary, ObjectId, SnapshotStats,
};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// An outbound reference with its destination digest.
#[derive(Debug, Clone)]
pub struct OutboundEdge {
    pub label: EdgeLabel,
    pub dst: ObjectId,
    pub summary: NodeSummary,
}

/// An inbound reference with its source digest.
#[derive(Debug, Clone)]
pub struct InboundEdge {
    pub src: ObjectId,
    pub label: EdgeLabel,
    pub summary: NodeSummary,
}

/// Full lookup result: the node plus its edges.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub summary: NodeSummary,
    pub outbound: Vec<OutboundEdge>,
    pub inbound_count: i64,
}

/// One row of the per-type cost report.
#[derive(Debug, Clone)]
pub struct TypeCost {
    pub name: String,
    pub instances: i64,
    pub bytes: i64,
    /// Share of the snapshot's total accounted bytes.
    pub percent: f64,
}

// ---------------------------------------------------------------------------
// QueryEngine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct QueryEngine {
    conn: Connection,
    degraded: bool,
    visit_budget: usize,
}

impl QueryEngine {
    /// Open an analysis artifact.
    ///
    /// Rejects raw snapshots that never went through the analysis pass and
    /// refuses incomplete captures; use [`QueryEngine::open_degraded`] to
    /// explore those anyway.
    pub fn open(path: &Path) -> Result<Self> {
        let engine = Self::open_impl(path)?;
        if !engine.complete()? {
            return Err(ObjexError::SnapshotIncomplete(path.to_path_buf()));
        }
        Ok(engine)
    }

    /// Open an artifact even if its capture never finished. Reachability
    /// near the walk's abort point will be missing; queries still work.
    pub fn open_degraded(path: &Path) -> Result<Self> {
        let mut engine = Self::open_impl(path)?;
        if !engine.complete()? {
            tracing::warn!(
                artifact = %path.display(),
                "snapshot is incomplete; opening in degraded mode"
            );
            engine.degraded = true;
        }
        Ok(engine)
    }

    fn open_impl(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ObjexError::SnapshotIo(format!(
                "no artifact at {}",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        let header: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT format_version, analysis_version FROM meta WHERE id = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|_| ObjexError::SchemaMismatch("artifact has no snapshot header".into()))?;
        let Some((format_version, analysis_version)) = header else {
            return Err(ObjexError::SchemaMismatch(
                "artifact has no snapshot header".into(),
            ));
        };
        if format_version != FORMAT_VERSION {
            return Err(ObjexError::SchemaMismatch(format!(
                "snapshot format version {format_version} (this build reads {FORMAT_VERSION})"
            )));
        }
        match analysis_version {
            Some(ANALYSIS_VERSION) => {}
            Some(other) => {
                return Err(ObjexError::SchemaMismatch(format!(
                    "analysis version {other} (this build reads {ANALYSIS_VERSION})"
                )))
            }
            None => {
                return Err(ObjexError::SchemaMismatch(
                    "raw snapshot without indices — run `objex analyze <raw> <analysis>` first"
                        .into(),
                ))
            }
        }
        Ok(Self {
            conn,
            degraded: false,
            visit_budget: DEFAULT_VISIT_BUDGET,
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Override the retention search's visit budget.
    pub fn set_visit_budget(&mut self, budget: usize) {
        self.visit_budget = budget;
    }

    fn complete(&self) -> Result<bool> {
        let complete: i64 =
            self.conn
                .query_row("SELECT complete FROM meta WHERE id = 0", [], |row| {
                    row.get(0)
                })?;
        Ok(complete != 0)
    }

    // -- node queries ---------------------------------------------------

    /// Digest of one node.
    pub fn summary(&self, id: ObjectId) -> Result<NodeSummary> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT o.id, t.classification, t.name, o.size, o.refcount, o.len, o.preview, o.error \
             FROM object o JOIN type t ON t.id = o.type_id WHERE o.id = ?1",
        )?;
        stmt.query_row(params![id], row_to_summary)
            .optional()?
            .ok_or(ObjexError::NodeNotFound(id))
    }

    /// Node plus outbound edges and inbound fan-in.
    pub fn lookup(&self, id: ObjectId) -> Result<NodeRecord> {
        let summary = self.summary(id)?;
        let outbound = self.outbound(id)?;
        let inbound_count: i64 = self.conn.query_row(
            "SELECT count(*) FROM reference WHERE dst = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(NodeRecord {
            summary,
            outbound,
            inbound_count,
        })
    }

    /// Outbound references in capture order.
    pub fn outbound(&self, id: ObjectId) -> Result<Vec<OutboundEdge>> {
        self.summary(id)?; // NodeNotFound for unknown ids
        let mut stmt = self
            .conn
            .prepare_cached("SELECT ref, dst FROM reference WHERE src = ?1 ORDER BY rowid")?;
        let raw: Vec<(String, ObjectId)> = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        raw.into_iter()
            .map(|(label, dst)| {
                Ok(OutboundEdge {
                    label: EdgeLabel::decode(&label),
                    dst,
                    summary: self.summary(dst)?,
                })
            })
            .collect()
    }

    /// Inbound references, served from the reverse-edge index.
    pub fn inbound(&self, id: ObjectId) -> Result<Vec<InboundEdge>> {
        self.summary(id)?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT src, ref FROM reference WHERE dst = ?1 ORDER BY rowid")?;
        let raw: Vec<(ObjectId, String)> = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        raw.into_iter()
            .map(|(src, label)| {
                Ok(InboundEdge {
                    src,
                    label: EdgeLabel::decode(&label),
                    summary: self.summary(src)?,
                })
            })
            .collect()
    }

    /// A uniformly random non-root node, the usual entry into leak hunting.
    /// `None` when the snapshot holds nothing but roots.
    pub fn random(&self) -> Result<Option<ObjectId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM object \
                 WHERE id NOT IN (SELECT object_id FROM root) \
                 ORDER BY random() LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Retention query: up to `k` shortest label-paths from a root to `id`.
    pub fn paths_to_roots(&self, id: ObjectId, k: usize) -> Result<RetentionPaths> {
        self.summary(id)?;
        paths::paths_to_roots(&self.conn, id, k, self.visit_budget)
    }

    // -- snapshot-wide reports ------------------------------------------

    pub fn stats(&self) -> Result<SnapshotStats> {
        let (hostname, captured_at, rss_mb, complete): (String, String, i64, i64) =
            self.conn.query_row(
                "SELECT hostname, ts, rss_mb, complete FROM meta WHERE id = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let single = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        let by_classification = self
            .conn
            .prepare_cached(
                "SELECT classification, objects, bytes FROM summary ORDER BY classification",
            )?
            .query_map([], |row| {
                Ok(ClassStat {
                    classification: row.get(0)?,
                    objects: row.get(1)?,
                    bytes: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(SnapshotStats {
            objects: single("SELECT count(*) FROM object")?,
            references: single("SELECT count(*) FROM reference")?,
            types: single("SELECT count(*) FROM type")?,
            total_bytes: single("SELECT COALESCE(sum(size), 0) FROM object")?,
            roots: single("SELECT count(*) FROM root")?,
            by_classification,
            hostname,
            captured_at,
            rss_mb,
            complete: complete != 0,
        })
    }

    /// Most common types: `(instance count, type's node)` by fan-out.
    pub fn most_common_types(&self, limit: usize) -> Result<Vec<(i64, NodeSummary)>> {
        let rows: Vec<(i64, ObjectId)> = self
            .conn
            .prepare_cached(
                "SELECT count(*), t.object FROM object o JOIN type t ON t.id = o.type_id \
                 GROUP BY o.type_id ORDER BY count(*) DESC, t.object LIMIT ?1",
            )?
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(count, id)| Ok((count, self.summary(id)?)))
            .collect()
    }

    /// Largest objects by recorded size.
    pub fn largest_objects(&self, limit: usize) -> Result<Vec<NodeSummary>> {
        let ids: Vec<ObjectId> = self
            .conn
            .prepare_cached("SELECT id FROM object ORDER BY size DESC, id LIMIT ?1")?
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        ids.into_iter().map(|id| self.summary(id)).collect()
    }

    /// Most referenced objects: `(inbound count, node)`.
    pub fn most_referenced(&self, limit: usize) -> Result<Vec<(i64, NodeSummary)>> {
        let rows: Vec<(i64, ObjectId)> = self
            .conn
            .prepare_cached(
                "SELECT count(*), dst FROM reference \
                 GROUP BY dst ORDER BY count(*) DESC, dst LIMIT ?1",
            )?
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(count, id)| Ok((count, self.summary(id)?)))
            .collect()
    }

    /// Objects no reference points at, not even as a mapping key.
    pub fn orphans(&self, limit: usize) -> Result<Vec<ObjectId>> {
        let ids = self
            .conn
            .prepare_cached(
                "SELECT id FROM object \
                 WHERE id NOT IN (SELECT dst FROM reference) \
                   AND NOT EXISTS (
                       SELECT 1 FROM reference WHERE ref = '@' || CAST(object.id AS TEXT)
                   ) \
                 ORDER BY id LIMIT ?1",
            )?
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Per-type memory cost, heaviest first.
    pub fn cost_by_type(&self, limit: usize) -> Result<Vec<TypeCost>> {
        let total: i64 = self
            .conn
            .query_row("SELECT COALESCE(sum(size), 0) FROM object", [], |row| {
                row.get(0)
            })?;
        let rows = self
            .conn
            .prepare_cached(
                "SELECT t.name, count(*), sum(o.size) \
                 FROM object o JOIN type t ON t.id = o.type_id \
                 GROUP BY t.id ORDER BY sum(o.size) DESC, t.name LIMIT ?1",
            )?
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(name, instances, bytes)| TypeCost {
                name,
                instances,
                bytes,
                percent: if total > 0 {
                    100.0 * bytes as f64 / total as f64
                } else {
                    0.0
                },
            })
            .collect())
    }

    /// Resolve `module.name` to the object it is bound to.
    pub fn module_global(&self, module: &str, name: &str) -> Result<Option<ObjectId>> {
        let id = self
            .conn
            .query_row(
                "SELECT r.dst FROM reference r \
                 JOIN object o ON o.id = r.src \
                 JOIN type t ON t.id = o.type_id \
                 WHERE t.classification = 'module' AND o.preview = ?1 AND r.ref = '.' || ?2",
                params![module, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Reconstructed stacks, one per captured thread, frames oldest first.
    pub fn thread_stacks(&self) -> Result<Vec<(i64, Vec<ObjectId>)>> {
        let tops: Vec<(i64, ObjectId)> = self
            .conn
            .prepare_cached("SELECT thread_id, stack_obj_id FROM thread ORDER BY id")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        let mut stacks = Vec::with_capacity(tops.len());
        for (thread_id, top) in tops {
            let mut frames = vec![top];
            let mut cur = top;
            loop {
                let back: Option<ObjectId> = self
                    .conn
                    .query_row(
                        "SELECT dst FROM reference WHERE src = ?1 AND ref = 'f_back' LIMIT 1",
                        params![cur],
                        |row| row.get(0),
                    )
                    .optional()?;
                match back {
                    // cycle guard for malformed back chains
                    Some(prev) if !frames.contains(&prev) => {
                        frames.push(prev);
                        cur = prev;
                    }
                    _ => break,
                }
            }
            frames.reverse();
            stacks.push((thread_id, frames));
        }
        Ok(stacks)
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeSummary> {
    let classification: String = row.get(1)?;
    Ok(NodeSummary {
        id: row.get(0)?,
        classification: Classification::parse(&classification)
            .unwrap_or(Classification::OtherBuiltin),
        type_name: row.get(2)?,
        size: row.get(3)?,
        refcount: row.get(4)?,
        len: row.get(5)?,
        preview: row.get(6)?,
        error: row.get::<_, i64>(7)? != 0,
    })
}
