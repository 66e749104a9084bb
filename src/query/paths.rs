//! Retention-path search.
//!
//! Answers "which root-reachable chains retain this object?" with a
//! bidirectional breadth-first search: one frontier grows forward from the
//! root set over outbound references, the other grows backward from the
//! target over the reverse-edge index, and whichever frontier is smaller is
//! expanded next. Value edges carrying an `@<id>` key label are treated as
//! edges to the key object from both directions.
//!
//! The search visits at most a configurable number of nodes so pathological
//! fan-in (a `None`-like singleton with millions of inbound edges) degrades
//! to an explicit budget-exhausted result instead of an unbounded scan.

use std::collections::HashMap;
use std::fmt;

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::types::{EdgeLabel, ObjectId};

/// Default cap on total visited nodes per retention query.
pub const DEFAULT_VISIT_BUDGET: usize = 1_000_000;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One hop of a retention path: a node and the label of the edge leaving it
/// toward the next node on the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub node: ObjectId,
    pub label: EdgeLabel,
}

/// A chain of references from a root to the target.
///
/// `steps[0].node` is the root; following each step's label lands on the
/// next step's node and finally on `target`. A root that *is* the target
/// yields an empty step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPath {
    pub steps: Vec<PathStep>,
    pub target: ObjectId,
}

impl RetentionPath {
    pub fn root(&self) -> ObjectId {
        self.steps.first().map(|s| s.node).unwrap_or(self.target)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Label sequence used for deterministic ordering of equal-length paths.
    fn label_key(&self) -> String {
        let mut key = String::new();
        for step in &self.steps {
            key.push_str(&step.label.encode());
            key.push('\u{1}');
        }
        key
    }
}

impl fmt::Display for RetentionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.root())?;
        for step in &self.steps {
            write!(f, "{}", step.label)?;
        }
        write!(f, " -> #{}", self.target)
    }
}

/// How a retention query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// At least one retaining chain starts at a module.
    ModuleReachable,
    /// Retained, but only through live stack frames.
    FrameOnly,
    /// No root reaches the target; the object is garbage-in-waiting or held
    /// by something the capture could not see.
    NoRootReachable,
    /// The search hit its visit budget before finding an answer.
    BudgetExhausted,
}

/// Paths plus the termination classification the shell renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPaths {
    pub paths: Vec<RetentionPath>,
    pub termination: Termination,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Find up to `k` shortest retaining chains for `target`.
///
/// Module roots are searched first and win terminal selection; frame roots
/// are consulted only when no module retains the target.
pub(crate) fn paths_to_roots(
    conn: &Connection,
    target: ObjectId,
    k: usize,
    budget: usize,
) -> Result<RetentionPaths> {
    let module_roots = root_ids(conn, "module")?;
    let frame_roots = root_ids(conn, "frame")?;

    let from_modules = search(conn, &module_roots, target, budget)?;
    if !from_modules.paths.is_empty() {
        return Ok(RetentionPaths {
            paths: order_and_trim(from_modules.paths, k),
            termination: Termination::ModuleReachable,
        });
    }
    let from_frames = search(conn, &frame_roots, target, budget)?;
    if !from_frames.paths.is_empty() {
        return Ok(RetentionPaths {
            paths: order_and_trim(from_frames.paths, k),
            termination: Termination::FrameOnly,
        });
    }
    let termination = if from_modules.exhausted || from_frames.exhausted {
        Termination::BudgetExhausted
    } else {
        Termination::NoRootReachable
    };
    Ok(RetentionPaths {
        paths: Vec::new(),
        termination,
    })
}

fn root_ids(conn: &Connection, classification: &str) -> Result<Vec<ObjectId>> {
    let mut stmt = conn
        .prepare_cached("SELECT object_id FROM root WHERE classification = ?1 ORDER BY object_id")?;
    let ids = stmt
        .query_map(params![classification], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn order_and_trim(mut paths: Vec<RetentionPath>, k: usize) -> Vec<RetentionPath> {
    paths.sort_by(|a, b| {
        a.len()
            .cmp(&b.len())
            .then_with(|| a.label_key().cmp(&b.label_key()))
    });
    paths.dedup();
    paths.truncate(k);
    paths
}

// ---------------------------------------------------------------------------
// Bidirectional search
// ---------------------------------------------------------------------------

struct SearchOutcome {
    paths: Vec<RetentionPath>,
    exhausted: bool,
}

/// Pointer toward the other end of the search: the adjacent node and the
/// label of the edge between them, `None` at an endpoint.
type Link = Option<(ObjectId, EdgeLabel)>;

fn search(
    conn: &Connection,
    sources: &[ObjectId],
    target: ObjectId,
    budget: usize,
) -> Result<SearchOutcome> {
    let mut outcome = SearchOutcome {
        paths: Vec::new(),
        exhausted: false,
    };
    if sources.is_empty() {
        return Ok(outcome);
    }
    if sources.contains(&target) {
        outcome.paths.push(RetentionPath {
            steps: Vec::new(),
            target,
        });
        return Ok(outcome);
    }

    // parent pointer "toward" the sources / child pointer "toward" the target
    let mut src_parent: HashMap<ObjectId, Link> =
        sources.iter().map(|&id| (id, None)).collect();
    let mut dst_child: HashMap<ObjectId, Link> = HashMap::from([(target, None)]);
    let mut src_fringe: Vec<ObjectId> = sources.to_vec();
    let mut dst_fringe: Vec<ObjectId> = vec![target];

    loop {
        if src_parent.len() + dst_child.len() > budget {
            outcome.exhausted = true;
            return Ok(outcome);
        }
        if src_fringe.is_empty() || dst_fringe.is_empty() {
            return Ok(outcome); // dead end without a meeting point
        }

        let mut contacts: Vec<ObjectId> = Vec::new();
        if dst_fringe.len() < src_fringe.len() {
            let mut next = Vec::new();
            for node in std::mem::take(&mut dst_fringe) {
                for (parent, label) in parents_of(conn, node)? {
                    if dst_child.contains_key(&parent) {
                        continue;
                    }
                    dst_child.insert(parent, Some((node, label)));
                    if src_parent.contains_key(&parent) {
                        contacts.push(parent);
                    }
                    next.push(parent);
                }
            }
            dst_fringe = next;
        } else {
            let mut next = Vec::new();
            for node in std::mem::take(&mut src_fringe) {
                for (child, label) in children_of(conn, node)? {
                    if src_parent.contains_key(&child) {
                        continue;
                    }
                    src_parent.insert(child, Some((node, label)));
                    if dst_child.contains_key(&child) {
                        contacts.push(child);
                    }
                    next.push(child);
                }
            }
            src_fringe = next;
        }

        if !contacts.is_empty() {
            contacts.sort_unstable();
            contacts.dedup();
            for contact in contacts {
                outcome
                    .paths
                    .push(build_path(&src_parent, &dst_child, contact, target));
            }
            return Ok(outcome);
        }
    }
}

/// Nodes referring to `node`: plain reverse edges plus dicts whose value
/// edges name `node` as their key object.
fn parents_of(conn: &Connection, node: ObjectId) -> Result<Vec<(ObjectId, EdgeLabel)>> {
    let mut stmt = conn
        .prepare_cached("SELECT src, ref FROM reference WHERE dst = ?1 OR ref = ?2")?;
    let rows = stmt
        .query_map(params![node, format!("@{node}")], |row| {
            let src: ObjectId = row.get(0)?;
            let label: String = row.get(1)?;
            Ok((src, EdgeLabel::decode(&label)))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Nodes `node` refers to, including key objects named by `@<id>` labels.
fn children_of(conn: &Connection, node: ObjectId) -> Result<Vec<(ObjectId, EdgeLabel)>> {
    let mut stmt = conn.prepare_cached("SELECT dst, ref FROM reference WHERE src = ?1")?;
    let rows = stmt
        .query_map(params![node], |row| {
            let dst: ObjectId = row.get(0)?;
            let label: String = row.get(1)?;
            Ok((dst, label))
        })?
        .collect::<std::result::Result<Vec<(ObjectId, String)>, _>>()?;

    let mut children = Vec::with_capacity(rows.len());
    for (dst, raw) in rows {
        let label = EdgeLabel::decode(&raw);
        if let EdgeLabel::KeyRef(key_id) = label {
            children.push((key_id, EdgeLabel::KeyRef(key_id)));
        }
        children.push((dst, label));
    }
    Ok(children)
}

fn build_path(
    src_parent: &HashMap<ObjectId, Link>,
    dst_child: &HashMap<ObjectId, Link>,
    contact: ObjectId,
    target: ObjectId,
) -> RetentionPath {
    // Walk back toward the root, collecting (node, label-toward-contact).
    let mut head: Vec<PathStep> = Vec::new();
    let mut cur = contact;
    while let Some(Some((parent, label))) = src_parent.get(&cur) {
        head.push(PathStep {
            node: *parent,
            label: label.clone(),
        });
        cur = *parent;
    }
    head.reverse();

    // Walk forward from the contact toward the target.
    let mut cur = contact;
    while let Some(Some((child, label))) = dst_child.get(&cur) {
        head.push(PathStep {
            node: cur,
            label: label.clone(),
        });
        cur = *child;
    }
    RetentionPath {
        steps: head,
        target,
    }
}
