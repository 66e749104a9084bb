//! Full capture → analyze → query round trips.
//!
//! Each test builds a heap with a known shape, captures it to a temporary
//! raw snapshot, runs the offline analysis pass, and asserts on what the
//! query engine reports.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use objex::analysis::make_analysis_db;
use objex::capture::heap::MemHeap;
use objex::capture::writer::SnapshotWriter;
use objex::capture::{dump_graph, CaptureOptions};
use objex::error::ObjexError;
use objex::query::paths::Termination;
use objex::query::QueryEngine;
use objex::types::{Classification, EdgeLabel};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Capture `heap`, analyze, and open the query engine.
fn snapshot(heap: &MemHeap) -> (TempDir, QueryEngine) {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.db");
    let analysis = dir.path().join("analysis.db");
    dump_graph(&raw, heap, &CaptureOptions::default()).unwrap();
    make_analysis_db(&raw, &analysis).unwrap();
    let engine = QueryEngine::open(&analysis).unwrap();
    (dir, engine)
}

/// Find the sole object with the given preview text.
fn id_by_preview(engine: &QueryEngine, preview: &str) -> i64 {
    let mut found = None;
    for id in 0..10_000 {
        match engine.summary(id) {
            Ok(s) if s.preview.as_deref() == Some(preview) => {
                assert!(found.is_none(), "preview {preview:?} is not unique");
                found = Some(id);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    found.unwrap_or_else(|| panic!("no object with preview {preview:?}"))
}

// ---------------------------------------------------------------------------
// Scenario: cycle with no external references
// ---------------------------------------------------------------------------

/// Hand-build a raw snapshot holding only a 3-cycle A→B→C→A, the way a
/// capture of an unreachable-but-recorded cycle would lay it out.
fn write_cycle_snapshot(path: &Path) -> (i64, i64, i64) {
    let mut writer = SnapshotWriter::create(path).unwrap();
    // The meta-type is its own type; "node" is an opaque builtin kind.
    writer.insert_type(0, 0, "type", "type").unwrap();
    writer.insert_type(1, 1, "node", "other-builtin").unwrap();
    writer.insert_object(0, 0x1000, 0, 408, 1, None, Some("type"), false).unwrap();
    writer.insert_object(1, 0x1040, 0, 408, 1, None, Some("node"), false).unwrap();
    let (a, b, c) = (2, 3, 4);
    for (id, addr) in [(a, 0x2000u64), (b, 0x2040), (c, 0x2080)] {
        writer.insert_object(id, addr, 1, 64, 1, None, None, false).unwrap();
    }
    writer.insert_reference(a, "<next>", b).unwrap();
    writer.insert_reference(b, "<next>", c).unwrap();
    writer.insert_reference(c, "<next>", a).unwrap();
    writer.finish().unwrap();
    (a, b, c)
}

#[test]
fn cycle_without_roots_reports_no_root_reachable() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.db");
    let analysis = dir.path().join("analysis.db");
    let (a, _b, c) = write_cycle_snapshot(&raw);
    make_analysis_db(&raw, &analysis).unwrap();
    let engine = QueryEngine::open(&analysis).unwrap();

    let result = engine.paths_to_roots(a, 5).unwrap();
    assert!(result.paths.is_empty());
    assert_eq!(result.termination, Termination::NoRootReachable);

    let inbound = engine.inbound(a).unwrap();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].src, c);
    assert_eq!(inbound[0].label, EdgeLabel::Opaque("<next>".into()));
}

#[test]
fn cycle_traversal_is_finite_in_both_directions() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.db");
    let analysis = dir.path().join("analysis.db");
    let (a, b, _c) = write_cycle_snapshot(&raw);
    make_analysis_db(&raw, &analysis).unwrap();
    let engine = QueryEngine::open(&analysis).unwrap();

    // outbound/inbound on every cycle member terminate and agree.
    let out = engine.outbound(a).unwrap();
    let forward: Vec<_> = out
        .iter()
        .filter(|e| e.label == EdgeLabel::Opaque("<next>".into()))
        .collect();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].dst, b);
}

// ---------------------------------------------------------------------------
// Scenario: module-retained leaf
// ---------------------------------------------------------------------------

#[test]
fn module_attribute_retention_is_found_with_its_label() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let s = heap.add_str("hello");
    heap.set_attr(m, "x", s);
    let (_dir, engine) = snapshot(&heap);

    let s_id = id_by_preview(&engine, "hello");
    let m_id = id_by_preview(&engine, "app");

    let result = engine.paths_to_roots(s_id, 1).unwrap();
    assert_eq!(result.termination, Termination::ModuleReachable);
    assert_eq!(result.paths.len(), 1);
    let path = &result.paths[0];
    assert_eq!(path.root(), m_id);
    assert_eq!(path.target, s_id);
    assert_eq!(path.steps.len(), 1);
    assert_eq!(path.steps[0].label, EdgeLabel::Attr("x".into()));

    let inbound = engine.inbound(s_id).unwrap();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].src, m_id);
    assert_eq!(inbound[0].label, EdgeLabel::Attr("x".into()));
}

// ---------------------------------------------------------------------------
// Scenario: frame-only retention
// ---------------------------------------------------------------------------

#[test]
fn frame_local_retention_is_classified_frame_only() {
    let mut heap = MemHeap::new();
    let cls = heap.add_class("Pending");
    let o = heap.add_instance(cls, "Pending()");
    let f = heap.add_frame("worker", None);
    heap.frame_local(f, "t", o);
    heap.add_thread(1, f);
    // A module exists but does not reference O.
    let m = heap.add_module("app");
    let unrelated = heap.add_str("unrelated");
    heap.set_attr(m, "s", unrelated);
    let (_dir, engine) = snapshot(&heap);

    let o_id = id_by_preview(&engine, "Pending()");
    let result = engine.paths_to_roots(o_id, 1).unwrap();
    assert_eq!(result.termination, Termination::FrameOnly);
    assert_eq!(result.paths.len(), 1);
    assert_eq!(
        result.paths[0].steps[0].label,
        EdgeLabel::Attr("locals[\"t\"]".into())
    );
}

// ---------------------------------------------------------------------------
// Scenario: fan-in singleton
// ---------------------------------------------------------------------------

#[test]
fn fan_in_singleton_completes_and_prefers_module_path() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let singleton = heap.add_opaque("none-analog", Vec::new());
    let mut holders = Vec::new();
    for _ in 0..10_000 {
        holders.push(heap.add_opaque("holder", vec![("o".to_string(), singleton)]));
    }
    let registry = heap.add_list(holders);
    heap.set_attr(m, "holders", registry);
    heap.set_attr(m, "n", singleton);
    // A frame also reaches the singleton; the module path must still win.
    let f = heap.add_frame("worker", None);
    heap.frame_local(f, "n", singleton);
    heap.add_thread(1, f);
    let (_dir, engine) = snapshot(&heap);

    let n_id = id_by_preview(&engine, "none-analog");
    let result = engine.paths_to_roots(n_id, 1).unwrap();
    assert_eq!(result.termination, Termination::ModuleReachable);
    assert_eq!(result.paths.len(), 1);
    assert_eq!(result.paths[0].steps.len(), 1, "direct module edge is shortest");
    assert_eq!(result.paths[0].steps[0].label, EdgeLabel::Attr("n".into()));
}

#[test]
fn tiny_budget_reports_exhaustion_instead_of_paths() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let a = heap.add_opaque("a", Vec::new());
    let b = heap.add_opaque("b", vec![("next".to_string(), a)]);
    let c = heap.add_opaque("c", vec![("next".to_string(), b)]);
    heap.set_attr(m, "chain", c);
    let (_dir, mut engine) = snapshot(&heap);
    engine.set_visit_budget(2);

    let a_id = id_by_preview(&engine, "a");
    let result = engine.paths_to_roots(a_id, 1).unwrap();
    assert!(result.paths.is_empty());
    assert_eq!(result.termination, Termination::BudgetExhausted);
}

// ---------------------------------------------------------------------------
// Scenario: dict with an object key
// ---------------------------------------------------------------------------

#[test]
fn dict_object_key_is_visible_on_both_edges() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let d = heap.add_dict();
    let cls = heap.add_class("Key");
    let k = heap.add_instance(cls, "Key()");
    let v = heap.add_str("value");
    heap.dict_insert_obj_key(d, k, v);
    heap.set_attr(m, "d", d);
    let (_dir, engine) = snapshot(&heap);

    let k_id = id_by_preview(&engine, "Key()");
    let v_id = id_by_preview(&engine, "value");
    let m_id = id_by_preview(&engine, "app");
    let d_id = engine
        .outbound(m_id)
        .unwrap()
        .into_iter()
        .find(|e| e.label == EdgeLabel::Attr("d".into()))
        .unwrap()
        .dst;

    let out = engine.outbound(d_id).unwrap();
    assert!(out
        .iter()
        .any(|e| e.label == EdgeLabel::KeySentinel && e.dst == k_id));
    assert!(out
        .iter()
        .any(|e| e.label == EdgeLabel::Key("Key()".into()) && e.dst == v_id));
}

// ---------------------------------------------------------------------------
// Scenario: random reachability
// ---------------------------------------------------------------------------

#[test]
fn random_samples_only_non_roots_and_each_is_classifiable() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let mut items = Vec::new();
    for i in 0..50 {
        items.push(heap.add_int(i));
    }
    let xs = heap.add_list(items);
    heap.set_attr(m, "xs", xs);
    let f = heap.add_frame("main", None);
    heap.add_thread(1, f);
    let (_dir, engine) = snapshot(&heap);

    let m_id = id_by_preview(&engine, "app");
    for _ in 0..1000 {
        let id = engine.random().unwrap().expect("non-root nodes exist");
        let summary = engine.summary(id).unwrap();
        assert!(
            !summary.classification.is_root(),
            "random() must never yield a root, got {summary}"
        );
        assert_ne!(id, m_id);
    }
    // Every sampled node is either reachable from some root or explicitly
    // reported as not; spot-check the full non-root population.
    for _ in 0..20 {
        let id = engine.random().unwrap().unwrap();
        let result = engine.paths_to_roots(id, 1).unwrap();
        match result.termination {
            Termination::ModuleReachable | Termination::FrameOnly => {
                assert!(!result.paths.is_empty())
            }
            Termination::NoRootReachable | Termination::BudgetExhausted => {
                assert!(result.paths.is_empty())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retention path ordering and k
// ---------------------------------------------------------------------------

#[test]
fn shortest_paths_win_and_ties_break_lexicographically() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let target = heap.add_str("target");
    // Two equal-length routes through distinct holders.
    let h1 = heap.add_list(vec![target]);
    let h2 = heap.add_list(vec![target]);
    heap.set_attr(m, "b", h2);
    heap.set_attr(m, "a", h1);
    let (_dir, engine) = snapshot(&heap);

    let t_id = id_by_preview(&engine, "target");
    let result = engine.paths_to_roots(t_id, 5).unwrap();
    assert_eq!(result.termination, Termination::ModuleReachable);
    assert_eq!(result.paths.len(), 2);
    // Equal length, so the label sequence decides: .a[0] before .b[0].
    assert_eq!(result.paths[0].len(), 2);
    assert_eq!(result.paths[1].len(), 2);
    assert_eq!(result.paths[0].steps[0].label, EdgeLabel::Attr("a".into()));
    assert_eq!(result.paths[1].steps[0].label, EdgeLabel::Attr("b".into()));
    assert_eq!(result.paths[0].steps[1].label, EdgeLabel::Index(0));

    let only_one = engine.paths_to_roots(t_id, 1).unwrap();
    assert_eq!(only_one.paths.len(), 1);
    assert_eq!(only_one.paths[0].steps[0].label, EdgeLabel::Attr("a".into()));
}

#[test]
fn path_to_a_root_itself_is_empty() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let s = heap.add_str("x");
    heap.set_attr(m, "s", s);
    let (_dir, engine) = snapshot(&heap);

    let m_id = id_by_preview(&engine, "app");
    let result = engine.paths_to_roots(m_id, 3).unwrap();
    assert_eq!(result.termination, Termination::ModuleReachable);
    assert_eq!(result.paths.len(), 1);
    assert!(result.paths[0].is_empty());
    assert_eq!(result.paths[0].root(), m_id);
}

// ---------------------------------------------------------------------------
// Artifact lifecycle
// ---------------------------------------------------------------------------

fn raw_snapshot(dir: &TempDir) -> PathBuf {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let s = heap.add_str("hello");
    heap.set_attr(m, "x", s);
    let raw = dir.path().join("raw.db");
    dump_graph(&raw, &heap, &CaptureOptions::default()).unwrap();
    raw
}

#[test]
fn query_engine_rejects_raw_snapshots_with_guidance() {
    let dir = TempDir::new().unwrap();
    let raw = raw_snapshot(&dir);
    let err = QueryEngine::open(&raw).unwrap_err();
    match err {
        ObjexError::SchemaMismatch(msg) => {
            assert!(msg.contains("objex analyze"), "diagnostic should name the fix: {msg}")
        }
        other => panic!("expected SchemaMismatch, got {other}"),
    }
}

#[test]
fn incomplete_capture_needs_degraded_open() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.db");
    {
        // Abort mid-capture: flushed rows but no finish().
        let mut writer = SnapshotWriter::create(&raw).unwrap();
        writer.insert_type(0, 0, "type", "type").unwrap();
        writer.insert_object(0, 0x1000, 0, 408, 1, None, None, false).unwrap();
        writer.flush().unwrap();
    }
    let analysis = dir.path().join("analysis.db");
    make_analysis_db(&raw, &analysis).unwrap();

    let err = QueryEngine::open(&analysis).unwrap_err();
    assert!(matches!(err, ObjexError::SnapshotIncomplete(_)));

    let engine = QueryEngine::open_degraded(&analysis).unwrap();
    assert!(engine.is_degraded());
    assert_eq!(engine.stats().unwrap().objects, 1);
}

#[test]
fn stats_cover_the_whole_snapshot() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let s = heap.add_str("hello");
    heap.set_attr(m, "x", s);
    let f = heap.add_frame("main", None);
    heap.add_thread(1, f);
    let (_dir, engine) = snapshot(&heap);

    let stats = engine.stats().unwrap();
    // Built-in type objects + module + string + frame.
    assert_eq!(
        stats.objects,
        Classification::all().len() as i64 + 3
    );
    assert_eq!(stats.roots, 2, "one module, one frame");
    assert!(stats.complete);
    assert!(stats.total_bytes > 0);
    let class_total: i64 = stats.by_classification.iter().map(|c| c.objects).sum();
    assert_eq!(class_total, stats.objects);
}

#[test]
fn lookup_reports_edges_and_fan_in() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let s = heap.add_str("hello");
    heap.set_attr(m, "x", s);
    let (_dir, engine) = snapshot(&heap);

    let s_id = id_by_preview(&engine, "hello");
    let record = engine.lookup(s_id).unwrap();
    assert_eq!(record.summary.classification, Classification::Str);
    assert_eq!(record.summary.to_string(), format!("<str#{s_id}>"));
    assert_eq!(record.inbound_count, 1);
    // The only outbound edge is the materialized instance→type reference.
    assert_eq!(record.outbound.len(), 1);
    assert_eq!(
        record.outbound[0].label,
        EdgeLabel::Opaque("__class__".into())
    );

    let missing = engine.lookup(999_999).unwrap_err();
    assert!(matches!(missing, ObjexError::NodeNotFound(999_999)));
}

// ---------------------------------------------------------------------------
// Supplemental reports
// ---------------------------------------------------------------------------

#[test]
fn module_global_resolves_bound_names() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app.config");
    let s = heap.add_str("sqlite://");
    heap.set_attr(m, "dsn", s);
    let (_dir, engine) = snapshot(&heap);

    let s_id = id_by_preview(&engine, "sqlite://");
    assert_eq!(engine.module_global("app.config", "dsn").unwrap(), Some(s_id));
    assert_eq!(engine.module_global("app.config", "nope").unwrap(), None);
    assert_eq!(engine.module_global("missing", "dsn").unwrap(), None);
}

#[test]
fn thread_stacks_follow_back_edges_oldest_first() {
    let mut heap = MemHeap::new();
    let outer = heap.add_frame("main", None);
    let middle = heap.add_frame("serve", Some(outer));
    let inner = heap.add_frame("handle", Some(middle));
    heap.add_thread(7, inner);
    let (_dir, engine) = snapshot(&heap);

    let stacks = engine.thread_stacks().unwrap();
    assert_eq!(stacks.len(), 1);
    let (thread_id, frames) = &stacks[0];
    assert_eq!(*thread_id, 7);
    assert_eq!(frames.len(), 3);
    let names: Vec<String> = frames
        .iter()
        .map(|id| engine.summary(*id).unwrap().preview.unwrap())
        .collect();
    assert_eq!(names, vec!["main", "serve", "handle"]);
}

#[test]
fn cost_by_type_orders_by_bytes_and_sums_to_total() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let big = heap.add_str(&"x".repeat(5000));
    heap.set_attr(m, "big", big);
    let (_dir, engine) = snapshot(&heap);

    let costs = engine.cost_by_type(50).unwrap();
    assert!(!costs.is_empty());
    for window in costs.windows(2) {
        assert!(window[0].bytes >= window[1].bytes);
    }
    let total: i64 = costs.iter().map(|c| c.bytes).sum();
    assert_eq!(total, engine.stats().unwrap().total_bytes);
}

#[test]
fn orphans_are_objects_nothing_references() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.db");
    let analysis = dir.path().join("analysis.db");
    let (a, _b, _c) = write_cycle_snapshot(&raw);
    make_analysis_db(&raw, &analysis).unwrap();
    let engine = QueryEngine::open(&analysis).unwrap();

    let orphans = engine.orphans(10).unwrap();
    // Cycle members retain each other, and every node (the meta-type
    // included, being its own type) receives a __class__ reference once the
    // analysis pass runs. Nothing here is an orphan.
    assert!(!orphans.contains(&a));
    assert!(orphans.is_empty());
}

#[test]
fn most_referenced_surfaces_fan_in_hubs() {
    let mut heap = MemHeap::new();
    let m = heap.add_module("app");
    let hub = heap.add_str("hub");
    let mut holders = Vec::new();
    for _ in 0..20 {
        holders.push(heap.add_list(vec![hub]));
    }
    let all = heap.add_list(holders);
    heap.set_attr(m, "all", all);
    let (_dir, engine) = snapshot(&heap);

    let hub_id = id_by_preview(&engine, "hub");
    let top = engine.most_referenced(5).unwrap();
    let hub_entry = top
        .iter()
        .find(|(_, summary)| summary.id == hub_id)
        .expect("hub should rank among the most referenced");
    assert_eq!(hub_entry.0, 20);
    // Counts are sorted descending.
    for window in top.windows(2) {
        assert!(window[0].0 >= window[1].0);
    }
}
