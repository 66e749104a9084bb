//! The traversal engine.
//!
//! A worklist-based reachability walk over a [`HeapSource`]. Seeds are
//! visited in a fixed order (modules sorted by name, frames topmost first,
//! then the built-in type objects); a visited set keyed on capture-time
//! identity guarantees each object is emitted exactly once; dense ids are
//! allocated in discovery order, so the same frozen heap always produces the
//! same snapshot.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::capture::heap::{HeapEntry, HeapSource, Shape};
use crate::capture::writer::SnapshotWriter;
use crate::capture::CaptureOptions;
use crate::error::Result;
use crate::types::{Addr, Classification, EdgeLabel, ObjectId};

/// Counters reported by a finished walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub objects: usize,
    pub references: usize,
    pub types: usize,
    pub threads: usize,
    pub skipped_roots: usize,
    pub shape_errors: usize,
}

pub(crate) struct Traversal<'a, S: HeapSource> {
    source: &'a S,
    writer: &'a mut SnapshotWriter,
    opts: &'a CaptureOptions,
    /// Identity-keyed visited set; using the address avoids invoking any
    /// object equality defined by the captured runtime.
    ids: HashMap<Addr, ObjectId>,
    unreadable: HashSet<Addr>,
    /// Keyed by (type object, classification): objects whose shape adapter
    /// failed are reclassified `other-builtin`, which must not bleed into
    /// the row their healthy siblings share.
    type_rows: HashMap<(Addr, Classification), i64>,
    queue: VecDeque<Addr>,
    stats: WalkStats,
}

impl<'a, S: HeapSource> Traversal<'a, S> {
    pub(crate) fn new(
        source: &'a S,
        writer: &'a mut SnapshotWriter,
        opts: &'a CaptureOptions,
    ) -> Self {
        Self {
            source,
            writer,
            opts,
            ids: HashMap::new(),
            unreadable: HashSet::new(),
            type_rows: HashMap::new(),
            queue: VecDeque::new(),
            stats: WalkStats::default(),
        }
    }

    /// Run the walk to completion and return the counters.
    pub(crate) fn run(mut self) -> Result<WalkStats> {
        for module in self.source.modules() {
            if self.ensure_id(module).is_none() {
                self.stats.skipped_roots += 1;
            }
        }
        let own = self.source.own_thread();
        for (thread_id, top_frame) in self.source.threads() {
            if !self.opts.include_own_frames && own == Some(thread_id) {
                continue;
            }
            match self.ensure_id(top_frame) {
                Some(frame_id) => {
                    self.writer.insert_thread(thread_id, frame_id)?;
                    self.stats.threads += 1;
                }
                None => self.stats.skipped_roots += 1,
            }
        }
        for type_obj in self.source.builtin_types() {
            if self.ensure_id(type_obj).is_none() {
                self.stats.skipped_roots += 1;
            }
        }

        while let Some(addr) = self.queue.pop_front() {
            self.process(addr)?;
        }
        Ok(self.stats)
    }

    /// Forward-declare an object: allocate its dense id and queue it.
    ///
    /// Splitting id creation from full processing is what lets cyclic and
    /// self-referential objects be recorded without recursion. Returns
    /// `None` for unreadable addresses; callers drop the edge.
    fn ensure_id(&mut self, addr: Addr) -> Option<ObjectId> {
        if let Some(&id) = self.ids.get(&addr) {
            return Some(id);
        }
        if self.unreadable.contains(&addr) {
            return None;
        }
        if self.source.entry(addr).is_none() {
            tracing::warn!(addr, "skipping unreadable object");
            self.unreadable.insert(addr);
            return None;
        }
        let id = self.ids.len() as ObjectId;
        self.ids.insert(addr, id);
        self.queue.push_back(addr);
        Some(id)
    }

    /// Register the `type` row for `type_addr`, creating the type's own node
    /// on the way. `classification` is the tag shared by its instances.
    fn ensure_type_row(
        &mut self,
        type_addr: Addr,
        classification: Classification,
    ) -> Result<Option<i64>> {
        if let Some(&tid) = self.type_rows.get(&(type_addr, classification)) {
            return Ok(Some(tid));
        }
        let Some(object_id) = self.ensure_id(type_addr) else {
            return Ok(None);
        };
        let name = match self.source.entry(type_addr) {
            Some(HeapEntry {
                shape: Some(Shape::Type { name, .. }),
                ..
            }) => name,
            Some(entry) => entry.preview.unwrap_or_else(|| "(anonymous)".to_string()),
            None => return Ok(None),
        };
        let tid = self.type_rows.len() as i64;
        self.type_rows.insert((type_addr, classification), tid);
        self.writer
            .insert_type(tid, object_id, &name, classification.as_str())?;
        self.stats.types += 1;
        Ok(Some(tid))
    }

    fn process(&mut self, addr: Addr) -> Result<()> {
        let id = match self.ids.get(&addr) {
            Some(&id) => id,
            None => return Ok(()),
        };
        let Some(entry) = self.source.entry(addr) else {
            return Ok(());
        };
        // A failed shape extraction demotes the object to other-builtin:
        // error flag set, no outbound edges, walk continues.
        let error = entry.shape.is_none();
        let classification = if error {
            Classification::OtherBuiltin
        } else {
            entry.classification
        };
        let Some(type_row) = self.ensure_type_row(entry.type_addr, classification)? else {
            tracing::error!(addr, "type object unreadable; object dropped from snapshot");
            return Ok(());
        };

        let preview = entry
            .preview
            .as_deref()
            .map(|p| self.truncated_preview(classification, p));
        self.writer.insert_object(
            id,
            addr,
            type_row,
            entry.size,
            entry.refcount,
            entry.len,
            preview.as_deref(),
            error,
        )?;
        self.stats.objects += 1;

        match entry.shape {
            Some(shape) => self.emit_edges(id, &shape)?,
            None => self.stats.shape_errors += 1,
        }
        Ok(())
    }

    fn truncated_preview(&self, classification: Classification, preview: &str) -> String {
        let cap = match classification {
            Classification::Str | Classification::Bytes => self.opts.max_string_preview,
            Classification::UserInstance => self.opts.max_instance_preview,
            _ => return preview.to_string(),
        };
        truncate_at_char_boundary(preview, cap).to_string()
    }

    // -- shape adapter --------------------------------------------------

    fn emit_edges(&mut self, src: ObjectId, shape: &Shape) -> Result<()> {
        match shape {
            Shape::Module { attrs, .. }
            | Shape::Function { attrs, .. }
            | Shape::Type { attrs, .. } => {
                for (name, dst) in attrs {
                    self.emit(src, EdgeLabel::Attr(name.clone()), *dst)?;
                }
            }
            Shape::Frame {
                locals,
                globals,
                back,
                code,
            } => {
                for (name, dst) in locals {
                    self.emit(src, EdgeLabel::Attr(format!("locals[{name:?}]")), *dst)?;
                }
                if let Some(globals) = globals {
                    self.emit(src, EdgeLabel::Opaque("f_globals".into()), *globals)?;
                }
                if let Some(back) = back {
                    self.emit(src, EdgeLabel::Opaque("f_back".into()), *back)?;
                }
                if let Some(code) = code {
                    self.emit(src, EdgeLabel::Opaque("f_code".into()), *code)?;
                }
            }
            Shape::Code { .. } | Shape::Scalar => {}
            Shape::Dict { entries } => {
                for (key, value) in entries {
                    // A tracked key object gets its own <key> edge in
                    // addition to the value edge.
                    let key_id = match key.addr {
                        Some(key_addr) => match self.ensure_id(key_addr) {
                            Some(key_id) => {
                                self.emit_to_id(src, EdgeLabel::KeySentinel, key_id)?;
                                Some(key_id)
                            }
                            None => None,
                        },
                        None => None,
                    };
                    let label = if key.repr.len() <= EdgeLabel::MAX_KEY_REPR {
                        EdgeLabel::Key(key.repr.clone())
                    } else if let Some(key_id) = key_id {
                        EdgeLabel::KeyRef(key_id)
                    } else {
                        EdgeLabel::Key(
                            truncate_at_char_boundary(&key.repr, EdgeLabel::MAX_KEY_REPR)
                                .to_string(),
                        )
                    };
                    self.emit(src, label, *value)?;
                }
            }
            Shape::Sequence { items } => {
                for (index, dst) in items.iter().enumerate() {
                    self.emit(src, EdgeLabel::Index(index as u64), *dst)?;
                }
            }
            Shape::Set { members } => {
                for dst in members {
                    self.emit(src, EdgeLabel::Member, *dst)?;
                }
            }
            Shape::Instance { attrs, dict, slots } => {
                for (name, dst) in attrs {
                    self.emit(src, EdgeLabel::Attr(name.clone()), *dst)?;
                }
                if let Some(dict) = dict {
                    self.emit(src, EdgeLabel::Attr("__dict__".into()), *dict)?;
                }
                for (name, dst) in slots {
                    self.emit(src, EdgeLabel::Attr(name.clone()), *dst)?;
                }
            }
            Shape::Opaque { referents } => {
                if self.opts.generic_referents {
                    for (token, dst) in referents {
                        self.emit(src, EdgeLabel::Opaque(token.clone()), *dst)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, src: ObjectId, label: EdgeLabel, dst: Addr) -> Result<()> {
        if let Some(dst_id) = self.ensure_id(dst) {
            self.emit_to_id(src, label, dst_id)?;
        }
        Ok(())
    }

    fn emit_to_id(&mut self, src: ObjectId, label: EdgeLabel, dst: ObjectId) -> Result<()> {
        self.writer.insert_reference(src, &label.encode(), dst)?;
        self.stats.references += 1;
        Ok(())
    }
}

fn truncate_at_char_boundary(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
