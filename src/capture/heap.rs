//! The heap source facade.
//!
//! The traversal engine is coupled to the semantics of whatever runtime is
//! being captured — how frames expose locals, how mappings shadow their
//! backing storage, which references are visible only to the collector. That
//! coupling is isolated behind [`HeapSource`]: a read-only view of a frozen
//! heap that enumerates roots and describes one object at a time as a
//! [`HeapEntry`] with a tagged [`Shape`] per classification.
//!
//! [`MemHeap`] is the in-memory implementation shipped with the crate. It is
//! the fixture for the test suite and a building block for embedders that
//! want to snapshot object graphs of their own.

use std::collections::BTreeMap;

use crate::types::{Addr, Classification};

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// A mapping key as the source reports it: a display repr plus, when the key
/// is itself a tracked heap object, its address.
#[derive(Debug, Clone)]
pub struct KeyRepr {
    pub repr: String,
    pub addr: Option<Addr>,
}

impl KeyRepr {
    /// A plain string key: repr carries quotes, no tracked object.
    pub fn literal(repr: impl Into<String>) -> Self {
        Self {
            repr: repr.into(),
            addr: None,
        }
    }

    /// A key that is itself a tracked heap object.
    pub fn object(repr: impl Into<String>, addr: Addr) -> Self {
        Self {
            repr: repr.into(),
            addr: Some(addr),
        }
    }
}

/// Per-classification description of an object's outbound references.
///
/// Each variant mirrors what the runtime exposes for that kind of object;
/// the traversal engine turns it into labeled edges without knowing anything
/// about the runtime itself.
#[derive(Debug, Clone)]
pub enum Shape {
    /// A loaded module: name plus its global bindings.
    Module {
        name: String,
        attrs: Vec<(String, Addr)>,
    },
    /// A live stack frame.
    Frame {
        locals: Vec<(String, Addr)>,
        globals: Option<Addr>,
        back: Option<Addr>,
        code: Option<Addr>,
    },
    /// A function: well-known attributes (defaults, closure cells, module).
    Function {
        name: String,
        attrs: Vec<(String, Addr)>,
    },
    /// A code object.
    Code { name: String },
    /// A type object: name plus its well-known attribute set.
    Type {
        name: String,
        attrs: Vec<(String, Addr)>,
    },
    /// A mapping: one entry per key/value pair, in insertion order.
    Dict { entries: Vec<(KeyRepr, Addr)> },
    /// A positionally-indexed container (list or tuple).
    Sequence { items: Vec<Addr> },
    /// An unordered container.
    Set { members: Vec<Addr> },
    /// A leaf value with no outbound references (str, bytes, int, float).
    Scalar,
    /// A user-class instance: direct attributes, the backing dict node when
    /// the runtime keeps one, and slot values.
    Instance {
        attrs: Vec<(String, Addr)>,
        dict: Option<Addr>,
        slots: Vec<(String, Addr)>,
    },
    /// Anything else: the runtime's generic referent enumeration, each
    /// referent named by an opaque token.
    Opaque { referents: Vec<(String, Addr)> },
}

// ---------------------------------------------------------------------------
// HeapEntry
// ---------------------------------------------------------------------------

/// Everything the source knows about one object.
#[derive(Debug, Clone)]
pub struct HeapEntry {
    /// Address of this object's type object. Must itself be inspectable and
    /// carry a [`Shape::Type`] shape.
    pub type_addr: Addr,
    /// Classification shared by all instances of `type_addr`.
    pub classification: Classification,
    pub size: u64,
    pub refcount: u64,
    pub len: Option<u64>,
    /// Untruncated textual preview; the traversal applies the caps.
    pub preview: Option<String>,
    /// `None` means shape extraction failed: the object is recorded as
    /// `other-builtin` with an error flag and no outbound edges, and the
    /// walk continues.
    pub shape: Option<Shape>,
}

// ---------------------------------------------------------------------------
// HeapSource
// ---------------------------------------------------------------------------

/// Read-only view of a frozen heap.
///
/// The capture walk assumes stop-the-world semantics: nothing mutates the
/// heap between the first seed enumeration and the last `entry` call. The
/// intended deployment forks the target process and walks in the child; this
/// is a documented precondition, not something the facade can enforce.
pub trait HeapSource {
    /// Addresses of all loaded modules, sorted by module name.
    fn modules(&self) -> Vec<Addr>;

    /// `(thread id, topmost frame)` for every observable thread, in a stable
    /// order. Older frames are reached through the frames' back edges.
    fn threads(&self) -> Vec<(i64, Addr)>;

    /// The thread performing the capture, if the source can identify it.
    /// Skipped unless the capture options ask for it.
    fn own_thread(&self) -> Option<i64> {
        None
    }

    /// Type objects for the built-in classifications, seeded so that types
    /// without live instances still appear in the snapshot.
    fn builtin_types(&self) -> Vec<Addr>;

    /// Describe one object. `None` means the address is unreadable: an
    /// unreadable root is skipped with a warning, and no edge is emitted
    /// toward an unreadable referent.
    fn entry(&self, addr: Addr) -> Option<HeapEntry>;
}

// ---------------------------------------------------------------------------
// MemHeap
// ---------------------------------------------------------------------------

/// A buildable in-memory heap.
///
/// Addresses are allocated sequentially from an arbitrary base so they look
/// like the opaque 64-bit identities a real capture would produce. Refcounts
/// are maintained from in-graph fan-in: every link added through the builder
/// API bumps the destination's count.
pub struct MemHeap {
    objects: BTreeMap<Addr, HeapEntry>,
    modules: Vec<Addr>,
    threads: Vec<(i64, Addr)>,
    builtins: Vec<Addr>,
    unreadable: Vec<Addr>,
    own_thread: Option<i64>,
    next_addr: Addr,
}

const ADDR_BASE: Addr = 0x7f00_0000_1000;

impl MemHeap {
    /// Create a heap pre-seeded with one type object per built-in
    /// classification (the meta-type `type` is its own type, as in the
    /// runtimes this models).
    pub fn new() -> Self {
        let mut heap = Self {
            objects: BTreeMap::new(),
            modules: Vec::new(),
            threads: Vec::new(),
            builtins: Vec::new(),
            unreadable: Vec::new(),
            own_thread: None,
            next_addr: ADDR_BASE,
        };
        // The meta-type first: every other type object is an instance of it.
        let type_type = heap.alloc();
        heap.objects.insert(
            type_type,
            HeapEntry {
                type_addr: type_type,
                classification: Classification::Type,
                size: 408,
                refcount: 1,
                len: None,
                preview: Some("type".into()),
                shape: Some(Shape::Type {
                    name: "type".into(),
                    attrs: Vec::new(),
                }),
            },
        );
        heap.builtins.push(type_type);
        for c in Classification::all() {
            if *c == Classification::Type {
                continue;
            }
            let addr = heap.alloc();
            heap.objects.insert(
                addr,
                HeapEntry {
                    type_addr: type_type,
                    classification: Classification::Type,
                    size: 408,
                    refcount: 1,
                    len: None,
                    preview: Some(builtin_type_name(*c).into()),
                    shape: Some(Shape::Type {
                        name: builtin_type_name(*c).into(),
                        attrs: Vec::new(),
                    }),
                },
            );
            heap.builtins.push(addr);
        }
        heap
    }

    fn alloc(&mut self) -> Addr {
        let addr = self.next_addr;
        self.next_addr += 0x40;
        addr
    }

    /// The seeded type object for a built-in classification.
    pub fn type_of(&self, c: Classification) -> Addr {
        let idx = Classification::all()
            .iter()
            .position(|x| *x == c)
            .expect("classification is in the closed set");
        // `type` sits at index 0 of `builtins`; the rest follow declaration
        // order with Type skipped.
        if c == Classification::Type {
            return self.builtins[0];
        }
        let before_type = Classification::all()
            .iter()
            .take(idx)
            .filter(|x| **x != Classification::Type)
            .count();
        self.builtins[1 + before_type]
    }

    fn bump_refcount(&mut self, addr: Addr) {
        if let Some(entry) = self.objects.get_mut(&addr) {
            entry.refcount += 1;
        }
    }

    fn insert(&mut self, classification: Classification, size: u64, shape: Shape) -> Addr {
        let addr = self.alloc();
        let type_addr = self.type_of(classification);
        self.objects.insert(
            addr,
            HeapEntry {
                type_addr,
                classification,
                size,
                refcount: 1,
                len: None,
                preview: None,
                shape: Some(shape),
            },
        );
        addr
    }

    // -- builders -------------------------------------------------------

    pub fn add_module(&mut self, name: &str) -> Addr {
        let addr = self.insert(
            Classification::Module,
            72,
            Shape::Module {
                name: name.to_string(),
                attrs: Vec::new(),
            },
        );
        if let Some(e) = self.objects.get_mut(&addr) {
            e.preview = Some(name.to_string());
        }
        self.modules.push(addr);
        addr
    }

    pub fn add_str(&mut self, value: &str) -> Addr {
        let addr = self.insert(Classification::Str, 49 + value.len() as u64, Shape::Scalar);
        if let Some(e) = self.objects.get_mut(&addr) {
            e.len = Some(value.chars().count() as u64);
            e.preview = Some(value.to_string());
        }
        addr
    }

    pub fn add_int(&mut self, value: i64) -> Addr {
        let addr = self.insert(Classification::Int, 28, Shape::Scalar);
        if let Some(e) = self.objects.get_mut(&addr) {
            e.preview = Some(value.to_string());
        }
        addr
    }

    pub fn add_list(&mut self, items: Vec<Addr>) -> Addr {
        for item in &items {
            self.bump_refcount(*item);
        }
        let size = 56 + 8 * items.len() as u64;
        let len = items.len() as u64;
        let addr = self.insert(Classification::List, size, Shape::Sequence { items });
        if let Some(e) = self.objects.get_mut(&addr) {
            e.len = Some(len);
        }
        addr
    }

    pub fn add_tuple(&mut self, items: Vec<Addr>) -> Addr {
        for item in &items {
            self.bump_refcount(*item);
        }
        let size = 40 + 8 * items.len() as u64;
        let len = items.len() as u64;
        let addr = self.insert(Classification::Tuple, size, Shape::Sequence { items });
        if let Some(e) = self.objects.get_mut(&addr) {
            e.len = Some(len);
        }
        addr
    }

    pub fn add_set(&mut self, members: Vec<Addr>) -> Addr {
        for member in &members {
            self.bump_refcount(*member);
        }
        let len = members.len() as u64;
        let addr = self.insert(Classification::Set, 216, Shape::Set { members });
        if let Some(e) = self.objects.get_mut(&addr) {
            e.len = Some(len);
        }
        addr
    }

    pub fn add_dict(&mut self) -> Addr {
        let addr = self.insert(
            Classification::Dict,
            232,
            Shape::Dict {
                entries: Vec::new(),
            },
        );
        if let Some(e) = self.objects.get_mut(&addr) {
            e.len = Some(0);
        }
        addr
    }

    /// Insert a string-keyed entry.
    pub fn dict_insert(&mut self, dict: Addr, key: &str, value: Addr) {
        self.bump_refcount(value);
        self.dict_push(dict, KeyRepr::literal(format!("{key:?}")), value);
    }

    /// Insert an entry whose key is itself a tracked object.
    pub fn dict_insert_obj_key(&mut self, dict: Addr, key: Addr, value: Addr) {
        self.bump_refcount(key);
        self.bump_refcount(value);
        let repr = self
            .objects
            .get(&key)
            .and_then(|e| e.preview.clone())
            .unwrap_or_else(|| format!("<object 0x{key:x}>"));
        self.dict_push(dict, KeyRepr::object(repr, key), value);
    }

    fn dict_push(&mut self, dict: Addr, key: KeyRepr, value: Addr) {
        if let Some(entry) = self.objects.get_mut(&dict) {
            if let Some(Shape::Dict { entries }) = entry.shape.as_mut() {
                entries.push((key, value));
                entry.len = Some(entries.len() as u64);
            }
        }
    }

    /// Create a user-class type object.
    pub fn add_class(&mut self, name: &str) -> Addr {
        let meta = self.type_of(Classification::Type);
        let addr = self.alloc();
        self.objects.insert(
            addr,
            HeapEntry {
                type_addr: meta,
                classification: Classification::Type,
                size: 896,
                refcount: 1,
                len: None,
                preview: Some(name.to_string()),
                shape: Some(Shape::Type {
                    name: name.to_string(),
                    attrs: Vec::new(),
                }),
            },
        );
        addr
    }

    /// Create an instance of a class previously made with [`MemHeap::add_class`].
    pub fn add_instance(&mut self, class: Addr, preview: &str) -> Addr {
        self.bump_refcount(class);
        let addr = self.alloc();
        self.objects.insert(
            addr,
            HeapEntry {
                type_addr: class,
                classification: Classification::UserInstance,
                size: 56,
                refcount: 1,
                len: None,
                preview: Some(preview.to_string()),
                shape: Some(Shape::Instance {
                    attrs: Vec::new(),
                    dict: None,
                    slots: Vec::new(),
                }),
            },
        );
        addr
    }

    /// Bind an attribute on a module, type, function, or instance.
    pub fn set_attr(&mut self, obj: Addr, name: &str, value: Addr) {
        self.bump_refcount(value);
        if let Some(entry) = self.objects.get_mut(&obj) {
            match entry.shape.as_mut() {
                Some(Shape::Module { attrs, .. })
                | Some(Shape::Type { attrs, .. })
                | Some(Shape::Function { attrs, .. })
                | Some(Shape::Instance { attrs, .. }) => {
                    attrs.push((name.to_string(), value));
                }
                _ => {}
            }
        }
    }

    /// Declare a slot value on an instance.
    pub fn set_slot(&mut self, obj: Addr, name: &str, value: Addr) {
        self.bump_refcount(value);
        if let Some(entry) = self.objects.get_mut(&obj) {
            if let Some(Shape::Instance { slots, .. }) = entry.shape.as_mut() {
                slots.push((name.to_string(), value));
            }
        }
    }

    /// Attach a backing dict node to an instance.
    pub fn set_instance_dict(&mut self, obj: Addr, dict: Addr) {
        self.bump_refcount(dict);
        if let Some(entry) = self.objects.get_mut(&obj) {
            if let Some(Shape::Instance { dict: slot, .. }) = entry.shape.as_mut() {
                *slot = Some(dict);
            }
        }
    }

    pub fn add_code(&mut self, name: &str) -> Addr {
        let addr = self.insert(
            Classification::Code,
            144,
            Shape::Code {
                name: name.to_string(),
            },
        );
        if let Some(e) = self.objects.get_mut(&addr) {
            e.preview = Some(name.to_string());
        }
        addr
    }

    /// Create a function object; defaults, closure cells, and the module
    /// binding are attached with [`MemHeap::set_attr`].
    pub fn add_function(&mut self, name: &str, code: Option<Addr>) -> Addr {
        let mut attrs = Vec::new();
        if let Some(code) = code {
            self.bump_refcount(code);
            attrs.push(("__code__".to_string(), code));
        }
        let addr = self.insert(
            Classification::Function,
            136,
            Shape::Function {
                name: name.to_string(),
                attrs,
            },
        );
        if let Some(e) = self.objects.get_mut(&addr) {
            e.preview = Some(name.to_string());
        }
        addr
    }

    pub fn add_frame(&mut self, code_name: &str, back: Option<Addr>) -> Addr {
        if let Some(b) = back {
            self.bump_refcount(b);
        }
        let addr = self.insert(
            Classification::Frame,
            120,
            Shape::Frame {
                locals: Vec::new(),
                globals: None,
                back,
                code: None,
            },
        );
        if let Some(e) = self.objects.get_mut(&addr) {
            e.preview = Some(code_name.to_string());
        }
        addr
    }

    pub fn frame_local(&mut self, frame: Addr, name: &str, value: Addr) {
        self.bump_refcount(value);
        if let Some(entry) = self.objects.get_mut(&frame) {
            if let Some(Shape::Frame { locals, .. }) = entry.shape.as_mut() {
                locals.push((name.to_string(), value));
            }
        }
    }

    /// Attach the globals mapping and code object to a frame.
    pub fn frame_context(&mut self, frame: Addr, globals: Option<Addr>, code: Option<Addr>) {
        if let Some(g) = globals {
            self.bump_refcount(g);
        }
        if let Some(c) = code {
            self.bump_refcount(c);
        }
        if let Some(entry) = self.objects.get_mut(&frame) {
            if let Some(Shape::Frame {
                globals: g_slot,
                code: c_slot,
                ..
            }) = entry.shape.as_mut()
            {
                if globals.is_some() {
                    *g_slot = globals;
                }
                if code.is_some() {
                    *c_slot = code;
                }
            }
        }
    }

    pub fn add_thread(&mut self, thread_id: i64, top_frame: Addr) {
        self.bump_refcount(top_frame);
        self.threads.push((thread_id, top_frame));
    }

    pub fn set_own_thread(&mut self, thread_id: i64) {
        self.own_thread = Some(thread_id);
    }

    /// An object covered only by the generic referent enumeration.
    pub fn add_opaque(&mut self, type_name: &str, referents: Vec<(String, Addr)>) -> Addr {
        for (_, dst) in &referents {
            self.bump_refcount(*dst);
        }
        let addr = self.insert(Classification::OtherBuiltin, 64, Shape::Opaque { referents });
        if let Some(e) = self.objects.get_mut(&addr) {
            e.preview = Some(type_name.to_string());
        }
        addr
    }

    /// Simulate a shape-extraction failure for `addr`. The object keeps its
    /// metadata but loses its shape, and like any object the adapters cannot
    /// read it is reported as `other-builtin`.
    pub fn break_shape(&mut self, addr: Addr) {
        if let Some(entry) = self.objects.get_mut(&addr) {
            entry.shape = None;
            entry.classification = Classification::OtherBuiltin;
        }
    }

    /// Make `addr` entirely unreadable (the facade reports nothing for it).
    pub fn make_unreadable(&mut self, addr: Addr) {
        self.unreadable.push(addr);
    }
}

impl Default for MemHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapSource for MemHeap {
    fn modules(&self) -> Vec<Addr> {
        let mut mods = self.modules.clone();
        mods.sort_by_key(|addr| {
            self.objects
                .get(addr)
                .and_then(|e| match &e.shape {
                    Some(Shape::Module { name, .. }) => Some(name.clone()),
                    _ => None,
                })
                .unwrap_or_default()
        });
        mods
    }

    fn threads(&self) -> Vec<(i64, Addr)> {
        self.threads.clone()
    }

    fn own_thread(&self) -> Option<i64> {
        self.own_thread
    }

    fn builtin_types(&self) -> Vec<Addr> {
        self.builtins.clone()
    }

    fn entry(&self, addr: Addr) -> Option<HeapEntry> {
        if self.unreadable.contains(&addr) {
            return None;
        }
        self.objects.get(&addr).cloned()
    }
}

fn builtin_type_name(c: Classification) -> &'static str {
    match c {
        Classification::Module => "module",
        Classification::Frame => "frame",
        Classification::Function => "function",
        Classification::Code => "code",
        Classification::Type => "type",
        Classification::Dict => "dict",
        Classification::List => "list",
        Classification::Tuple => "tuple",
        Classification::Set => "set",
        Classification::Str => "str",
        Classification::Bytes => "bytes",
        Classification::Int => "int",
        Classification::Float => "float",
        Classification::OtherBuiltin => "object",
        Classification::UserInstance => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_are_seeded_and_self_typed() {
        let heap = MemHeap::new();
        let type_type = heap.type_of(Classification::Type);
        let entry = heap.entry(type_type).unwrap();
        assert_eq!(entry.type_addr, type_type, "the meta-type is its own type");
        assert_eq!(heap.builtin_types().len(), Classification::all().len());
    }

    #[test]
    fn type_of_maps_every_classification_to_a_distinct_type_object() {
        let heap = MemHeap::new();
        let mut seen = std::collections::HashSet::new();
        for c in Classification::all() {
            let addr = heap.type_of(*c);
            assert!(heap.entry(addr).is_some());
            // OtherBuiltin and UserInstance both fall back to "object" names
            // but still get distinct type objects.
            assert!(seen.insert(addr), "duplicate type object for {c}");
        }
    }

    #[test]
    fn modules_are_sorted_by_name() {
        let mut heap = MemHeap::new();
        heap.add_module("zlib");
        heap.add_module("abc");
        heap.add_module("io");
        let names: Vec<String> = heap
            .modules()
            .iter()
            .map(|m| match heap.entry(*m).unwrap().shape {
                Some(Shape::Module { name, .. }) => name,
                _ => panic!("module expected"),
            })
            .collect();
        assert_eq!(names, vec!["abc", "io", "zlib"]);
    }

    #[test]
    fn linking_bumps_destination_refcount() {
        let mut heap = MemHeap::new();
        let m = heap.add_module("m");
        let s = heap.add_str("hello");
        assert_eq!(heap.entry(s).unwrap().refcount, 1);
        heap.set_attr(m, "x", s);
        assert_eq!(heap.entry(s).unwrap().refcount, 2);
    }

    #[test]
    fn broken_shape_keeps_metadata_but_demotes_classification() {
        let mut heap = MemHeap::new();
        let d = heap.add_dict();
        heap.break_shape(d);
        let entry = heap.entry(d).unwrap();
        assert!(entry.shape.is_none());
        assert_eq!(entry.classification, Classification::OtherBuiltin);
        assert_eq!(entry.size, 232, "metadata survives the failure");
        assert_eq!(entry.len, Some(0));
    }

    #[test]
    fn unreadable_objects_disappear_from_the_facade() {
        let mut heap = MemHeap::new();
        let m = heap.add_module("ghost");
        heap.make_unreadable(m);
        assert!(heap.entry(m).is_none());
    }

    #[test]
    fn str_len_counts_chars_not_bytes() {
        let mut heap = MemHeap::new();
        let s = heap.add_str("héllo");
        assert_eq!(heap.entry(s).unwrap().len, Some(5));
    }
}
