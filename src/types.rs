//! Core domain types for objex.
//!
//! A snapshot is a quad of objects, types, references, and interned text.
//! Objects are identified by a dense integer id allocated in discovery order;
//! the 64-bit capture-time address is preserved alongside it but is opaque
//! outside the snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dense object id, the primary key of the `object` table.
pub type ObjectId = i64;

/// Capture-time identity of an object (its address in the source heap).
pub type Addr = u64;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// The closed set of kind tags a captured type can carry.
///
/// Classification lives on the *type* row; an object's classification is
/// reached through its type reference. `Module` and `Frame` form the root
/// set for retention queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Module,
    Frame,
    Function,
    Code,
    Type,
    Dict,
    List,
    Tuple,
    Set,
    #[serde(rename = "string")]
    Str,
    Bytes,
    Int,
    Float,
    OtherBuiltin,
    UserInstance,
}

impl Classification {
    /// String representation used in the `type.classification` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Frame => "frame",
            Self::Function => "function",
            Self::Code => "code",
            Self::Type => "type",
            Self::Dict => "dict",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Set => "set",
            Self::Str => "string",
            Self::Bytes => "bytes",
            Self::Int => "int",
            Self::Float => "float",
            Self::OtherBuiltin => "other-builtin",
            Self::UserInstance => "user-instance",
        }
    }

    /// Parse the column representation back into a tag.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "module" => Self::Module,
            "frame" => Self::Frame,
            "function" => Self::Function,
            "code" => Self::Code,
            "type" => Self::Type,
            "dict" => Self::Dict,
            "list" => Self::List,
            "tuple" => Self::Tuple,
            "set" => Self::Set,
            "string" => Self::Str,
            "bytes" => Self::Bytes,
            "int" => Self::Int,
            "float" => Self::Float,
            "other-builtin" => Self::OtherBuiltin,
            "user-instance" => Self::UserInstance,
            _ => return None,
        })
    }

    /// Whether objects of this classification seed retention reasoning.
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Module | Self::Frame)
    }

    /// Every member of the closed set, in declaration order.
    pub fn all() -> &'static [Classification] {
        &[
            Self::Module,
            Self::Frame,
            Self::Function,
            Self::Code,
            Self::Type,
            Self::Dict,
            Self::List,
            Self::Tuple,
            Self::Set,
            Self::Str,
            Self::Bytes,
            Self::Int,
            Self::Float,
            Self::OtherBuiltin,
            Self::UserInstance,
        ]
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EdgeLabel
// ---------------------------------------------------------------------------

/// The role a reference plays in its source object's shape.
///
/// Labels are persisted as text in `reference.ref` using a compact grammar:
/// `.name` for attributes and slots, `[repr]` for short mapping keys,
/// `@<id>` for a value edge whose key is the tracked object `<id>`, the
/// `<key>`/`<member>` sentinels, bare digits for sequence indices, and a bare
/// token for runtime-internal references (`f_back`, `__class__`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeLabel {
    /// Attribute or slot access: `obj.name`.
    Attr(String),
    /// Mapping entry whose key repr was short enough to store literally.
    Key(String),
    /// Mapping entry whose key is the tracked object with this id.
    KeyRef(ObjectId),
    /// Edge from a mapping to one of its own tracked key objects.
    KeySentinel,
    /// Positional element of a sequence.
    Index(u64),
    /// Unordered membership in a set.
    Member,
    /// Runtime-internal reference named by an opaque token.
    Opaque(String),
}

impl EdgeLabel {
    /// Longest mapping-key repr that is stored literally; anything longer
    /// falls back to the `@<id>` reference form.
    pub const MAX_KEY_REPR: usize = 64;

    /// Encode for the `reference.ref` column.
    ///
    /// Mapping-key reprs are bracket-delimited so an arbitrary repr can
    /// never masquerade as another label kind on the way back out.
    pub fn encode(&self) -> String {
        match self {
            Self::Attr(name) => format!(".{name}"),
            Self::Key(repr) => format!("[{repr}]"),
            Self::KeyRef(id) => format!("@{id}"),
            Self::KeySentinel => "<key>".to_string(),
            Self::Index(i) => i.to_string(),
            Self::Member => "<member>".to_string(),
            Self::Opaque(token) => token.clone(),
        }
    }

    /// Decode a `reference.ref` value.
    pub fn decode(s: &str) -> Self {
        if s == "<key>" {
            return Self::KeySentinel;
        }
        if s == "<member>" {
            return Self::Member;
        }
        if let Some(rest) = s.strip_prefix('@') {
            if let Ok(id) = rest.parse::<ObjectId>() {
                return Self::KeyRef(id);
            }
        }
        if let Some(rest) = s.strip_prefix('.') {
            return Self::Attr(rest.to_string());
        }
        if s.len() >= 2 && s.starts_with('[') && s.ends_with(']') {
            return Self::Key(s[1..s.len() - 1].to_string());
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(i) = s.parse::<u64>() {
                return Self::Index(i);
            }
        }
        Self::Opaque(s.to_string())
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attr(name) => write!(f, ".{name}"),
            Self::Key(repr) => write!(f, "[{repr}]"),
            Self::KeyRef(id) => write!(f, "[@{id}]"),
            Self::KeySentinel => f.write_str("<key>"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Member => f.write_str("<member>"),
            Self::Opaque(token) => f.write_str(token),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeSummary
// ---------------------------------------------------------------------------

/// The shape-independent digest of a node handed to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub id: ObjectId,
    pub classification: Classification,
    pub type_name: String,
    pub size: i64,
    pub refcount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub error: bool,
}

impl fmt::Display for NodeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}#{}>", self.type_name, self.id)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-classification slice of the summary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassStat {
    pub classification: String,
    pub objects: i64,
    pub bytes: i64,
}

/// Snapshot-wide statistics served by the query engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotStats {
    pub objects: i64,
    pub references: i64,
    pub types: i64,
    pub total_bytes: i64,
    pub roots: i64,
    pub by_classification: Vec<ClassStat>,
    pub hostname: String,
    pub captured_at: String,
    pub rss_mb: i64,
    pub complete: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_round_trips_through_column_text() {
        for c in Classification::all() {
            assert_eq!(Classification::parse(c.as_str()), Some(*c));
        }
    }

    #[test]
    fn classification_roots_are_module_and_frame() {
        let roots: Vec<_> = Classification::all()
            .iter()
            .filter(|c| c.is_root())
            .collect();
        assert_eq!(roots, vec![&Classification::Module, &Classification::Frame]);
    }

    #[test]
    fn classification_parse_rejects_unknown() {
        assert_eq!(Classification::parse("widget"), None);
        assert_eq!(Classification::parse(""), None);
    }

    #[test]
    fn edge_label_round_trips() {
        let labels = [
            EdgeLabel::Attr("x".into()),
            EdgeLabel::Attr("locals[\"t\"]".into()),
            EdgeLabel::Key("\"count\"".into()),
            EdgeLabel::Key("Key()".into()),
            EdgeLabel::Key("42".into()),
            EdgeLabel::KeyRef(42),
            EdgeLabel::KeySentinel,
            EdgeLabel::Index(0),
            EdgeLabel::Index(17),
            EdgeLabel::Member,
            EdgeLabel::Opaque("f_back".into()),
            EdgeLabel::Opaque("__class__".into()),
        ];
        for label in labels {
            assert_eq!(EdgeLabel::decode(&label.encode()), label);
        }
    }

    #[test]
    fn bracketing_keeps_key_reprs_apart_from_other_label_kinds() {
        // An int key's repr is all digits and an instance repr is a bare
        // token; the bracket delimiter keeps both distinct from sequence
        // indices and opaque tokens.
        assert_eq!(EdgeLabel::decode("[42]"), EdgeLabel::Key("42".into()));
        assert_eq!(EdgeLabel::decode("42"), EdgeLabel::Index(42));
        assert_eq!(EdgeLabel::decode("[Key()]"), EdgeLabel::Key("Key()".into()));
        assert_eq!(
            EdgeLabel::decode("Key()"),
            EdgeLabel::Opaque("Key()".into())
        );
        // A repr that itself contains brackets survives the trip.
        let nested = EdgeLabel::Key("('a', ['b'])".into());
        assert_eq!(EdgeLabel::decode(&nested.encode()), nested);
    }

    #[test]
    fn node_summary_display_is_typename_hash_id() {
        let summary = NodeSummary {
            id: 7,
            classification: Classification::Str,
            type_name: "str".into(),
            size: 54,
            refcount: 2,
            len: Some(5),
            preview: Some("hello".into()),
            error: false,
        };
        assert_eq!(summary.to_string(), "<str#7>");
    }
}
