//! Error types for objex.
//!
//! One enum for the whole crate. Per-object shape-extraction failures are
//! deliberately *not* represented here: they are recorded on the object row
//! (`object.error`) during capture and never abort the walk.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ObjexError>;

#[derive(Debug, thiserror::Error)]
pub enum ObjexError {
    /// The snapshot artifact could not be created, copied, or opened.
    #[error("snapshot I/O: {0}")]
    SnapshotIo(String),

    /// The capture that produced this snapshot never ran to completion.
    /// The artifact is still readable via [`crate::query::QueryEngine::open_degraded`].
    #[error("snapshot at {} is incomplete (capture did not finish)", .0.display())]
    SnapshotIncomplete(PathBuf),

    /// The artifact's format or analysis version is not one this build understands.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A query referenced an object id that is not in the snapshot.
    #[error("no object with id {0}")]
    NodeNotFound(i64),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
