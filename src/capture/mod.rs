//! Capture layer — the heap facade, the traversal engine, and the streaming
//! snapshot writer.

pub mod heap;
pub mod walk;
pub mod writer;

use std::path::Path;

use crate::capture::heap::HeapSource;
use crate::capture::walk::{Traversal, WalkStats};
use crate::capture::writer::SnapshotWriter;
use crate::error::Result;

// ---------------------------------------------------------------------------
// CaptureOptions
// ---------------------------------------------------------------------------

/// Knobs for a single capture run.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Record the capturing thread's own frames. Off by default so the
    /// machinery taking the snapshot does not pollute it.
    pub include_own_frames: bool,
    /// Preview cap in bytes for string-like objects.
    pub max_string_preview: usize,
    /// Preview cap in bytes for user-class instances.
    pub max_instance_preview: usize,
    /// Follow the runtime's generic referent enumeration for objects no
    /// shape adapter covers. Costs extra edges; on by default.
    pub generic_referents: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            include_own_frames: false,
            max_string_preview: 256,
            max_instance_preview: 128,
            generic_referents: true,
        }
    }
}

// ---------------------------------------------------------------------------
// dump_graph
// ---------------------------------------------------------------------------

/// Capture `source` into a raw snapshot at `dest`.
///
/// The walk visits every object reachable from the source's roots exactly
/// once and streams it to disk as it goes. Returns only after the final
/// flush; per-object extraction failures are recorded in the artifact and do
/// not abort the capture, so the only error paths are I/O on `dest`.
///
/// The heap must be frozen for the duration of the call. The intended
/// deployment forks the target process and captures in the child.
pub fn dump_graph<S: HeapSource>(
    dest: &Path,
    source: &S,
    options: &CaptureOptions,
) -> Result<WalkStats> {
    let mut writer = SnapshotWriter::create(dest)?;
    let stats = Traversal::new(source, &mut writer, options).run()?;
    writer.finish()?;
    tracing::info!(
        objects = stats.objects,
        references = stats.references,
        types = stats.types,
        shape_errors = stats.shape_errors,
        "capture complete"
    );
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
