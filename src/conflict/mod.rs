//! Conflict detection, deterministic merging, and the resolution queue.

mod merge;
mod queue;

pub use merge::{apply_paths, changed_paths, merge_states, paths_overlap, MergeOutcome};
pub use queue::ConflictQueue;
