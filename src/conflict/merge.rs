//! Deterministic merge policy over dotted field paths.
//!
//! Two writes against the same base can merge when the sets of field
//! paths they changed are disjoint: the candidate's changes are applied
//! on top of the head state. Overlapping paths cannot be merged safely
//! and escalate to explicit resolution.

use crate::types::WorkflowState;
use serde_json::Value;
use std::collections::BTreeSet;

/// Result of attempting a merge.
#[derive(Debug)]
pub enum MergeOutcome {
    /// Disjoint changes; the merged state and the candidate's paths.
    Merged {
        state: WorkflowState,
        candidate_paths: Vec<String>,
    },
    /// The same paths were touched by both sides.
    Overlap(Vec<String>),
}

/// Dotted paths at which `next` differs from `base`.
///
/// Objects are compared recursively; any other value is a leaf. A field
/// added or removed counts as changed at its own path.
pub fn changed_paths(base: &WorkflowState, next: &WorkflowState) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    let base_obj: Value = Value::Object(to_object(base));
    let next_obj: Value = Value::Object(to_object(next));
    diff_value("", &base_obj, &next_obj, &mut paths);
    paths
}

fn to_object(state: &WorkflowState) -> serde_json::Map<String, Value> {
    state
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn diff_value(prefix: &str, base: &Value, next: &Value, out: &mut BTreeSet<String>) {
    match (base, next) {
        (Value::Object(b), Value::Object(n)) => {
            for (key, base_child) in b {
                let path = join(prefix, key);
                match n.get(key) {
                    Some(next_child) => diff_value(&path, base_child, next_child, out),
                    None => {
                        out.insert(path);
                    }
                }
            }
            for key in n.keys() {
                if !b.contains_key(key) {
                    out.insert(join(prefix, key));
                }
            }
        }
        _ => {
            if base != next && !prefix.is_empty() {
                out.insert(prefix.to_string());
            }
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Whether two path sets touch the same or nested fields.
///
/// `tasks` and `tasks.t1` overlap: one side replaced the container the
/// other side wrote into.
pub fn paths_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Vec<String> {
    let mut overlapping = Vec::new();
    for pa in a {
        for pb in b {
            if pa == pb || is_path_prefix(pa, pb) || is_path_prefix(pb, pa) {
                overlapping.push(if pa.len() <= pb.len() {
                    pa.clone()
                } else {
                    pb.clone()
                });
            }
        }
    }
    overlapping.sort();
    overlapping.dedup();
    overlapping
}

fn is_path_prefix(shorter: &str, longer: &str) -> bool {
    longer.len() > shorter.len()
        && longer.starts_with(shorter)
        && longer.as_bytes()[shorter.len()] == b'.'
}

/// Copy the values at `paths` from `source` into `target`.
///
/// A path absent in `source` is removed from `target` (the source side
/// deleted it).
pub fn apply_paths(target: &mut WorkflowState, source: &WorkflowState, paths: &BTreeSet<String>) {
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        match lookup(source, &segments) {
            Some(value) => set_path(target, &segments, value),
            None => remove_path(target, &segments),
        }
    }
}

fn lookup(state: &WorkflowState, segments: &[&str]) -> Option<Value> {
    let mut current = state.fields.get(segments[0])?;
    for seg in &segments[1..] {
        current = current.as_object()?.get(*seg)?;
    }
    Some(current.clone())
}

fn set_path(state: &mut WorkflowState, segments: &[&str], value: Value) {
    if segments.len() == 1 {
        state.fields.insert(segments[0].to_string(), value);
        return;
    }
    let root = state
        .fields
        .entry(segments[0].to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    let mut current = root;
    for seg in &segments[1..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(segments[segments.len() - 1].to_string(), value);
}

fn remove_path(state: &mut WorkflowState, segments: &[&str]) {
    if segments.len() == 1 {
        state.fields.remove(segments[0]);
        return;
    }
    let Some(mut current) = state.fields.get_mut(segments[0]) else {
        return;
    };
    for seg in &segments[1..segments.len() - 1] {
        match current.as_object_mut().and_then(|o| o.get_mut(*seg)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(segments[segments.len() - 1]);
    }
}

/// Attempt the deterministic merge of a candidate write against the head.
///
/// Both sides are diffed against the shared base. Disjoint changed paths
/// merge; overlapping paths escalate.
pub fn merge_states(
    base: &WorkflowState,
    head: &WorkflowState,
    candidate: &WorkflowState,
) -> MergeOutcome {
    let head_paths = changed_paths(base, head);
    let candidate_paths = changed_paths(base, candidate);

    let overlapping = paths_overlap(&head_paths, &candidate_paths);
    if !overlapping.is_empty() {
        return MergeOutcome::Overlap(overlapping);
    }

    let mut merged = head.clone();
    apply_paths(&mut merged, candidate, &candidate_paths);
    MergeOutcome::Merged {
        state: merged,
        candidate_paths: candidate_paths.into_iter().collect(),
    }
}
