//! Blackboard path evaluation and patch application.
//!
//! Paths are dotted strings optionally prefixed by `$` or `$.`; both mean
//! root. The dialect is deliberately small: no bracket syntax, no wildcards,
//! no filters. Traversal through a non-object yields the undefined sentinel
//! (`None`), never an error.

use serde_json::{Map, Value};

use crate::definition::{Patch, PropValue};

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    trimmed.split('.').filter(|segment| !segment.is_empty())
}

/// Resolve a dotted path. `None` is the undefined sentinel.
pub fn resolve<'a>(blackboard: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = blackboard;
    for segment in path_segments(path) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub(crate) fn as_object_mut_forced(value: &mut Value) -> &mut Map<String, Value> {
    if !matches!(value, Value::Object(_)) {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Write `value` at `path`, creating intermediate objects as needed.
/// Non-object intermediates are replaced.
pub fn set(blackboard: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path_segments(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        // A root-level set only makes sense for an object document.
        if value.is_object() {
            *blackboard = value;
        }
        return;
    };
    let mut current = blackboard;
    for segment in parents {
        current = as_object_mut_forced(current)
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object_mut_forced(current).insert((*last).to_string(), value);
}

/// Remove the value at `path`. Missing intermediates are a silent no-op.
pub fn del(blackboard: &mut Value, path: &str) {
    let segments: Vec<&str> = path_segments(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = blackboard;
    for segment in parents {
        let Some(next) = current
            .as_object_mut()
            .and_then(|map| map.get_mut(*segment))
        else {
            return;
        };
        current = next;
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(*last);
    }
}

/// Shallow-merge `value` into the object at `path`. A non-object existing
/// value (or a missing one) is replaced with the new object.
pub fn merge(blackboard: &mut Value, path: &str, value: &Map<String, Value>) {
    let segments: Vec<&str> = path_segments(path).collect();
    let mut current = blackboard;
    for segment in &segments {
        current = as_object_mut_forced(current)
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match current {
        Value::Object(existing) => {
            for (key, entry) in value {
                existing.insert(key.clone(), entry.clone());
            }
        }
        other => *other = Value::Object(value.clone()),
    }
}

/// Apply patches in order. Pure in the sense that the result depends only on
/// the starting blackboard and the patch sequence.
pub fn apply_patches(blackboard: &mut Value, patches: &[Patch]) {
    for patch in patches {
        match patch {
            Patch::Set { path, value } => set(blackboard, path, value.clone()),
            Patch::Merge { path, value } => merge(blackboard, path, value),
            Patch::Del { path } => del(blackboard, path),
        }
    }
}

fn as_embedded_reference(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.get("__ref").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    map.get("path").and_then(Value::as_str)
}

/// Recursively replace embedded `{"__ref": true, "path": ...}` markers with
/// the referenced blackboard values. Unresolvable references become null.
pub fn resolve_value(value: &Value, blackboard: &Value) -> Value {
    if let Some(path) = as_embedded_reference(value) {
        return resolve(blackboard, path).cloned().unwrap_or(Value::Null);
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, blackboard))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, entry)| (key.clone(), resolve_value(entry, blackboard)))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl PropValue {
    /// Resolve this prop against a blackboard, yielding a concrete JSON value.
    pub fn resolve(&self, blackboard: &Value) -> Value {
        match self {
            PropValue::Reference(reference) => resolve(blackboard, &reference.path)
                .cloned()
                .unwrap_or(Value::Null),
            PropValue::Literal(value) => resolve_value(value, blackboard),
        }
    }
}
