//! Leaf-level dot-path diffs between two entity snapshots.

use serde_json::Value;

use crate::error::Result;
use crate::models::FieldChanges;
use crate::paths;

/// Minimal set of dot paths whose values differ between `old` and `new`.
///
/// Objects are walked recursively; arrays and scalars are compared as whole
/// values. Keys present in `old` but missing from `new` appear with `null`.
/// With no previous snapshot, or one that is not an object, every top-level
/// field of `new` is included.
pub fn calculate_delta(old: Option<&Value>, new: &Value) -> FieldChanges {
    let mut changes = FieldChanges::new();
    match old {
        Some(old) if old.is_object() => diff_into(&mut changes, None, old, new),
        _ => {
            if let Value::Object(map) = new {
                for (key, value) in map {
                    changes.insert(key.clone(), value.clone());
                }
            }
        }
    }
    changes
}

fn diff_into(changes: &mut FieldChanges, prefix: Option<&str>, old: &Value, new: &Value) {
    let join = |key: &str| match prefix {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    };

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) => diff_into(changes, Some(&join(key)), old_value, new_value),
                    None => {
                        changes.insert(join(key), new_value.clone());
                    }
                }
            }
            for key in old_map.keys().filter(|key| !new_map.contains_key(*key)) {
                changes.insert(join(key), Value::Null);
            }
        }
        _ if old == new => {}
        _ => {
            if let Some(prefix) = prefix {
                changes.insert(prefix.to_string(), new.clone());
            }
        }
    }
}

/// Apply `changes` to `document`. Paths are applied in sorted order, so a
/// parent value is written before its children.
pub fn apply_delta(document: &mut Value, changes: &FieldChanges) -> Result<()> {
    for (path, value) in changes {
        paths::set_path(document, path, value.clone())?;
    }
    Ok(())
}

/// Merge `newer` into `older`, last write per path wins. A path written in
/// `newer` supersedes any descendant path in `older`.
pub fn merge_changes(older: &mut FieldChanges, newer: &FieldChanges) {
    for (path, value) in newer {
        older.retain(|existing, _| !paths::is_ancestor(path, existing));
        older.insert(path.clone(), value.clone());
    }
}
