//! Dot-delimited field paths over JSON documents.
//!
//! Paths such as `baseline.vitals.hba1c` address nested object fields.
//! Numeric segments index into existing arrays (`followups.0.visitDate`).
//! Every path entering the tracker or the pipeline is validated against an
//! [`EntitySchema`] first, so a typo cannot silently create a bogus subtree.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Maximum nesting depth accepted for a field path.
const MAX_PATH_DEPTH: usize = 16;

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*$").expect("valid segment regex"))
}

/// Split and syntactically validate a dot path.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.trim().is_empty() {
        return Err(Error::InvalidPath("path must not be empty".to_string()));
    }

    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() > MAX_PATH_DEPTH {
        return Err(Error::InvalidPath(format!(
            "{path}: nesting deeper than {MAX_PATH_DEPTH} levels"
        )));
    }
    if let Some(bad) = segments.iter().find(|segment| !segment_pattern().is_match(segment)) {
        return Err(Error::InvalidPath(format!("{path}: invalid segment {bad:?}")));
    }
    Ok(segments)
}

/// Resolve `path` inside `document`.
pub fn get_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

/// Set `value` at `path`, creating intermediate objects as needed.
///
/// Intermediate scalars are replaced by objects. Array segments must address
/// an existing element.
pub fn set_path(document: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = split_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(Error::InvalidPath(path.to_string()));
    };

    let mut current = document;
    for segment in parents {
        current = child_container(current, segment, path)?;
    }

    match current {
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index))
                .ok_or_else(|| Error::InvalidPath(format!("{path}: array index out of range")))?;
            *slot = value;
        }
        other => {
            if !other.is_object() {
                *other = Value::Object(Map::new());
            }
            if let Value::Object(map) = other {
                map.insert((*last).to_string(), value);
            }
        }
    }
    Ok(())
}

fn child_container<'a>(current: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value> {
    match current {
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get_mut(index))
            .ok_or_else(|| Error::InvalidPath(format!("{path}: array index out of range"))),
        Value::Object(map) => Ok(map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        other => {
            *other = Value::Object(Map::new());
            let Value::Object(map) = other else {
                return Err(Error::InvalidPath(path.to_string()));
            };
            Ok(map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())))
        }
    }
}

/// Whether `ancestor` is a strict path prefix of `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

/// Allowed top-level fields for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntitySchema {
    roots: Option<BTreeSet<String>>,
}

impl EntitySchema {
    /// Accept any syntactically valid path.
    pub const fn permissive() -> Self {
        Self { roots: None }
    }

    /// Accept only paths whose first segment is one of `roots`.
    pub fn with_roots<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roots: Some(roots.into_iter().map(Into::into).collect()),
        }
    }

    /// Consolidated patient record.
    pub fn patient() -> Self {
        Self::with_roots([
            "patientId",
            "doctorId",
            "patientInfo",
            "baseline",
            "followups",
            "status",
            "consent",
            "metadata",
        ])
    }

    pub fn validate(&self, path: &str) -> Result<()> {
        let segments = split_path(path)?;
        if let Some(roots) = &self.roots {
            if !roots.contains(segments[0]) {
                return Err(Error::InvalidPath(format!(
                    "{path}: unknown field {:?}",
                    segments[0]
                )));
            }
        }
        Ok(())
    }
}

/// Schemas keyed by entity type. Unknown types get the permissive schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// Registry preloaded with the clinical patient schema.
    pub fn clinical() -> Self {
        let mut registry = Self::default();
        registry.register("patient", EntitySchema::patient());
        registry
    }

    pub fn register(&mut self, entity_type: impl Into<String>, schema: EntitySchema) {
        self.schemas.insert(entity_type.into(), schema);
    }

    pub fn get(&self, entity_type: &str) -> EntitySchema {
        self.schemas
            .get(entity_type)
            .cloned()
            .unwrap_or_else(EntitySchema::permissive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn get_path_walks_objects_and_arrays() {
        let doc = json!({"baseline": {"hba1c": 7.2}, "followups": [{"visit": 1}]});
        assert_eq!(get_path(&doc, "baseline.hba1c"), Some(&json!(7.2)));
        assert_eq!(get_path(&doc, "followups.0.visit"), Some(&json!(1)));
        assert_eq!(get_path(&doc, "followups.3.visit"), None);
        assert_eq!(get_path(&doc, "baseline.missing"), None);
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut doc = json!({});
        set_path(&mut doc, "patientInfo.address.city", json!("Pune")).unwrap();
        assert_eq!(doc, json!({"patientInfo": {"address": {"city": "Pune"}}}));
    }

    #[test]
    fn set_path_replaces_scalar_parent() {
        let mut doc = json!({"baseline": 3});
        set_path(&mut doc, "baseline.weight", json!(71)).unwrap();
        assert_eq!(doc, json!({"baseline": {"weight": 71}}));
    }

    #[test]
    fn set_path_rejects_out_of_range_index() {
        let mut doc = json!({"followups": []});
        assert!(set_path(&mut doc, "followups.2", json!({})).is_err());
    }

    #[test]
    fn split_path_rejects_empty_segments() {
        assert!(split_path("baseline..hba1c").is_err());
        assert!(split_path("").is_err());
        assert!(split_path("baseline.hba1c").is_ok());
    }

    #[test]
    fn patient_schema_rejects_unknown_root() {
        let schema = EntitySchema::patient();
        assert!(schema.validate("baseline.hba1c").is_ok());
        assert!(schema.validate("basline.hba1c").is_err());
        assert!(EntitySchema::permissive().validate("basline.hba1c").is_ok());
    }

    #[test]
    fn is_ancestor_requires_segment_boundary() {
        assert!(is_ancestor("baseline", "baseline.hba1c"));
        assert!(!is_ancestor("base", "baseline.hba1c"));
        assert!(!is_ancestor("baseline", "baseline"));
    }

    #[test]
    fn registry_falls_back_to_permissive() {
        let registry = SchemaRegistry::clinical();
        assert_eq!(registry.get("baseline"), EntitySchema::permissive());
        assert_eq!(registry.get("patient"), EntitySchema::patient());
    }
}
