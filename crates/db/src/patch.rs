//! Field-path patches for documents.
//!
//! A patch touches exactly one dotted path.  `Set` replaces the value at the
//! path; `AddToSet` appends each value not already present in the array at
//! the path.  Patches on unrelated paths commute, so writers updating
//! different parts of one document never clobber each other.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DbError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum PatchOp {
    Set(Value),
    AddToSet(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    /// Dotted path, e.g. `layoutNodeMap.<nodeId>.status`.
    pub path: String,
    pub op: PatchOp,
}

impl FieldPatch {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            op: PatchOp::Set(value),
        }
    }

    pub fn add_to_set(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            path: path.into(),
            op: PatchOp::AddToSet(values),
        }
    }

    /// Apply to `doc`, creating intermediate objects as needed.
    pub fn apply(&self, doc: &mut Value) -> Result<(), DbError> {
        let invalid = |reason: &str| DbError::InvalidPatch {
            path: self.path.clone(),
            reason: reason.to_owned(),
        };

        let segments: Vec<&str> = self.path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| invalid("empty path"))?;

        let mut cursor = doc;
        for segment in parents {
            if cursor.is_null() {
                *cursor = Value::Object(Map::new());
            }
            cursor = cursor
                .as_object_mut()
                .ok_or_else(|| invalid("intermediate value is not an object"))?
                .entry((*segment).to_owned())
                .or_insert(Value::Null);
        }
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        let parent = cursor
            .as_object_mut()
            .ok_or_else(|| invalid("intermediate value is not an object"))?;

        match &self.op {
            PatchOp::Set(value) => {
                parent.insert((*last).to_owned(), value.clone());
            }
            PatchOp::AddToSet(values) => {
                let slot = parent
                    .entry((*last).to_owned())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if slot.is_null() {
                    *slot = Value::Array(Vec::new());
                }
                let array = slot
                    .as_array_mut()
                    .ok_or_else(|| invalid("addToSet target is not an array"))?;
                for value in values {
                    if !array.contains(value) {
                        array.push(value.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Apply every patch in order; on error `doc` is left untouched.
pub fn apply_all(doc: &mut Value, patches: &[FieldPatch]) -> Result<(), DbError> {
    let mut working = doc.clone();
    for patch in patches {
        patch.apply(&mut working)?;
    }
    *doc = working;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({});
        FieldPatch::set("layoutNodeMap.s1.status", json!("RUNNING"))
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc, json!({ "layoutNodeMap": { "s1": { "status": "RUNNING" } } }));
    }

    #[test]
    fn add_to_set_skips_duplicates() {
        let mut doc = json!({ "modules": ["ci"] });
        FieldPatch::add_to_set("modules", vec![json!("ci"), json!("cd")])
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["modules"], json!(["ci", "cd"]));
    }

    #[test]
    fn unrelated_patches_commute() {
        let a = vec![
            FieldPatch::set("layoutNodeMap.s1.status", json!("FAILED")),
            FieldPatch::add_to_set("layoutNodeMap.s1.failureTypes", vec![json!("APPLICATION_FAILURE")]),
        ];
        let b = vec![
            FieldPatch::set("layoutNodeMap.s2.status", json!("SUCCEEDED")),
            FieldPatch::add_to_set("modules", vec![json!("cd")]),
        ];

        let mut ab = json!({ "status": "RUNNING" });
        apply_all(&mut ab, &a).unwrap();
        apply_all(&mut ab, &b).unwrap();

        let mut ba = json!({ "status": "RUNNING" });
        apply_all(&mut ba, &b).unwrap();
        apply_all(&mut ba, &a).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab["status"], "RUNNING");
    }

    #[test]
    fn failing_batch_leaves_document_untouched() {
        let mut doc = json!({ "status": "RUNNING" });
        let patches = vec![
            FieldPatch::set("endTs", json!(1)),
            FieldPatch::set("status.nested", json!(true)),
        ];
        let err = apply_all(&mut doc, &patches).unwrap_err();
        assert!(matches!(err, DbError::InvalidPatch { .. }));
        assert_eq!(doc, json!({ "status": "RUNNING" }));
    }
}
