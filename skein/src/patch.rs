//! RFC-6902 JSON Patch records used by state and activity deltas.
//!
//! Operation names are serialized verbatim (`add`, `remove`, `replace`,
//! `move`, `copy`, `test`) and paths are JSON Pointers. Deltas emitted on
//! the event stream must be applicable against the most recent snapshot of
//! the same logical object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// An RFC-6902 patch operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Add a value at the path, inserting into arrays and objects.
    Add,
    /// Remove the value at the path.
    Remove,
    /// Replace the value at the path.
    Replace,
    /// Move the value at `from` to the path.
    Move,
    /// Copy the value at `from` to the path.
    Copy,
    /// Assert that the value at the path equals `value`.
    Test,
}

/// A single RFC-6902 patch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// The operation to perform.
    pub op: PatchOp,
    /// JSON Pointer to the target location.
    pub path: String,
    /// Operand for `add`, `replace`, and `test`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Source location for `move` and `copy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Patch {
    /// An `add` operation.
    #[must_use]
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    /// A `remove` operation.
    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    /// A `replace` operation.
    #[must_use]
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    /// A `move` operation.
    #[must_use]
    pub fn mv(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Move,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    /// A `copy` operation.
    #[must_use]
    pub fn copy(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Copy,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    /// A `test` operation.
    #[must_use]
    pub fn test(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Test,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }
}

/// Apply a sequence of patches to a document in place.
///
/// Operations are applied in order; the first failure aborts with the
/// document left in its partially-patched form, matching the streaming
/// consumption model where each record is applied as it arrives.
pub fn apply(doc: &mut Value, patches: &[Patch]) -> Result<()> {
    for patch in patches {
        apply_one(doc, patch)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, patch: &Patch) -> Result<()> {
    match patch.op {
        PatchOp::Add => {
            let value = operand(patch)?;
            insert(doc, &patch.path, value)
        }
        PatchOp::Remove => take(doc, &patch.path).map(|_| ()),
        PatchOp::Replace => {
            let value = operand(patch)?;
            let target = resolve_mut(doc, &patch.path)?;
            *target = value;
            Ok(())
        }
        PatchOp::Move => {
            let from = source(patch)?;
            let value = take(doc, from)?;
            insert(doc, &patch.path, value)
        }
        PatchOp::Copy => {
            let from = source(patch)?;
            let value = resolve_mut(doc, from)?.clone();
            insert(doc, &patch.path, value)
        }
        PatchOp::Test => {
            let expected = operand(patch)?;
            let actual = resolve_mut(doc, &patch.path)?;
            if *actual == expected {
                Ok(())
            } else {
                Err(bad_patch(format!(
                    "test failed at '{}': expected {expected}, found {actual}",
                    patch.path
                )))
            }
        }
    }
}

fn operand(patch: &Patch) -> Result<Value> {
    patch
        .value
        .clone()
        .ok_or_else(|| bad_patch(format!("'{:?}' requires a value", patch.op)))
}

fn source(patch: &Patch) -> Result<&str> {
    patch
        .from
        .as_deref()
        .ok_or_else(|| bad_patch(format!("'{:?}' requires a from pointer", patch.op)))
}

fn bad_patch(message: String) -> Error {
    Error::configuration(format!("invalid JSON patch: {message}"))
}

/// Split a JSON Pointer into unescaped reference tokens.
fn tokens(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(bad_patch(format!("pointer '{pointer}' must start with /")));
    };
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Resolve a pointer to a mutable reference into the document.
fn resolve_mut<'a>(doc: &'a mut Value, pointer: &str) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in tokens(pointer)? {
        current = match current {
            Value::Object(map) => map
                .get_mut(&token)
                .ok_or_else(|| bad_patch(format!("member '{token}' not found")))?,
            Value::Array(items) => {
                let index = array_index(&token, items.len(), false)?;
                &mut items[index]
            }
            _ => return Err(bad_patch(format!("cannot descend into scalar at '{token}'"))),
        };
    }
    Ok(current)
}

/// Insert a value at the pointer, creating the final member if needed.
fn insert(doc: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let toks = tokens(pointer)?;
    let Some((last, parents)) = toks.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = resolve_tokens_mut(doc, parents)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
            } else {
                let index = array_index(last, items.len(), true)?;
                items.insert(index, value);
            }
            Ok(())
        }
        _ => Err(bad_patch(format!("cannot add to scalar at '{pointer}'"))),
    }
}

/// Remove and return the value at the pointer.
fn take(doc: &mut Value, pointer: &str) -> Result<Value> {
    let toks = tokens(pointer)?;
    let Some((last, parents)) = toks.split_last() else {
        return Err(bad_patch("cannot remove the document root".to_owned()));
    };
    let parent = resolve_tokens_mut(doc, parents)?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| bad_patch(format!("member '{last}' not found"))),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(bad_patch(format!("cannot remove from scalar at '{pointer}'"))),
    }
}

fn resolve_tokens_mut<'a>(doc: &'a mut Value, toks: &[String]) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in toks {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| bad_patch(format!("member '{token}' not found")))?,
            Value::Array(items) => {
                let index = array_index(token, items.len(), false)?;
                &mut items[index]
            }
            _ => return Err(bad_patch(format!("cannot descend into scalar at '{token}'"))),
        };
    }
    Ok(current)
}

fn array_index(token: &str, len: usize, allow_end: bool) -> Result<usize> {
    let index: usize = token
        .parse()
        .map_err(|_| bad_patch(format!("'{token}' is not an array index")))?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if len == 0 && !allow_end {
        return Err(bad_patch(format!("index {index} out of bounds")));
    }
    if index > limit {
        return Err(bad_patch(format!("index {index} out of bounds")));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_replace_remove_round_trip() {
        let mut doc = json!({});
        apply(
            &mut doc,
            &[
                Patch::add("/city", json!("NYC")),
                Patch::add("/temps", json!([70])),
                Patch::add("/temps/-", json!(72)),
                Patch::replace("/city", json!("SF")),
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"city": "SF", "temps": [70, 72]}));

        apply(&mut doc, &[Patch::remove("/temps/0")]).unwrap();
        assert_eq!(doc, json!({"city": "SF", "temps": [72]}));
    }

    #[test]
    fn move_and_copy() {
        let mut doc = json!({"a": {"x": 1}, "b": {}});
        apply(
            &mut doc,
            &[Patch::mv("/a/x", "/b/x"), Patch::copy("/b/x", "/b/y")],
        )
        .unwrap();
        assert_eq!(doc, json!({"a": {}, "b": {"x": 1, "y": 1}}));
    }

    #[test]
    fn test_op_mismatch_fails() {
        let mut doc = json!({"status": "pending"});
        let err = apply(&mut doc, &[Patch::test("/status", json!("approved"))]);
        assert!(err.is_err());
    }

    #[test]
    fn escaped_pointer_tokens() {
        let mut doc = json!({"a/b": 1, "c~d": 2});
        apply(&mut doc, &[Patch::replace("/a~1b", json!(10))]).unwrap();
        apply(&mut doc, &[Patch::replace("/c~0d", json!(20))]).unwrap();
        assert_eq!(doc, json!({"a/b": 10, "c~d": 20}));
    }

    #[test]
    fn wire_format_uses_rfc_names() {
        let patch = Patch::replace("/status", json!("approved"));
        let wire = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            wire,
            json!({"op": "replace", "path": "/status", "value": "approved"})
        );
    }

    #[test]
    fn missing_member_is_an_error() {
        let mut doc = json!({});
        assert!(apply(&mut doc, &[Patch::replace("/nope", json!(1))]).is_err());
    }
}
