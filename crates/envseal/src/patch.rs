//! RFC 6902 style JSON patches, limited to `add`, `remove` and `replace`.
//!
//! Pending env edits and changeset history are stored as patches over the
//! JSON form of an environment. Patches are produced by [`diff`], so arrays
//! are replaced whole rather than edited element by element.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub op: PatchOp,
    /// JSON pointer into the document.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOperation {
    pub fn add(path: String, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: String) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    pub fn replace(path: String, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }
}

pub type Patch = Vec<PatchOperation>;

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn invalid(msg: impl Into<String>) -> ClientError {
    ClientError::InvalidOperation(msg.into())
}

/// Operations turning `from` into `to`.
pub fn diff(from: &Value, to: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_at(String::new(), from, to, &mut ops);
    ops
}

fn diff_at(path: String, from: &Value, to: &Value, ops: &mut Patch) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, a_val) in a {
                let child = format!("{}/{}", path, escape(key));
                match b.get(key) {
                    Some(b_val) => diff_at(child, a_val, b_val, ops),
                    None => ops.push(PatchOperation::remove(child)),
                }
            }
            for (key, b_val) in b {
                if !a.contains_key(key) {
                    ops.push(PatchOperation::add(
                        format!("{}/{}", path, escape(key)),
                        b_val.clone(),
                    ));
                }
            }
        }
        (a, b) if a == b => {}
        (_, b) => ops.push(PatchOperation::replace(path, b.clone())),
    }
}

/// Apply `patch` to a copy of `doc`.
pub fn apply(doc: &Value, patch: &[PatchOperation]) -> Result<Value> {
    let mut out = doc.clone();
    for op in patch {
        apply_one(&mut out, op)?;
    }
    Ok(out)
}

fn apply_one(doc: &mut Value, op: &PatchOperation) -> Result<()> {
    if op.path.is_empty() {
        return match op.op {
            PatchOp::Remove => Err(invalid("cannot remove the document root")),
            PatchOp::Add | PatchOp::Replace => {
                *doc = op
                    .value
                    .clone()
                    .ok_or_else(|| invalid(format!("{:?} without value", op.op)))?;
                Ok(())
            }
        };
    }

    let tokens: Vec<String> = op
        .path
        .strip_prefix('/')
        .ok_or_else(|| invalid(format!("bad pointer {}", op.path)))?
        .split('/')
        .map(unescape)
        .collect();
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| invalid(format!("bad pointer {}", op.path)))?;

    let mut target = doc;
    for token in parents {
        target = target
            .as_object_mut()
            .and_then(|obj| obj.get_mut(token))
            .ok_or_else(|| invalid(format!("{} does not exist", op.path)))?;
    }
    let obj: &mut Map<String, Value> = target
        .as_object_mut()
        .ok_or_else(|| invalid(format!("parent of {} is not an object", op.path)))?;

    match op.op {
        PatchOp::Add => {
            let value = op.value.clone().ok_or_else(|| invalid("add without value"))?;
            obj.insert(last.clone(), value);
        }
        PatchOp::Replace => {
            let value = op.value.clone().ok_or_else(|| invalid("replace without value"))?;
            let slot = obj
                .get_mut(last)
                .ok_or_else(|| invalid(format!("{} does not exist", op.path)))?;
            *slot = value;
        }
        PatchOp::Remove => {
            obj.remove(last)
                .ok_or_else(|| invalid(format!("{} does not exist", op.path)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_then_apply_reaches_target() {
        let from = json!({"variables": {"A": {"val": "1"}, "B": {"val": "2"}}});
        let to = json!({"variables": {"A": {"val": "3"}, "C": {"val": "4"}}});

        let patch = diff(&from, &to);
        assert_eq!(apply(&from, &patch).unwrap(), to);

        let reverse = diff(&to, &from);
        assert_eq!(apply(&to, &reverse).unwrap(), from);
    }

    #[test]
    fn test_diff_of_equal_docs_is_empty() {
        let doc = json!({"variables": {"A": {"val": "1"}}});
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_pointer_escaping() {
        let from = json!({"variables": {}});
        let to = json!({"variables": {"a/b~c": {"val": "x"}}});

        let patch = diff(&from, &to);
        assert_eq!(patch[0].path, "/variables/a~1b~0c");
        assert_eq!(apply(&from, &patch).unwrap(), to);
    }

    #[test]
    fn test_replace_missing_path_fails() {
        let doc = json!({"variables": {}});
        let patch = vec![PatchOperation::replace("/variables/A".into(), json!("x"))];
        assert!(apply(&doc, &patch).is_err());
    }

    #[test]
    fn test_wire_form() {
        let op = PatchOperation::remove("/variables/A".into());
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "remove", "path": "/variables/A"})
        );
    }
}
