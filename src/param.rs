//! Dotted-path parameter resolution over a generic structured value (component A).
//!
//! Mirrors the walk used by the request/rule layers in the teacher's `router.rs`
//! (header/body field lookups), generalized from flat struct fields to an
//! arbitrarily nested JSON-like tree.

use std::collections::BTreeMap;
use std::fmt;

/// A structured value addressable by dotted keys: JSON decoded, form-decoded,
/// XML-decoded or multipart-decoded payloads are all normalized into this shape
/// before being walked.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Scalar(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    pub fn mapping() -> Self {
        Value::Mapping(BTreeMap::new())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Stringify a leaf the way the extractor needs it: scalars pass through,
    /// sub-trees are serialized as canonical JSON.
    pub fn stringify(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Scalar(s) => s.clone(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Scalar(s) => serde_json::Value::String(s.clone()),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Mapping(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build a [`Value`] from a parsed `serde_json::Value`, preserving integers
    /// as decimal strings instead of collapsing them through `f64`.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Scalar(b.to_string()),
            serde_json::Value::Number(n) => Value::Scalar(n.to_string()),
            serde_json::Value::String(s) => Value::Scalar(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Distinguishes "the key does not address anything" from "the key addresses an
/// empty string" — the two must never be conflated (spec §4.1, §8).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parameter node not found: {key}")]
pub struct ParameterNodeError {
    pub key: String,
}

impl ParameterNodeError {
    pub fn new(key: impl Into<String>) -> Self {
        ParameterNodeError { key: key.into() }
    }
}

/// Walk `root` by the dotted segments of `key`.
///
/// At each step the current segment is first tried as a literal key (or index,
/// for sequences); if that fails and more segments remain, the segment is
/// greedily extended with `.<next-segment>` and retried, so that literal keys
/// containing dots are still addressable when no shorter match exists.
pub fn extract<'v>(key: &str, root: &'v Value) -> Result<&'v Value, ParameterNodeError> {
    if key.is_empty() {
        return Ok(root);
    }
    let segments: Vec<&str> = key.split('.').collect();
    walk(&segments, root).ok_or_else(|| ParameterNodeError::new(key))
}

/// Convenience wrapper returning the leaf stringified (see [`Value::stringify`]).
pub fn extract_string(key: &str, root: &Value) -> Result<String, ParameterNodeError> {
    extract(key, root).map(Value::stringify)
}

/// Overwrite the node addressed by `key` with `new_value`, using the same
/// shortest-literal-first walk as [`extract`]. Returns `false` (a no-op) when
/// the key does not address an existing leaf, mirroring `extract`'s failure
/// mode instead of creating new intermediate nodes.
pub fn set(key: &str, root: &mut Value, new_value: Value) -> bool {
    if key.is_empty() {
        *root = new_value;
        return true;
    }
    let segments: Vec<&str> = key.split('.').collect();
    walk_mut(&segments, root, new_value)
}

fn walk_mut(segments: &[&str], node: &mut Value, new_value: Value) -> bool {
    if segments.is_empty() {
        *node = new_value;
        return true;
    }

    match node {
        Value::Mapping(map) => {
            for take in 1..=segments.len() {
                let candidate = segments[..take].join(".");
                let resolves = map
                    .get(&candidate)
                    .map_or(false, |child| walk(&segments[take..], child).is_some());
                if resolves {
                    let child = map.get_mut(&candidate).expect("just checked present");
                    return walk_mut(&segments[take..], child, new_value);
                }
            }
            false
        }
        Value::Sequence(items) => {
            let idx: usize = match segments[0].parse() {
                Ok(i) => i,
                Err(_) => return false,
            };
            match items.get_mut(idx) {
                Some(child) => walk_mut(&segments[1..], child, new_value),
                None => false,
            }
        }
        _ => false,
    }
}

fn walk<'v>(segments: &[&str], node: &'v Value) -> Option<&'v Value> {
    if segments.is_empty() {
        return Some(node);
    }

    match node {
        Value::Mapping(map) => {
            // Try the shortest literal match first, then greedily extend across
            // the dot boundary so that keys containing literal dots are found
            // when no shorter path resolves.
            for take in 1..=segments.len() {
                let candidate = segments[..take].join(".");
                if let Some(child) = map.get(&candidate) {
                    if let Some(found) = walk(&segments[take..], child) {
                        return Some(found);
                    }
                }
            }
            None
        }
        Value::Sequence(items) => {
            let idx: usize = segments[0].parse().ok()?;
            let child = items.get(idx)?;
            walk(&segments[1..], child)
        }
        _ => None,
    }
}


impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}
