use std::collections::BTreeMap;

use flowline_types::NodeId;
use serde_json::{Map, Value};

use crate::EngineError;

/// Resolves a node's params against the outputs of earlier nodes.
///
/// Two reference forms are supported, and both fail fast when the target
/// is missing:
/// - an object `{"mode": "ref", "nodeId": "...", "path": "a.b.0"}`
///   anywhere in the params tree is replaced by the referenced value;
/// - a string containing `{{nodeId.path}}` placeholders. A string that is
///   exactly one placeholder becomes the referenced value itself; mixed
///   text gets string interpolation.
pub fn resolve_params(
    node_id: &NodeId,
    params: &Value,
    outputs: &BTreeMap<NodeId, Value>,
) -> Result<Value, EngineError> {
    resolve_value(node_id, params, outputs)
}

fn resolve_value(
    node_id: &NodeId,
    value: &Value,
    outputs: &BTreeMap<NodeId, Value>,
) -> Result<Value, EngineError> {
    match value {
        Value::Object(map) => {
            if let Some(reference) = as_ref_object(map) {
                return lookup(node_id, &reference.0, &reference.1, outputs);
            }
            let mut out = Map::new();
            for (key, val) in map {
                out.insert(key.clone(), resolve_value(node_id, val, outputs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve_value(node_id, item, outputs))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(resolved))
        }
        Value::String(s) => resolve_string(node_id, s, outputs),
        other => Ok(other.clone()),
    }
}

fn as_ref_object(map: &Map<String, Value>) -> Option<(String, String)> {
    if map.get("mode").and_then(Value::as_str) != Some("ref") {
        return None;
    }
    let node = map.get("nodeId").and_then(Value::as_str)?;
    let path = map.get("path").and_then(Value::as_str).unwrap_or("");
    Some((node.to_string(), path.to_string()))
}

fn resolve_string(
    node_id: &NodeId,
    s: &str,
    outputs: &BTreeMap<NodeId, Value>,
) -> Result<Value, EngineError> {
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }

    // whole-string placeholder keeps the referenced value's type
    let trimmed = s.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{") {
        let inner = trimmed[2..trimmed.len() - 2].trim();
        let (source, path) = split_reference(inner);
        return lookup(node_id, source, path, outputs);
    }

    let mut result = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(EngineError::MissingReference {
                node_id: node_id.clone(),
                reference: s.to_string(),
            });
        };
        let inner = after[..end].trim();
        let (source, path) = split_reference(inner);
        let value = lookup(node_id, source, path, outputs)?;
        match value {
            Value::String(s) => result.push_str(&s),
            other => result.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    Ok(Value::String(result))
}

fn split_reference(inner: &str) -> (&str, &str) {
    match inner.split_once('.') {
        Some((source, path)) => (source, path),
        None => (inner, ""),
    }
}

fn lookup(
    node_id: &NodeId,
    source: &str,
    path: &str,
    outputs: &BTreeMap<NodeId, Value>,
) -> Result<Value, EngineError> {
    let missing = || EngineError::MissingReference {
        node_id: node_id.clone(),
        reference: if path.is_empty() {
            source.to_string()
        } else {
            format!("{}.{}", source, path)
        },
    };

    let source_id = NodeId::new(source).map_err(|_| missing())?;
    let mut current = outputs.get(&source_id).ok_or_else(missing)?;

    if !path.is_empty() {
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment).ok_or_else(missing)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().map_err(|_| missing())?;
                    items.get(index).ok_or_else(missing)?
                }
                _ => return Err(missing()),
            };
        }
    }

    Ok(current.clone())
}
