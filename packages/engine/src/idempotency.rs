use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use flowline_types::{
    canonical_sha256, md5_hex, ExecutionId, NodeExecutionResult, NodeId,
};
use serde_json::{json, Value};

/// Hash of the intended side effect: the operation plus its fully
/// resolved params, canonicalized. Two invocations with the same hash are
/// the same request.
pub fn request_hash(op: &str, resolved_params: &Value) -> String {
    canonical_sha256(&json!({"op": op, "params": resolved_params}))
}

/// User-supplied key wins; otherwise derived from the execution, node and
/// request so a redelivered job lands on the same cache row.
pub fn idempotency_key(
    user_key: Option<&str>,
    execution_id: &ExecutionId,
    node_id: &NodeId,
    request_hash: &str,
) -> String {
    match user_key {
        Some(key) => key.to_string(),
        None => md5_hex(&format!("{}|{}|{}", execution_id, node_id, request_hash)),
    }
}

/// Storage seam for the idempotency cache. The lookup contract: a row is
/// reusable only when unexpired and its `result_hash` matches the current
/// request hash; a stale or mismatched row is ignored, not an error.
pub trait IdempotencyStore: Send + Sync {
    fn get(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        idempotency_key: &str,
    ) -> Option<NodeExecutionResult>;

    fn put(&self, result: NodeExecutionResult);
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    rows: RwLock<HashMap<(ExecutionId, NodeId, String), NodeExecutionResult>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        idempotency_key: &str,
    ) -> Option<NodeExecutionResult> {
        self.rows
            .read()
            .unwrap()
            .get(&(*execution_id, node_id.clone(), idempotency_key.to_string()))
            .cloned()
    }

    fn put(&self, result: NodeExecutionResult) {
        self.rows.write().unwrap().insert(
            (
                result.execution_id,
                result.node_id.clone(),
                result.idempotency_key.clone(),
            ),
            result,
        );
    }
}

/// Reuse decision given a cached row.
pub fn reusable(row: &NodeExecutionResult, request_hash: &str, now: DateTime<Utc>) -> bool {
    row.expires_at > now && row.result_hash == request_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn request_hash_ignores_key_order() {
        let a = request_hash("send", &json!({"b": 2, "a": 1}));
        let b = request_hash("send", &json!({"a": 1, "b": 2}));
        assert_eq!(a, b);

        let c = request_hash("send", &json!({"a": 1, "b": 3}));
        assert_ne!(a, c);
        let d = request_hash("delete", &json!({"a": 1, "b": 2}));
        assert_ne!(a, d);
    }

    #[test]
    fn user_key_takes_precedence() {
        let execution_id = ExecutionId::generate();
        let node_id = NodeId::new("send").unwrap();

        let derived = idempotency_key(None, &execution_id, &node_id, "hash");
        assert_eq!(derived.len(), 32);

        let user = idempotency_key(Some("invoice-42"), &execution_id, &node_id, "hash");
        assert_eq!(user, "invoice-42");
    }

    #[test]
    fn reuse_requires_match_and_freshness() {
        let row = NodeExecutionResult {
            execution_id: ExecutionId::generate(),
            node_id: NodeId::new("send").unwrap(),
            idempotency_key: "k".to_string(),
            result_hash: "hash-a".to_string(),
            result_data: json!({"ok": true}),
            expires_at: Utc::now() + Duration::hours(1),
        };

        assert!(reusable(&row, "hash-a", Utc::now()));
        assert!(!reusable(&row, "hash-b", Utc::now()));
        assert!(!reusable(&row, "hash-a", Utc::now() + Duration::hours(2)));
    }
}
