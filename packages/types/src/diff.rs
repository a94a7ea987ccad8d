use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{canonical_json, ConnectionId, Graph, Node, NodeId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreakingCategory {
    Op,
    Params,
    Connection,
    Edge,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakingChange {
    pub node_id: NodeId,
    pub description: String,
    pub category: BreakingCategory,
}

/// Structural difference between two graphs. `added`/`removed`/`modified`
/// partition the symmetric difference of the canonicalized node sets;
/// `diff(a, a)` has no changes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDiffSummary {
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    pub modified_nodes: Vec<NodeId>,
    pub added_edges: Vec<String>,
    pub removed_edges: Vec<String>,
    pub metadata_changed: bool,
    pub breaking_changes: Vec<BreakingChange>,
}

impl WorkflowDiffSummary {
    pub fn has_changes(&self) -> bool {
        !self.added_nodes.is_empty()
            || !self.removed_nodes.is_empty()
            || !self.modified_nodes.is_empty()
            || !self.added_edges.is_empty()
            || !self.removed_edges.is_empty()
            || self.metadata_changed
    }

    pub fn is_breaking(&self) -> bool {
        !self.breaking_changes.is_empty()
    }
}

/// Diff two graphs without connection-provider knowledge: any
/// `connectionId` change is classified as breaking.
pub fn diff_graphs(a: &Graph, a_meta: &Value, b: &Graph, b_meta: &Value) -> WorkflowDiffSummary {
    diff_graphs_with(a, a_meta, b, b_meta, |_| None)
}

/// Diff two graphs. `provider_of` resolves a connection id to its provider
/// so a swap between two connections of the same provider is not flagged
/// as breaking; unresolvable connections are treated as a provider change.
pub fn diff_graphs_with(
    a: &Graph,
    a_meta: &Value,
    b: &Graph,
    b_meta: &Value,
    provider_of: impl Fn(&ConnectionId) -> Option<String>,
) -> WorkflowDiffSummary {
    let a_nodes: BTreeMap<&NodeId, &Node> = a.nodes.iter().map(|n| (&n.id, n)).collect();
    let b_nodes: BTreeMap<&NodeId, &Node> = b.nodes.iter().map(|n| (&n.id, n)).collect();

    let mut summary = WorkflowDiffSummary::default();

    for id in b_nodes.keys() {
        if !a_nodes.contains_key(*id) {
            summary.added_nodes.push((*id).clone());
        }
    }

    for (id, old) in &a_nodes {
        match b_nodes.get(*id) {
            None => {
                summary.removed_nodes.push((*id).clone());
                summary.breaking_changes.push(BreakingChange {
                    node_id: (*id).clone(),
                    description: format!("node {} removed; dependent edges break", id),
                    category: BreakingCategory::Edge,
                });
            }
            Some(new) => {
                if canonical_json(&old.canonical()) != canonical_json(&new.canonical()) {
                    summary.modified_nodes.push((*id).clone());
                    classify_node_change(old, new, &provider_of, &mut summary.breaking_changes);
                }
            }
        }
    }

    let a_edges: BTreeMap<String, ()> = a.edges.iter().map(|e| (e.key(), ())).collect();
    let b_edges: BTreeMap<String, ()> = b.edges.iter().map(|e| (e.key(), ())).collect();
    summary.added_edges = b_edges
        .keys()
        .filter(|k| !a_edges.contains_key(*k))
        .cloned()
        .collect();
    summary.removed_edges = a_edges
        .keys()
        .filter(|k| !b_edges.contains_key(*k))
        .cloned()
        .collect();

    summary.metadata_changed = canonical_json(a_meta) != canonical_json(b_meta);

    summary
}

fn classify_node_change(
    old: &Node,
    new: &Node,
    provider_of: &impl Fn(&ConnectionId) -> Option<String>,
    breaking: &mut Vec<BreakingChange>,
) {
    if old.op != new.op {
        breaking.push(BreakingChange {
            node_id: old.id.clone(),
            description: format!("operation changed from {} to {}", old.op, new.op),
            category: BreakingCategory::Op,
        });
    }

    // a parameter present before and absent now is treated as a required
    // parameter removal
    if let (Value::Object(old_params), Value::Object(new_params)) = (&old.params, &new.params) {
        for key in old_params.keys() {
            if !new_params.contains_key(key) {
                breaking.push(BreakingChange {
                    node_id: old.id.clone(),
                    description: format!("required parameter {} removed", key),
                    category: BreakingCategory::Params,
                });
            }
        }
    }

    if old.connection_id != new.connection_id {
        let old_provider = old.connection_id.as_ref().and_then(provider_of);
        let new_provider = new.connection_id.as_ref().and_then(provider_of);
        let same_provider = matches!(
            (&old_provider, &new_provider),
            (Some(a), Some(b)) if a == b
        );
        if !same_provider {
            breaking.push(BreakingChange {
                node_id: old.id.clone(),
                description: "connection changed to a different provider".to_string(),
                category: BreakingCategory::Connection,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;
    use serde_json::json;

    fn node(id: &str, op: &str, params: Value) -> Node {
        Node {
            id: NodeId::new(id).unwrap(),
            kind: if id == "start" {
                NodeKind::Trigger
            } else {
                NodeKind::Action
            },
            app: "sheets".to_string(),
            op: op.to_string(),
            params,
            connection_id: None,
        }
    }

    fn graph(nodes: Vec<Node>) -> Graph {
        Graph {
            nodes,
            edges: vec![],
        }
    }

    #[test]
    fn self_diff_has_no_changes() {
        let g = graph(vec![node("start", "poll", json!({"sheet": "s1"}))]);
        let diff = diff_graphs(&g, &json!({}), &g, &json!({}));
        assert!(!diff.has_changes());
        assert!(!diff.is_breaking());
    }

    #[test]
    fn added_removed_modified_partition() {
        let a = graph(vec![
            node("start", "poll", json!({})),
            node("keep", "read", json!({"range": "A1"})),
            node("gone", "read", json!({})),
        ]);
        let b = graph(vec![
            node("start", "poll", json!({})),
            node("keep", "read", json!({"range": "B2"})),
            node("fresh", "write", json!({})),
        ]);

        let diff = diff_graphs(&a, &json!({}), &b, &json!({}));
        assert_eq!(diff.added_nodes, vec![NodeId::new("fresh").unwrap()]);
        assert_eq!(diff.removed_nodes, vec![NodeId::new("gone").unwrap()]);
        assert_eq!(diff.modified_nodes, vec![NodeId::new("keep").unwrap()]);
        // the three sets are disjoint
        assert!(!diff.added_nodes.contains(&NodeId::new("keep").unwrap()));
        assert!(!diff.removed_nodes.contains(&NodeId::new("fresh").unwrap()));
    }

    #[test]
    fn removed_node_is_breaking() {
        let a = graph(vec![node("start", "poll", json!({})), node("x", "read", json!({}))]);
        let b = graph(vec![node("start", "poll", json!({}))]);

        let diff = diff_graphs(&a, &json!({}), &b, &json!({}));
        assert_eq!(diff.breaking_changes.len(), 1);
        assert_eq!(diff.breaking_changes[0].category, BreakingCategory::Edge);
    }

    #[test]
    fn op_change_is_breaking() {
        let a = graph(vec![node("start", "poll", json!({}))]);
        let b = graph(vec![node("start", "subscribe", json!({}))]);

        let diff = diff_graphs(&a, &json!({}), &b, &json!({}));
        assert_eq!(diff.breaking_changes.len(), 1);
        assert_eq!(diff.breaking_changes[0].category, BreakingCategory::Op);
    }

    #[test]
    fn removed_param_is_breaking_added_param_is_not() {
        let a = graph(vec![node("start", "poll", json!({"sheet": "s1"}))]);
        let b = graph(vec![node("start", "poll", json!({"sheet": "s1", "tab": 2}))]);

        let diff = diff_graphs(&a, &json!({}), &b, &json!({}));
        assert!(diff.has_changes());
        assert!(!diff.is_breaking());

        let diff = diff_graphs(&b, &json!({}), &a, &json!({}));
        assert_eq!(diff.breaking_changes.len(), 1);
        assert_eq!(diff.breaking_changes[0].category, BreakingCategory::Params);
    }

    #[test]
    fn connection_swap_same_provider_is_not_breaking() {
        let conn_a = ConnectionId::generate();
        let conn_b = ConnectionId::generate();

        let mut old = node("start", "poll", json!({}));
        old.connection_id = Some(conn_a);
        let mut new = node("start", "poll", json!({}));
        new.connection_id = Some(conn_b);

        let a = graph(vec![old]);
        let b = graph(vec![new]);

        let diff = diff_graphs_with(&a, &json!({}), &b, &json!({}), |_| {
            Some("slack".to_string())
        });
        assert!(diff.has_changes());
        assert!(!diff.is_breaking());

        // unresolvable provider counts as a provider change
        let diff = diff_graphs(&a, &json!({}), &b, &json!({}));
        assert_eq!(diff.breaking_changes.len(), 1);
        assert_eq!(
            diff.breaking_changes[0].category,
            BreakingCategory::Connection
        );
    }

    #[test]
    fn metadata_change_detected() {
        let g = graph(vec![node("start", "poll", json!({}))]);
        let diff = diff_graphs(&g, &json!({"label": "a"}), &g, &json!({"label": "b"}));
        assert!(diff.metadata_changed);
        assert!(diff.has_changes());
        assert!(!diff.is_breaking());
    }

    #[test]
    fn edge_diff_falls_back_to_endpoints() {
        use crate::Edge;

        let nodes = vec![
            node("start", "poll", json!({})),
            node("a", "read", json!({})),
            node("b", "read", json!({})),
        ];
        let a = Graph {
            nodes: nodes.clone(),
            edges: vec![Edge {
                id: None,
                from: NodeId::new("start").unwrap(),
                to: NodeId::new("a").unwrap(),
            }],
        };
        let b = Graph {
            nodes,
            edges: vec![Edge {
                id: None,
                from: NodeId::new("start").unwrap(),
                to: NodeId::new("b").unwrap(),
            }],
        };

        let diff = diff_graphs(&a, &json!({}), &b, &json!({}));
        assert_eq!(diff.added_edges, vec!["start->b".to_string()]);
        assert_eq!(diff.removed_edges, vec!["start->a".to_string()]);
    }
}
